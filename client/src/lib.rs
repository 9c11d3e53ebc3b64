//! # Game Client Library
//!
//! This library provides the client side of the game-state synchronization layer. It
//! connects to a server over UDP, keeps a mirror of the server's world up to date
//! from the diffs the server sends, and forwards the player's input.
//!
//! ## Architecture Overview
//!
//! ### Snapshot Mirroring
//! The server sends a diff every tick, tagged with the snapshot it applies to and the
//! snapshot it produces. The client applies diffs whose base it still holds and
//! acknowledges each result, so the server can diff against it next time. Duplicate
//! and outdated diffs are ignored; a diff against an unknown base makes the client ask
//! for a full snapshot instead of patching inconsistent state.
//!
//! ### Input Delivery
//! Keystrokes and chat are discrete events and use the reliable channel. Mouse moves
//! are continuous and go out unreliably, since the next one replaces a lost one.
//!
//! ### Connection Loss
//! Losing the server is reported to the `ClientHandler` and leaves the client ready
//! for another `connect()`, to the same or a different address.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! The client session (`Client`) and the `ClientHandler` trait it reports to.
//!
//! ### Input Module (`input`)
//! Parsing of the commands a player types.

pub mod input;
pub mod network;
