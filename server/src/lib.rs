//! # Game Server Library
//!
//! This library provides the authoritative side of the game-state synchronization
//! layer. It accepts peers over UDP, feeds their input to a simulation, and keeps
//! every peer's copy of the world in step with the server's.
//!
//! ## Core Responsibilities
//!
//! ### Connection Management
//! Handles the complete lifecycle of peer connections including:
//! - Accepting connection requests and assigning peer IDs that are never reused
//! - Announcing the class table and welcoming each new peer
//! - Refusing peers beyond capacity and replacing stale sessions
//! - Graceful disconnects and cleanup of lost peers
//!
//! ### State Replication
//! Every tick the server captures a snapshot of the simulation's replicated fields and
//! sends each peer a diff from the last snapshot that peer acknowledged. Peers that
//! never acknowledged anything, or fell too far behind, get a full snapshot instead.
//!
//! ### Input and Chat Dispatch
//! Keystrokes and mouse moves are handed to the simulation; chat messages are
//! forwarded to it and relayed to every peer.
//!
//! ## Architecture Design
//!
//! ### Single Simulation Thread
//! All session logic runs synchronously inside `Server::tick`. Each connection has its
//! own receive loop task, but those tasks only push into a shared queue, so the peer
//! table and snapshot history are never touched concurrently.
//!
//! ### Unreliable Diffs, Reliable Events
//! Game-state diffs are sent unreliably: the snapshot IDs carried in every diff make
//! a lost one harmless, since the next tick supersedes it. Handshake packets and chat
//! use the reliable channel.
//!
//! ## Module Organization
//!
//! ### Connection Manager Module (`connection_manager`)
//! The listening socket, the peer table, unicast and broadcast sends.
//!
//! ### Network Module (`network`)
//! The per-tick session (`Server`) and the `Simulation` trait it drives.
//!
//! ### Game Module (`game`)
//! A small demo simulation with one avatar per peer.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::game::World;
//! use server::network::Server;
//! use shared::NetConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(
//!         "0.0.0.0:55556".parse()?,
//!         NetConfig::default(),
//!         World::new(),
//!     )
//!     .await?;
//!
//!     // Ticks at 30Hz until Ctrl+C, then disconnects everyone
//!     server.run(30).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod connection_manager;
pub mod game;
pub mod network;
