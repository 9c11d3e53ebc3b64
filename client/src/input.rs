//! Turns lines typed by the player into commands

/// One line of player input
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `/key <c>`: a single keystroke
    Key(u8),
    /// `/mouse <x> <y>`: a pointer position
    Mouse { x: f64, y: f64 },
    /// `/quit`
    Quit,
    /// Anything else is chat
    Chat(String),
}

pub const USAGE: &str = "Commands: /key <c>, /mouse <x> <y>, /quit; anything else is chat";

/// Parses one line; returns `None` for blank lines and malformed commands
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut words = line.split_whitespace();
    match words.next() {
        Some("/key") => match (words.next(), words.next()) {
            (Some(key), None) if key.len() == 1 => Some(Command::Key(key.as_bytes()[0])),
            _ => None,
        },
        Some("/mouse") => {
            let x = words.next()?.parse().ok()?;
            let y = words.next()?.parse().ok()?;
            match words.next() {
                None => Some(Command::Mouse { x, y }),
                Some(_) => None,
            }
        }
        Some("/quit") => Some(Command::Quit),
        _ => Some(Command::Chat(line.to_string())),
    }
}
