use bytes::Bytes;
use clap::Parser;
use client::input::{parse_command, Command, USAGE};
use client::network::{Client, ClientHandler};
use log::{debug, info, warn};
use shared::{Avatar, NetConfig, DEFAULT_PORT};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::time::{interval, sleep, MissedTickBehavior};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    server: String,

    /// Server port
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Network ticks per second
    #[arg(short = 't', long, default_value = "60")]
    tick_rate: u32,
}

/// Logs what the server sends; avatars are decoded from their field bytes
#[derive(Default)]
struct LogHandler;

impl ClientHandler for LogHandler {
    fn welcomed(&mut self, peer_id: u32) {
        info!("Joined as player {}", peer_id);
        info!("{}", USAGE);
    }

    fn class_mapped(&mut self, class_id: i32, name: &str) {
        debug!("Server class {} = {}", class_id, name);
    }

    fn chat_received(&mut self, message: &str) {
        println!("{}", message);
    }

    fn field_changed(&mut self, field_id: u32, bytes: Option<&Bytes>) {
        match bytes.map(|bytes| Avatar::from_field_bytes(bytes)) {
            Some(Ok(avatar)) => debug!(
                "Avatar {} at ({:.1}, {:.1}) aiming at ({:.1}, {:.1})",
                avatar.id, avatar.x, avatar.y, avatar.aim_x, avatar.aim_y
            ),
            Some(Err(e)) => warn!("Field {} is not an avatar: {}", field_id, e),
            None => info!("Avatar {} left", field_id),
        }
    }

    fn peer_lost(&mut self) {
        warn!("Connection to server lost");
    }
}

enum SessionEnd {
    Lost,
    Quit,
}

/// Ticks the client and forwards typed commands until the server is lost or the
/// player quits
async fn run_session(
    client: &mut Client<LogHandler>,
    lines: &mut Lines<BufReader<Stdin>>,
    tick_rate: u32,
) -> Result<SessionEnd, Box<dyn std::error::Error>> {
    let mut tick_interval = interval(Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32));
    tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick_interval.tick() => {
                client.tick();
                if !client.is_connected() {
                    return Ok(SessionEnd::Lost);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(SessionEnd::Quit);
                };
                let result = match parse_command(&line) {
                    Some(Command::Key(keycode)) => client.send_keystroke(keycode),
                    Some(Command::Mouse { x, y }) => client.send_mouse(x, y),
                    Some(Command::Chat(message)) => client.send_chat(&message),
                    Some(Command::Quit) => return Ok(SessionEnd::Quit),
                    None => {
                        if !line.trim().is_empty() {
                            println!("{}", USAGE);
                        }
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!("Failed to send: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(SessionEnd::Quit),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let server: SocketAddr = tokio::net::lookup_host((args.server.as_str(), args.port))
        .await?
        .next()
        .ok_or_else(|| format!("could not resolve {}", args.server))?;

    info!("Starting client...");
    info!("Connecting to: {}", server);

    let mut client = Client::new(NetConfig::default(), LogHandler);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        if let Err(e) = client.connect(server).await {
            warn!(
                "Could not connect to {}: {}, retrying in {:?}",
                server, e, RECONNECT_DELAY
            );
            sleep(RECONNECT_DELAY).await;
            continue;
        }

        match run_session(&mut client, &mut lines, args.tick_rate).await? {
            SessionEnd::Lost => {
                info!("Reconnecting in {:?}", RECONNECT_DELAY);
                sleep(RECONNECT_DELAY).await;
            }
            SessionEnd::Quit => break,
        }
    }

    client.disconnect().await;
    info!("Disconnected");

    Ok(())
}
