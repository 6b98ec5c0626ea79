use clap::{Parser, Subcommand};
use client::game::GameView;
use client::input::{parse_chat_line, parse_play_line, ChatInput};
use client::network::{parse_address, BrokerClient, SessionClient};
use log::{info, warn};
use shared::protocol::GameEvent;
use shared::{ChannelConfig, Delimiter, GameIntent, SessionKind};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Paddle movement for `up`/`down` in play mode
const PADDLE_STEP: f32 = 40.0;
/// Print the scoreboard every this many snapshots
const SCOREBOARD_EVERY: u64 = 60;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8765")]
    server: String,

    /// Frame delimiter: newline or pipe
    #[arg(short = 'd', long, default_value = "newline")]
    delimiter: Delimiter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List running sessions
    List,
    /// Create a session
    Create {
        /// echo or game; the broker's default when omitted
        #[arg(short, long)]
        kind: Option<SessionKind>,
    },
    /// Join an echo session and chat over stdin (`/name <name>`, `/quit`)
    Join { server_id: u64 },
    /// Stop every session
    Nuke,
    /// Send a text message to the broker itself
    Send { text: String },
    /// Join a game session and steer the paddle over stdin (a y value, `up`, `down`, `quit`)
    Play { server_id: u64 },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ChannelConfig::with_delimiter(args.delimiter);
    let (host, port) = parse_address(&args.server)?;

    info!("Connecting to broker at {}:{}", host, port);
    let mut broker = BrokerClient::connect(&host, port, config.clone()).await?;

    match args.command {
        Command::List => {
            let servers = broker.list().await?;
            if servers.is_empty() {
                println!("No sessions running");
            }
            for server in servers {
                println!(
                    "#{} {} {} ({} clients)",
                    server.id, server.kind, server.address, server.clients
                );
            }
        }
        Command::Create { kind } => {
            let created = broker.create(kind).await?;
            println!("{}: #{} at {}", created.message, created.server_id, created.address);
        }
        Command::Nuke => {
            println!("{}", broker.nuke().await?.message);
        }
        Command::Send { text } => {
            println!("{}", broker.message(&text).await?.message);
        }
        Command::Join { server_id } => {
            let joined = broker.join(server_id).await?;
            println!("{}", joined.message);
            broker.close().await;

            let session = SessionClient::join(&joined, config).await?;
            chat(session).await?;
            return Ok(());
        }
        Command::Play { server_id } => {
            let joined = broker.join(server_id).await?;
            println!("{}", joined.message);
            broker.close().await;

            let session = SessionClient::join(&joined, config).await?;
            play(session).await?;
            return Ok(());
        }
    }

    broker.close().await;
    Ok(())
}

/// Relays stdin lines to an echo session and prints everything it sends back.
async fn chat(mut session: SessionClient) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                match parse_chat_line(&line) {
                    Some(ChatInput::Message(text)) => session.send_message(&text).await?,
                    Some(ChatInput::SetName(name)) => session.set_name(&name).await?,
                    Some(ChatInput::Quit) => break,
                    None => {}
                }
            }
            message = session.recv() => match message {
                Some(message) => println!("{}", message),
                None => {
                    warn!("Session closed the connection");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await;
    Ok(())
}

/// Claims a slot in a game session and follows it until it ends.
async fn play(mut session: SessionClient) -> Result<(), Box<dyn std::error::Error>> {
    let mut view = GameView::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    session.send_intent(&GameIntent::AskName).await?;

    while !view.is_over() {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match parse_play_line(&line, view.own_paddle(), PADDLE_STEP) {
                    Some(GameIntent::Close) => break,
                    Some(intent) => session.send_intent(&intent).await?,
                    None => {}
                },
                None => stdin_open = false,
            },
            message = session.recv() => {
                let message = match message {
                    Some(message) => message,
                    None => {
                        warn!("Game session closed the connection");
                        break;
                    }
                };
                let event = match GameEvent::from_message(message) {
                    Some(event) => event,
                    None => continue,
                };

                match &event {
                    GameEvent::PlayerName(name) => println!("You are {}", name),
                    GameEvent::Start => println!("Game started"),
                    GameEvent::Over { winner } => println!("Game over, {} wins", winner),
                    GameEvent::Error(error) => println!("Error: {}", error),
                    GameEvent::Snapshot(_) => {}
                }
                view.apply(event);

                if view.snapshots > 0 && view.snapshots % SCOREBOARD_EVERY == 0 {
                    println!("{}", view.scoreboard());
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("{}", view.scoreboard());
    session.close().await;
    Ok(())
}
