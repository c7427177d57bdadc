//! ringr CLI
//!
//! Headless-Client: ruft an, tritt einem Raum bei oder wartet auf Anrufe.
//! Steuerung über stdin (`accept`, `reject`, `hangup`, `mute`, `unmute`, `quit`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use ringr::call_engine::{
    CallController, CallHandle, CallNotice, HeadlessMedia, MachineConfig, NoPush,
    RtcTransportFactory,
};
use ringr::config::{AddressingMode, Config};
use ringr::signaling::{RelayClient, SignalingClient};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "ringr")]
#[command(about = "P2P audio/video calls over a signaling relay")]
struct Cli {
    /// Relay URL (überschreibt Config und SIGNALING_URL)
    #[arg(long)]
    relay: Option<String>,

    /// Anzeigename bei der Registrierung
    #[arg(short, long)]
    username: Option<String>,

    #[arg(long)]
    video: bool,

    #[arg(long)]
    auto_answer: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Ruft einen Endpoint direkt an
    Call { endpoint: String },
    /// Tritt einem Raum bei; der zweite Teilnehmer wird angerufen
    Room { room_id: String },
    /// Wartet auf eingehende Anrufe
    Listen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ringr::init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load().context("failed to load config")?;
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }
    if cli.video {
        config.media.video = true;
    }
    if cli.auto_answer {
        config.auto_answer = true;
    }
    if matches!(cli.command, Command::Room { .. }) {
        config.addressing = AddressingMode::Room;
    }

    let mut client = SignalingClient::new(config.relay_url.clone(), config.heartbeat_interval());
    if let Some(username) = cli.username {
        client = client.with_username(username);
    }
    let relay = Arc::new(client);

    let (controller, handle) = CallController::new(
        MachineConfig::from(&config),
        Arc::clone(&relay),
        Arc::new(RtcTransportFactory::new(&config.ice_servers)),
        Arc::new(HeadlessMedia),
        Arc::new(NoPush),
    );
    let mut notices = handle.subscribe();
    let controller_task = tokio::spawn(controller.run());

    let endpoint_id = relay
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", config.relay_url))?;
    println!("Registered as {}", endpoint_id);

    let exit_after_call = !matches!(cli.command, Command::Listen);
    match cli.command {
        Command::Call { endpoint } => {
            let session_id = handle.place_call(&endpoint).await?;
            println!("Calling {} (session {})", endpoint, session_id);
        }
        Command::Room { room_id } => handle.join_room(&room_id).await?,
        Command::Listen => println!("Waiting for calls..."),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_command(&handle, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    print_notice(&notice);
                    if exit_after_call && ends_session(&notice) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await;
    controller_task.await.context("controller task failed")?;
    Ok(())
}

/// Führt einen stdin-Befehl aus; `false` beendet die Schleife
async fn run_command(handle: &CallHandle, command: &str) -> bool {
    let result = match command {
        "" => return true,
        "accept" => handle.accept().await,
        "reject" => handle.reject().await,
        "hangup" => handle.hangup().await,
        "mute" => handle.set_muted(true).await,
        "unmute" => handle.set_muted(false).await,
        "quit" | "exit" => return false,
        other => {
            eprintln!("Unknown command: {} (accept, reject, hangup, mute, unmute, quit)", other);
            return true;
        }
    };

    if let Err(e) = result {
        eprintln!("{}", e);
    }
    true
}

/// Notices, nach denen `call`/`room` nichts mehr zu tun haben
fn ends_session(notice: &CallNotice) -> bool {
    matches!(
        notice,
        CallNotice::Ended { .. } | CallNotice::RoomFull { .. } | CallNotice::RelayError { .. }
    )
}

fn print_notice(notice: &CallNotice) {
    match notice {
        CallNotice::IncomingCall { from, .. } => {
            println!("Incoming call from {} - type 'accept' or 'reject'", from);
        }
        CallNotice::StateChanged { state, .. } => println!("State: {:?}", state),
        CallNotice::Connected { .. } => println!("Connected"),
        CallNotice::Ended {
            reason, duration, ..
        } => match duration {
            Some(d) => println!("{} after {}s", reason, d.as_secs()),
            None => println!("{}", reason),
        },
        CallNotice::PushFailed { message, .. } => eprintln!("Push failed: {}", message),
        CallNotice::RoomJoined { room_id } => println!("Joined room {}. Waiting for peer...", room_id),
        CallNotice::RoomFull { room_id } => println!("Room {} is full", room_id),
        CallNotice::RelayError { code, message } => eprintln!("Relay error {}: {}", code, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringr::call_engine::EndReason;
    use ringr::signaling::SessionId;

    #[test]
    fn test_room_full_and_relay_error_end_session() {
        assert!(ends_session(&CallNotice::RoomFull {
            room_id: "r1".to_string(),
        }));
        assert!(ends_session(&CallNotice::RelayError {
            code: 404,
            message: "unknown endpoint".to_string(),
        }));
        assert!(ends_session(&CallNotice::Ended {
            session_id: SessionId::from("s1"),
            reason: EndReason::Rejected,
            duration: None,
        }));
    }

    #[test]
    fn test_progress_notices_keep_running() {
        assert!(!ends_session(&CallNotice::RoomJoined {
            room_id: "r1".to_string(),
        }));
        assert!(!ends_session(&CallNotice::Connected {
            session_id: SessionId::from("s1"),
        }));
        assert!(!ends_session(&CallNotice::PushFailed {
            session_id: SessionId::from("s1"),
            message: "no device token".to_string(),
        }));
    }
}
