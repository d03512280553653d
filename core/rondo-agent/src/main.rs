//! rondo-agent: console driver for the rondo session engine.
//!
//! Wires the engine to an HTTP backend and a configured push endpoint, then
//! drives it from stdin. Session state survives process death through the
//! flattened snapshot in the data directory.

mod config;
mod device;
mod logging;
mod persist;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;

use clap::{Parser, Subcommand};
use fs_err as fs;
use rondo_core::{
    ChannelErrorKind, Clock, Command, Engine, EngineConfig, EngineEvent, EngineHandle, GeoPoint,
    HttpSyncClient, Identity, Role, SystemClock, TravelMode,
};
use rondo_protocol::invite::InviteCode;
use tracing::{error, info, warn};

const SNAPSHOT_FILE: &str = "session.state";

#[derive(Parser)]
#[command(name = "rondo-agent")]
#[command(about = "Rondo meet-up session agent")]
#[command(version)]
struct Cli {
    /// Path to the config file (defaults to rondo.toml in the data dir)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive session driver
    Run,

    /// Parse an invite code and print its parts
    Invite {
        /// The invite text, as received
        text: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let data_dir = match config::data_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("rondo-agent: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("rondo-agent: failed to create data directory: {err}");
        std::process::exit(1);
    }
    let _logging_guard = logging::init(&data_dir);

    match cli.command {
        Commands::Invite { text } => match InviteCode::parse(&text)
            .or_else(|| InviteCode::parse_launch_uri(&text))
        {
            Some(code) => {
                println!(
                    "session {}  inviter-key {}  alias {}",
                    code.session_id, code.short_device_id, code.alias
                );
            }
            None => {
                eprintln!("not a valid invite code");
                std::process::exit(1);
            }
        },
        Commands::Run => {
            let config_path = cli
                .config
                .unwrap_or_else(|| data_dir.join(config::CONFIG_FILE));
            let cfg = config::load(&config_path);
            if let Err(err) = run(cfg, data_dir) {
                error!(error = %err, "agent failed");
                eprintln!("rondo-agent: {err}");
                std::process::exit(1);
            }
        }
    }
}

fn run(cfg: config::AgentConfig, data_dir: PathBuf) -> Result<(), String> {
    let short_device_id = device::short_device_id(&data_dir)?;
    info!(device = %short_device_id, backend = %cfg.backend_url, "agent starting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sync = Arc::new(HttpSyncClient::new(
        &cfg.backend_url,
        &cfg.application_key,
        cfg.device_code,
        Arc::clone(&clock),
    )?);

    let identity = Identity {
        short_device_id,
        alias: cfg.alias.clone(),
        address: String::new(),
    };
    let mut engine_config = EngineConfig::new(identity);
    engine_config.travel_mode = cfg.travel_mode();

    let (handle, events) = Engine::spawn(sync, clock, engine_config);

    if cfg.channel_uri.is_empty() {
        warn!("no channel_uri configured; operations will wait for `connect <uri>`");
    } else {
        handle.send(Command::ChannelConnected {
            uri: cfg.channel_uri.clone(),
        });
    }

    // Pick up whatever session the previous process was in, then reconcile
    // to repair anything missed while we were gone.
    let snapshot_path = data_dir.join(SNAPSHOT_FILE);
    if let Some(restored) = persist::load(&snapshot_path) {
        handle.send(Command::RestoreSession { restored });
        handle.send(Command::Reconcile);
    }

    let printer = spawn_event_printer(events, snapshot_path);
    repl(&handle);

    handle.send(Command::Shutdown);
    drop(handle);
    let _ = printer.join();
    Ok(())
}

fn spawn_event_printer(
    events: Receiver<EngineEvent>,
    snapshot_path: PathBuf,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in events {
            render_event(&event);
            if let EngineEvent::StateChanged(snapshot) = &event {
                if let Err(err) = persist::save(&snapshot_path, snapshot) {
                    warn!(error = %err, "failed to persist session snapshot");
                }
            }
        }
    })
}

fn render_event(event: &EngineEvent) {
    match event {
        EngineEvent::StateChanged(snapshot) => match &snapshot.role {
            Role::NoRole => println!("* no active session"),
            Role::Inviter(state) => {
                println!(
                    "* inviter of session {} ({} invitee(s) en route)",
                    state.session_id,
                    state.invitees.len()
                );
                for invitee in &state.invitees {
                    println!(
                        "    {} ({}) {:.0} m from the point",
                        invitee.name, invitee.invitee_id, invitee.distance_to_point_m
                    );
                }
            }
            Role::Invitee(state) => println!(
                "* invitee {} in session {} (meeting {})",
                state.invitee_id, state.session_id, state.inviter_name
            ),
        },
        EngineEvent::InviteReady { text } => {
            println!("* session started; share this invite:\n{text}")
        }
        EngineEvent::OperationFailed { op, error } => println!("! {op:?} failed: {error}"),
        EngineEvent::BackgroundFailure { context, error } => {
            // Background trouble is informational only; never a dialog.
            info!(context, %error, "background operation failed");
        }
        EngineEvent::LongJourney {
            distance_m,
            threshold_m,
        } => println!(
            "* long journey of {:.1} km; progress broadcasts every {:.0} m to stay inside the notification quota",
            distance_m / 1000.0,
            threshold_m
        ),
        EngineEvent::Arrived => println!("* you have arrived"),
        EngineEvent::SessionEnded { reason } => println!("* session over ({reason:?})"),
        EngineEvent::InstantMessage { invitee_id, text } => {
            println!("[msg from {invitee_id}] {text}")
        }
        EngineEvent::ChannelTrouble { kind } => match kind {
            ChannelErrorKind::ChannelOpenFailed => println!(
                "! push channel failed to open (check the device clock, then reconnect)"
            ),
            other => println!("! push channel error: {other:?}"),
        },
        EngineEvent::ReconnectRequested => {
            println!("* push channel dropped; reconnect with `connect <uri>`")
        }
    }
}

enum ReplAction {
    Send(Command),
    Help,
    Quit,
    Invalid(&'static str),
}

fn repl(handle: &EngineHandle) {
    println!("rondo-agent ready; `help` lists commands");
    let stdin = std::io::stdin();
    // Last reported position; `at` updates it, `accept` starts from it.
    let mut position = GeoPoint::new(0.0, 0.0);

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        match parse_line(&line, &mut position) {
            ReplAction::Send(command) => handle.send(command),
            ReplAction::Help => print_help(),
            ReplAction::Quit => break,
            ReplAction::Invalid(reason) => println!("! {reason}"),
        }
    }
}

fn parse_line(line: &str, position: &mut GeoPoint) -> ReplAction {
    let mut parts = line.trim().splitn(2, ' ');
    let verb = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match verb {
        "" => ReplAction::Invalid("empty command"),
        "help" => ReplAction::Help,
        "quit" | "exit" => ReplAction::Quit,
        "start" => match parse_point(rest) {
            Some(point) => ReplAction::Send(Command::StartSession { point }),
            None => ReplAction::Invalid("usage: start <lat> <lng>"),
        },
        "accept" => {
            if rest.is_empty() {
                ReplAction::Invalid("usage: accept <invite text>")
            } else {
                ReplAction::Send(Command::AcceptInvite {
                    text: rest.to_string(),
                    position: *position,
                })
            }
        }
        "at" => match parse_point(rest) {
            Some(point) => {
                *position = point;
                ReplAction::Send(Command::LocationChanged { position: point })
            }
            None => ReplAction::Invalid("usage: at <lat> <lng>"),
        },
        "move" => match parse_point(rest) {
            Some(point) => ReplAction::Send(Command::MoveRoundUpPoint { point }),
            None => ReplAction::Invalid("usage: move <lat> <lng>"),
        },
        "cancel" => ReplAction::Send(Command::CancelSession),
        "leave" => ReplAction::Send(Command::CancelInvitation),
        "close" => ReplAction::Send(Command::CloseSession),
        "msg" => {
            if rest.is_empty() {
                ReplAction::Invalid("usage: msg <text>")
            } else {
                ReplAction::Send(Command::SendInstantMessage {
                    text: rest.to_string(),
                })
            }
        }
        "push" => {
            if rest.is_empty() {
                ReplAction::Invalid("usage: push <json payload>")
            } else {
                ReplAction::Send(Command::PushReceived {
                    payload: rest.to_string(),
                })
            }
        }
        "sync" => ReplAction::Send(Command::Reconcile),
        "mode" => match rest {
            "walking" => ReplAction::Send(Command::SetTravelMode {
                mode: TravelMode::Walking,
            }),
            "driving" => ReplAction::Send(Command::SetTravelMode {
                mode: TravelMode::Driving,
            }),
            _ => ReplAction::Invalid("usage: mode walking|driving"),
        },
        "connect" => {
            if rest.is_empty() {
                ReplAction::Invalid("usage: connect <uri>")
            } else {
                ReplAction::Send(Command::ChannelConnected {
                    uri: rest.to_string(),
                })
            }
        }
        "disconnect" => ReplAction::Send(Command::ChannelDisconnected),
        _ => ReplAction::Invalid("unknown command; `help` lists commands"),
    }
}

fn parse_point(rest: &str) -> Option<GeoPoint> {
    let mut parts = rest.split_whitespace();
    let latitude: f64 = parts.next()?.parse().ok()?;
    let longitude: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(GeoPoint::new(latitude, longitude))
}

fn print_help() {
    println!(
        "\
  start <lat> <lng>    start a session with the round-up point there
  accept <invite>      join a session from an invite text
  at <lat> <lng>       report the device position
  move <lat> <lng>     move the round-up point (inviter)
  cancel               cancel the session (inviter)
  leave                cancel your participation (invitee)
  close                end the session (inviter)
  msg <text>           send an instant message
  push <json>          inject a push payload (testing)
  sync                 reconcile against the backend log
  mode walking|driving set the travel mode
  connect <uri>        push channel connected at <uri>
  disconnect           push channel dropped
  quit                 leave the agent"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_coordinates() {
        let mut position = GeoPoint::new(0.0, 0.0);
        let action = parse_line("start 51.5 -0.12", &mut position);
        assert!(matches!(
            action,
            ReplAction::Send(Command::StartSession { point })
                if point == GeoPoint::new(51.5, -0.12)
        ));
    }

    #[test]
    fn at_updates_the_remembered_position() {
        let mut position = GeoPoint::new(0.0, 0.0);
        parse_line("at 51.49 -0.11", &mut position);
        assert_eq!(position, GeoPoint::new(51.49, -0.11));

        let action = parse_line("accept rndup://42?did=ABCD1234&nme=Bob", &mut position);
        assert!(matches!(
            action,
            ReplAction::Send(Command::AcceptInvite { position: p, .. })
                if p == GeoPoint::new(51.49, -0.11)
        ));
    }

    #[test]
    fn rejects_malformed_coordinates() {
        let mut position = GeoPoint::new(0.0, 0.0);
        assert!(matches!(
            parse_line("start here", &mut position),
            ReplAction::Invalid(_)
        ));
        assert!(matches!(
            parse_line("at 51.5", &mut position),
            ReplAction::Invalid(_)
        ));
    }

    #[test]
    fn unknown_verbs_are_invalid_not_fatal() {
        let mut position = GeoPoint::new(0.0, 0.0);
        assert!(matches!(
            parse_line("launch", &mut position),
            ReplAction::Invalid(_)
        ));
        assert!(matches!(
            parse_line("", &mut position),
            ReplAction::Invalid(_)
        ));
    }

    #[test]
    fn mode_parses_both_travel_modes() {
        let mut position = GeoPoint::new(0.0, 0.0);
        assert!(matches!(
            parse_line("mode driving", &mut position),
            ReplAction::Send(Command::SetTravelMode {
                mode: TravelMode::Driving
            })
        ));
        assert!(matches!(
            parse_line("mode flying", &mut position),
            ReplAction::Invalid(_)
        ));
    }
}
