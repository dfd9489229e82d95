//! `spotbridged` entry
//!
//! Wires the event socket, the state machine, the bus client and the control socket together,
//! then serves until a `quit` command arrives.

use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::bus::{BusClient, DEFAULT_PREFIX, DbusSend};
use crate::control::{ControlError, ControlServer};
use crate::ingress::IngressServer;
use crate::machine::{RetryPolicy, StateMachine};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to set up logging: {0}")]
    Logger(#[from] fern::InitError),
    #[error(transparent)]
    Control(#[from] ControlError),
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    duration_str::parse(value).map_err(|err| err.to_string())
}

#[derive(Parser)]
#[command(
    version,
    about = "Bridges a Spotify Connect receiver's events and MPRIS controls to a frontend"
)]
struct Cli {
    #[arg(
        long = "event-socket",
        value_name = "PATH",
        help = "Socket the backend's hook writes events to."
    )]
    event_socket: Option<PathBuf>,

    #[arg(
        long = "control-socket",
        value_name = "PATH",
        help = "Socket frontends connect to."
    )]
    control_socket: Option<PathBuf>,

    #[arg(
        long = "bus-prefix",
        value_name = "NAME",
        default_value = DEFAULT_PREFIX,
        help = "Prefix of the backend's MPRIS bus name."
    )]
    bus_prefix: String,

    #[arg(
        long = "bus-address",
        value_name = "ADDRESS",
        help = "D-Bus address of the bus the backend registers on."
    )]
    bus_address: Option<String>,

    #[arg(
        long = "bus-address-file",
        value_name = "FILE",
        help = "File holding the bus address, read on every call. Overrides --bus-address."
    )]
    bus_address_file: Option<PathBuf>,

    #[arg(
        long = "dbus-send",
        value_name = "PATH",
        default_value = "dbus-send",
        help = "Path to the dbus-send binary."
    )]
    dbus_send: String,

    #[arg(
        long = "initial-volume",
        value_name = "VOLUME",
        default_value_t = 0.5,
        help = "Volume assumed until the backend reports one, from 0.0 to 1.0."
    )]
    initial_volume: f64,

    #[arg(
        long = "call-timeout",
        value_name = "DURATION",
        default_value = "2s",
        value_parser = parse_duration,
        help = "Time after which a bus call counts as failed."
    )]
    call_timeout: Duration,

    #[arg(
        long = "settle-delay",
        value_name = "DURATION",
        default_value = "1s",
        value_parser = parse_duration,
        help = "Wait after a track change before asking for its metadata."
    )]
    settle_delay: Duration,

    #[arg(
        long = "retry-backoff",
        value_name = "DURATION",
        default_value = "500ms",
        value_parser = parse_duration,
        help = "Wait between metadata attempts."
    )]
    retry_backoff: Duration,

    #[arg(
        long = "metadata-attempts",
        value_name = "COUNT",
        default_value_t = 3,
        help = "Metadata attempts per track change."
    )]
    metadata_attempts: u32,

    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        help = "More logging, repeat for even more."
    )]
    verbose: u8,
}

pub struct Config {
    pub event_socket: PathBuf,
    pub control_socket: PathBuf,
    pub bus_prefix: String,
    pub bus_address: Option<String>,
    pub bus_address_file: Option<PathBuf>,
    pub dbus_send: String,
    pub initial_volume: f64,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub log_level: log::LevelFilter,
}

impl Config {
    fn from_cli(parsed: Cli) -> Self {
        let data_dir = sys_data_dir();
        let log_level = match parsed.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        Self {
            event_socket: parsed
                .event_socket
                .unwrap_or_else(|| data_dir.join("event.sock")),
            control_socket: parsed
                .control_socket
                .unwrap_or_else(|| sys_runtime_dir().join("spotbridge.sock")),
            bus_prefix: parsed.bus_prefix,
            bus_address: parsed.bus_address,
            bus_address_file: Some(
                parsed
                    .bus_address_file
                    .unwrap_or_else(|| data_dir.join("dbus-address")),
            ),
            dbus_send: parsed.dbus_send,
            initial_volume: parsed.initial_volume.clamp(0.0, 1.0),
            call_timeout: parsed.call_timeout,
            retry: RetryPolicy {
                settle_delay: parsed.settle_delay,
                backoff: parsed.retry_backoff,
                attempts: parsed.metadata_attempts.max(1),
            },
            log_level,
        }
    }
}

fn sys_data_dir() -> PathBuf {
    if let Ok(mut value) = env::var("XDG_DATA_HOME") {
        value.push_str("/spotbridge");
        return PathBuf::from(value);
    }
    if let Ok(mut value) = env::var("HOME") {
        value.push_str("/.local/share/spotbridge");
        return PathBuf::from(value);
    }
    // This is not persistent anyhow
    PathBuf::from("/tmp/spotbridge")
}

fn sys_runtime_dir() -> PathBuf {
    env::var("XDG_RUNTIME_DIR").map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from)
}

fn setup_logger(level: log::LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                message
            ));
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

/// Parses the command line, sets up logging and runs the daemon.
///
/// # Errors
/// Fatal errors that will cause the program to exit will be returned here.
pub fn start() -> Result<(), DaemonError> {
    let config = Config::from_cli(Cli::parse());
    setup_logger(config.log_level)?;
    smol::block_on(run(config))
}

/// Runs the daemon until a `quit` command arrives.
///
/// # Errors
/// Only a control socket that cannot be bound is fatal. Without the event socket the daemon
/// keeps serving, it just receives no events.
pub async fn run(config: Config) -> Result<(), DaemonError> {
    let transport = DbusSend::new(
        config.dbus_send,
        config.bus_address,
        config.bus_address_file,
        config.call_timeout,
    );
    let bus = BusClient::new(transport, config.bus_prefix);
    let (machine, handle) = StateMachine::new(bus, config.initial_volume, config.retry);
    let machine_task = smol::spawn(machine.run());

    let mut ingress = IngressServer::new();
    let dispatcher = handle.clone();
    ingress.register(move |notification| dispatcher.dispatch(notification));
    if let Err(err) = ingress.start(&config.event_socket) {
        log::error!("{err}, continuing without events");
    }

    let control = match ControlServer::bind(&config.control_socket, handle.clone()) {
        Ok(control) => control,
        Err(err) => {
            ingress.stop();
            handle.shutdown();
            machine_task.await;
            return Err(err.into());
        }
    };
    control.serve().await;

    ingress.stop();
    handle.shutdown();
    machine_task.await;
    log::info!("Bye");
    Ok(())
}
