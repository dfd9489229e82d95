//! cli parameters

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    version,
    about = "CLI tool for talking to spotbridged.",
    long_about = None
)]
pub struct Cli {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Control socket of the daemon, defaults to $XDG_RUNTIME_DIR/spotbridge.sock"
    )]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Show what is playing")]
    Status,
    #[command(about = "Toggle play/pause", alias = "play-pause")]
    Toggle,
    #[command(about = "Skip to the next track")]
    Next,
    #[command(about = "Go back to the previous track", alias = "prev")]
    Previous,
    #[command(about = "Show the volume, or set it")]
    Volume {
        #[arg(help = "New volume from 0.0 to 1.0")]
        value: Option<f64>,
    },
    #[command(about = "Print every state change until interrupted")]
    Watch,
    #[command(about = "Stop the daemon")]
    Quit,
}

impl Commands {
    /// The line sent over the control socket.
    pub fn to_line(&self) -> String {
        match self {
            Self::Status => "status".to_string(),
            Self::Toggle => "toggle".to_string(),
            Self::Next => "next".to_string(),
            Self::Previous => "previous".to_string(),
            Self::Volume { value: None } => "volume".to_string(),
            Self::Volume { value: Some(value) } => format!("volume {value}"),
            Self::Watch => "watch".to_string(),
            Self::Quit => "quit".to_string(),
        }
    }
}
