//! `spotbridgectl` entry
//!
//! The cli program to communicate with spotbridged

mod cli;

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;

fn default_socket() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from)
        .join("spotbridge.sock")
}

fn talk(socket: &Path, line: &str) -> std::io::Result<()> {
    let mut conn = UnixStream::connect(socket)?;
    conn.write_all(format!("{line}\n").as_bytes())?;
    conn.shutdown(std::net::Shutdown::Write)?;
    let stdout = std::io::stdout();
    for reply in BufReader::new(conn).lines() {
        writeln!(stdout.lock(), "{}", reply?)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    let socket = cli.socket.unwrap_or_else(default_socket);
    match talk(&socket, &cli.command.to_line()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Cannot talk to {}: {err}", socket.to_string_lossy());
            ExitCode::FAILURE
        }
    }
}
