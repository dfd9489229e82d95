//! The control socket, through which frontends read the state and command playback.
//!
//! A client writes one command line, the daemon answers with JSON lines and closes, except
//! for `watch`, which streams every published state until the client goes away.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_till1};
use nom::character::complete::{space0, space1};
use nom::combinator::{map, map_res, opt, value, verify};
use nom::sequence::preceded;
use nom::{Finish, IResult, Parser};
use serde_json::json;
use smol::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use smol::net::unix::{UnixListener, UnixStream};
use smol::stream::StreamExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::bus::{BusError, Transport};
use crate::ingress;
use crate::machine::MachineHandle;

/// Longest accepted command line.
const MAX_COMMAND: u64 = 256;

/// Commands a frontend can send.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCmd {
    /// Return the current state.
    Status,
    /// Toggle play/pause.
    Toggle,
    Next,
    Previous,
    /// Read the volume, or set it when a value is given.
    Volume(Option<f64>),
    /// Stream every published state.
    Watch,
    /// Stop the daemon.
    Quit,
}

#[derive(Debug, PartialEq, Error)]
pub enum ParseError {
    #[error("Unrecognised command")]
    CommandNotFound,
    #[error("Invalid argument")]
    InvalidArgument,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Cannot bind control socket {0}: {1}")]
    InitFailed(PathBuf, std::io::Error),
}

fn parse_simple(input: &str) -> IResult<&str, ControlCmd> {
    alt((
        value(ControlCmd::Status, tag("status")),
        value(ControlCmd::Toggle, alt((tag("toggle"), tag("play-pause")))),
        value(ControlCmd::Next, tag("next")),
        value(ControlCmd::Previous, alt((tag("previous"), tag("prev")))),
        value(ControlCmd::Watch, tag("watch")),
        value(ControlCmd::Quit, tag("quit")),
    ))
    .parse(input)
}

fn parse_volume(input: &str) -> IResult<&str, ControlCmd> {
    let (input, _) = tag("volume")(input)?;
    map(
        opt(preceded(
            space1,
            verify(
                map_res(take_till1(|c: char| c.is_whitespace()), str::parse::<f64>),
                |volume: &f64| volume.is_finite(),
            ),
        )),
        ControlCmd::Volume,
    )
    .parse(input)
}

fn parse_cmd(input: &str) -> IResult<&str, ControlCmd> {
    // `volume` goes first, it is the only command with an argument
    let (input, cmd) = alt((parse_volume, parse_simple)).parse(input)?;
    let (input, _) = space0(input)?;
    Ok((input, cmd))
}

/// Parse a command line.
///
/// # Errors
/// If fails to parse the given string, a [`ParseError`] is returned.
pub fn parse(input: &str) -> Result<ControlCmd, ParseError> {
    match parse_cmd(input.trim()).finish() {
        Ok(("", cmd)) => Ok(cmd),
        // Leftovers after `volume` can only be a bad value
        Ok((_, ControlCmd::Volume(_))) => Err(ParseError::InvalidArgument),
        Ok(_) | Err(_) => Err(ParseError::CommandNotFound),
    }
}

impl FromStr for ControlCmd {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse(value)
    }
}

/// The control socket server.
pub struct ControlServer<T: Transport> {
    listener: UnixListener,
    path: PathBuf,
    machine: MachineHandle<T>,
}

impl<T: Transport> ControlServer<T> {
    /// Binds the control socket, replacing a stale one.
    ///
    /// # Errors
    /// [`ControlError::InitFailed`] if the socket cannot be created, or another daemon still
    /// listens on it.
    pub fn bind(path: &Path, machine: MachineHandle<T>) -> Result<Self, ControlError> {
        let init = || -> std::io::Result<UnixListener> {
            ingress::remove_stale(path)?;
            UnixListener::bind(path)
        };
        let listener = init().map_err(|err| ControlError::InitFailed(path.into(), err))?;
        log::info!("Control socket listening at {}", path.to_string_lossy());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            machine,
        })
    }

    /// Serves clients until one of them sends `quit`.
    pub async fn serve(&self) {
        let (quit_tx, quit_rx) = smol::channel::bounded::<()>(1);
        let accept = async {
            let mut incoming = self.listener.incoming();
            while let Some(conn) = incoming.next().await {
                match conn {
                    Ok(conn) => {
                        // Clients such as `watch` stay connected, each one gets its own task
                        smol::spawn(handle_client(conn, self.machine.clone(), quit_tx.clone()))
                            .detach();
                    }
                    Err(err) => log::warn!("Failed to accept control connection: {err}"),
                }
            }
        };
        smol::future::or(accept, async {
            let _ = quit_rx.recv().await;
            log::info!("Quit requested");
        })
        .await;
    }
}

impl<T: Transport> Drop for ControlServer<T> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_client<T: Transport>(
    conn: UnixStream,
    machine: MachineHandle<T>,
    quit: smol::channel::Sender<()>,
) {
    let mut line = String::new();
    let mut reader = BufReader::new(conn.clone().take(MAX_COMMAND));
    if let Err(err) = reader.read_line(&mut line).await {
        log::debug!("Failed to read control command: {err}");
        return;
    }
    let mut writer = conn;

    let cmd = match parse(&line) {
        Ok(cmd) => cmd,
        Err(err) => {
            let _ = write_line(&mut writer, &json!({ "ok": false, "error": err.to_string() })).await;
            return;
        }
    };
    log::debug!("Control command: {cmd:?}");

    let reply = match cmd {
        ControlCmd::Status => match machine.snapshot().await {
            Some(state) => serde_json::to_value(state).unwrap_or_default(),
            None => json!({ "ok": false, "error": "state machine stopped" }),
        },
        ControlCmd::Toggle => outcome(machine.play_pause().await),
        ControlCmd::Next => outcome(machine.next().await),
        ControlCmd::Previous => outcome(machine.previous().await),
        ControlCmd::Volume(None) => match machine.volume().await {
            Ok(volume) => json!({ "ok": true, "volume": volume }),
            Err(err) => {
                log::debug!("Falling back to last known volume: {err}");
                match machine.snapshot().await {
                    Some(state) => json!({ "ok": true, "volume": state.volume }),
                    None => json!({ "ok": false, "error": err.to_string() }),
                }
            }
        },
        ControlCmd::Volume(Some(volume)) => match machine.set_volume(volume).await {
            Ok(volume) => json!({ "ok": true, "volume": volume }),
            Err(err) => json!({ "ok": false, "error": err.to_string() }),
        },
        ControlCmd::Watch => {
            let states = machine.subscribe();
            while let Ok(state) = states.recv().await {
                let Ok(state) = serde_json::to_value(state) else {
                    continue;
                };
                if write_line(&mut writer, &state).await.is_err() {
                    break;
                }
            }
            return;
        }
        ControlCmd::Quit => {
            let _ = quit.try_send(());
            json!({ "ok": true })
        }
    };
    if let Err(err) = write_line(&mut writer, &reply).await {
        log::debug!("Failed to answer control command: {err}");
    }
}

fn outcome(result: Result<(), BusError>) -> serde_json::Value {
    match result {
        Ok(()) => json!({ "ok": true }),
        Err(err) => {
            log::warn!("{err}");
            json!({ "ok": false, "error": err.to_string() })
        }
    }
}

async fn write_line(writer: &mut UnixStream, value: &serde_json::Value) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
