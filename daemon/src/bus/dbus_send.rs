//! [`Transport`] spawning `dbus-send --print-reply`.

use smol::process::{Command, Stdio};
use std::path::PathBuf;
use std::time::Duration;

use crate::bus::{BusError, MPRIS_OBJECT_PATH, Request, Transport};

const REGISTRAR_NAME: &str = "org.freedesktop.DBus";
const REGISTRAR_PATH: &str = "/org/freedesktop/DBus";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub struct DbusSend {
    binary: String,
    address: Option<String>,
    address_file: Option<PathBuf>,
    timeout: Duration,
}

impl DbusSend {
    /// `address` pins the bus address; `address_file` is read on every call and takes precedence
    /// when it has content, since the backend may recreate its private bus at any time.
    pub fn new(
        binary: impl Into<String>,
        address: Option<String>,
        address_file: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            address,
            address_file,
            timeout,
        }
    }

    /// The bus address the next call will use, `None` meaning the inherited environment.
    fn bus_address(&self) -> Option<String> {
        if let Some(path) = &self.address_file {
            match std::fs::read_to_string(path) {
                Ok(content) if !content.trim().is_empty() => {
                    return Some(content.trim().to_string());
                }
                Ok(_) => log::warn!("Bus address file {} is empty", path.to_string_lossy()),
                Err(err) => log::debug!(
                    "Cannot read bus address file {}: {err}",
                    path.to_string_lossy()
                ),
            }
        }
        if self.address.is_some() {
            return self.address.clone();
        }
        if std::env::var_os("DBUS_SESSION_BUS_ADDRESS").is_some() {
            return None;
        }
        Some(format!(
            "unix:path=/run/user/{}/bus",
            nix::unistd::getuid()
        ))
    }

    /// Gets the [`Command`] performing `request`.
    fn get_sys_command(&self, request: &Request) -> Command {
        let mut sys_cmd = Command::new(&self.binary);
        sys_cmd.args(args(request, self.timeout));
        if let Some(address) = self.bus_address() {
            sys_cmd.env("DBUS_SESSION_BUS_ADDRESS", address);
        }
        // Libraries injected into our own environment must not leak into the client
        sys_cmd
            .env_remove("LD_PRELOAD")
            .env_remove("LD_LIBRARY_PATH")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        sys_cmd
    }
}

/// Command line arguments for `request`.
fn args(request: &Request, timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "--print-reply".to_string(),
        format!("--reply-timeout={}", timeout.as_millis()),
    ];
    match request {
        Request::ListNames => {
            args.push(format!("--dest={REGISTRAR_NAME}"));
            args.push(REGISTRAR_PATH.to_string());
            args.push(format!("{REGISTRAR_NAME}.ListNames"));
        }
        Request::GetProperty {
            dest,
            interface,
            name,
        } => {
            args.push(format!("--dest={dest}"));
            args.push(MPRIS_OBJECT_PATH.to_string());
            args.push(format!("{PROPERTIES_INTERFACE}.Get"));
            args.push(format!("string:{interface}"));
            args.push(format!("string:{name}"));
        }
        Request::SetProperty {
            dest,
            interface,
            name,
            value,
        } => {
            args.push(format!("--dest={dest}"));
            args.push(MPRIS_OBJECT_PATH.to_string());
            args.push(format!("{PROPERTIES_INTERFACE}.Set"));
            args.push(format!("string:{interface}"));
            args.push(format!("string:{name}"));
            args.push(value.to_string());
        }
        Request::Invoke {
            dest,
            interface,
            method,
        } => {
            args.push(format!("--dest={dest}"));
            args.push(MPRIS_OBJECT_PATH.to_string());
            args.push(format!("{interface}.{method}"));
        }
    }
    args
}

impl Transport for DbusSend {
    async fn exchange(&self, request: Request) -> Result<String, BusError> {
        let mut sys_cmd = self.get_sys_command(&request);
        log::trace!("Running {} {:?}", self.binary, args(&request, self.timeout));

        // The child is killed when its future is dropped on timeout
        let output = smol::future::or(
            async { Some(sys_cmd.output().await) },
            async {
                smol::Timer::after(self.timeout).await;
                None
            },
        )
        .await;

        match output {
            None => Err(BusError::CallFailed(format!(
                "timed out after {}ms",
                self.timeout.as_millis()
            ))),
            Some(Err(err)) => Err(BusError::CallFailed(format!(
                "cannot run `{}`: {err}",
                self.binary
            ))),
            Some(Ok(output)) if !output.status.success() => Err(BusError::CallFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Some(Ok(output)) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
        }
    }
}
