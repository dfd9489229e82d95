//! Client for the backend's MPRIS remote-control surface.
//!
//! - `dbus_send.rs` - [`Transport`] running `dbus-send` subprocesses
//! - `reply.rs` - parsing of the textual replies
//!
//! The endpoint's bus name carries an instance suffix that changes whenever the backend
//! re-registers, so every operation rediscovers it first.

mod dbus_send;
mod reply;

pub use dbus_send::DbusSend;
pub use reply::{PrintReply, ReplyParser};

use std::fmt;
use std::future::Future;
use thiserror::Error;

use crate::state::TrackInfo;

pub const MPRIS_OBJECT_PATH: &str = "/org/mpris/MediaPlayer2";
pub const PLAYER_INTERFACE: &str = "org.mpris.MediaPlayer2.Player";
pub const DEFAULT_PREFIX: &str = "org.mpris.MediaPlayer2.spotifyd";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusError {
    /// No registered name matches the prefix. The backend may not have started its
    /// remote-control surface yet.
    #[error("No bus name matches `{0}`")]
    NotFound(String),
    /// An operation needed the endpoint but discovery failed.
    #[error("Remote-control endpoint unavailable: {0}")]
    EndpointUnavailable(String),
    /// The exchange failed, returned an error or timed out.
    #[error("Bus call failed: {0}")]
    CallFailed(String),
}

/// A property value that can be written.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Double(f64),
}

impl fmt::Display for Variant {
    /// Renders in the `variant:<type>:<value>` form `dbus-send` takes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Double(value) => write!(f, "variant:double:{value}"),
        }
    }
}

/// Transport controls without arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    PlayPause,
    Next,
    Previous,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::PlayPause => "PlayPause",
            Method::Next => "Next",
            Method::Previous => "Previous",
        }
    }
}

/// A single exchange with the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Enumerate all registered names.
    ListNames,
    GetProperty {
        dest: String,
        interface: String,
        name: String,
    },
    SetProperty {
        dest: String,
        interface: String,
        name: String,
        value: Variant,
    },
    Invoke {
        dest: String,
        interface: String,
        method: String,
    },
}

/// Carries a [`Request`] to the bus and returns the textual reply.
pub trait Transport: Send + Sync + 'static {
    /// # Errors
    /// Any failure, including a timeout, is a [`BusError::CallFailed`].
    fn exchange(&self, request: Request) -> impl Future<Output = Result<String, BusError>> + Send;
}

pub struct BusClient<T: Transport> {
    transport: T,
    parser: Box<dyn ReplyParser + Send + Sync>,
    prefix: String,
}

impl<T: Transport> BusClient<T> {
    /// Creates a client looking for names starting with `prefix`, parsing replies with
    /// [`PrintReply`].
    pub fn new(transport: T, prefix: impl Into<String>) -> Self {
        Self {
            transport,
            parser: Box::new(PrintReply),
            prefix: prefix.into(),
        }
    }

    /// Finds the first registered name matching the configured prefix.
    ///
    /// # Errors
    /// [`BusError::NotFound`] if nothing matches, or the error of the enumeration itself.
    pub async fn discover_endpoint(&self) -> Result<String, BusError> {
        let reply = self.transport.exchange(Request::ListNames).await?;
        match self
            .parser
            .names(&reply)
            .into_iter()
            .find(|name| name.starts_with(&self.prefix))
        {
            Some(name) => {
                log::debug!("Found MPRIS bus name {name}");
                Ok(name)
            }
            None => Err(BusError::NotFound(self.prefix.clone())),
        }
    }

    async fn endpoint(&self) -> Result<String, BusError> {
        self.discover_endpoint()
            .await
            .map_err(|err| BusError::EndpointUnavailable(err.to_string()))
    }

    /// Reads a property and returns the raw reply.
    ///
    /// # Errors
    /// [`BusError::EndpointUnavailable`] if discovery fails, [`BusError::CallFailed`] otherwise.
    pub async fn get_property(&self, interface: &str, name: &str) -> Result<String, BusError> {
        let dest = self.endpoint().await?;
        self.transport
            .exchange(Request::GetProperty {
                dest,
                interface: interface.to_string(),
                name: name.to_string(),
            })
            .await
    }

    /// Writes a property.
    ///
    /// # Errors
    /// See [`BusClient::get_property`].
    pub async fn set_property(
        &self,
        interface: &str,
        name: &str,
        value: Variant,
    ) -> Result<(), BusError> {
        let dest = self.endpoint().await?;
        self.transport
            .exchange(Request::SetProperty {
                dest,
                interface: interface.to_string(),
                name: name.to_string(),
                value,
            })
            .await
            .map(|_| ())
    }

    /// Calls a transport control on the player interface.
    ///
    /// # Errors
    /// See [`BusClient::get_property`].
    pub async fn invoke(&self, method: Method) -> Result<(), BusError> {
        let dest = self.endpoint().await?;
        self.transport
            .exchange(Request::Invoke {
                dest,
                interface: PLAYER_INTERFACE.to_string(),
                method: method.as_str().to_string(),
            })
            .await?;
        log::info!("{} sent", method.as_str());
        Ok(())
    }

    /// Reads the current track's metadata. Fields the reply lacks are `None`.
    ///
    /// # Errors
    /// See [`BusClient::get_property`].
    pub async fn get_metadata(&self) -> Result<TrackInfo, BusError> {
        let reply = self.get_property(PLAYER_INTERFACE, "Metadata").await?;
        let info = self.parser.metadata(&reply);
        log::debug!("Parsed metadata: {info:?}");
        Ok(info)
    }

    /// Reads the output volume.
    ///
    /// # Errors
    /// See [`BusClient::get_property`]. A reply without a volume is a [`BusError::CallFailed`].
    pub async fn get_volume(&self) -> Result<f64, BusError> {
        let reply = self.get_property(PLAYER_INTERFACE, "Volume").await?;
        self.parser
            .double(&reply)
            .filter(|volume| volume.is_finite())
            .map(|volume| volume.clamp(0.0, 1.0))
            .ok_or_else(|| BusError::CallFailed("reply carries no volume".to_string()))
    }

    /// Writes the output volume, clamped to `[0.0, 1.0]`. Returns the value actually sent.
    ///
    /// # Errors
    /// See [`BusClient::get_property`]. A value that is not finite is a [`BusError::CallFailed`]
    /// and never reaches the bus.
    pub async fn set_volume(&self, volume: f64) -> Result<f64, BusError> {
        if !volume.is_finite() {
            return Err(BusError::CallFailed(format!("{volume} is not a volume")));
        }
        let volume = volume.clamp(0.0, 1.0);
        log::info!("Setting volume to {volume}");
        self.set_property(PLAYER_INTERFACE, "Volume", Variant::Double(volume))
            .await?;
        Ok(volume)
    }
}
