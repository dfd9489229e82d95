//! Receives notifications from the backend's hook process.
//!
//! The protocol is one-shot: the hook connects, writes one JSON object and closes. At most
//! [`MAX_PAYLOAD`] bytes are read from a connection, then it is closed regardless of whether
//! the writer is done.

use smol::Task;
use smol::io::AsyncReadExt;
use smol::net::unix::{UnixListener, UnixStream};
use smol::stream::StreamExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::notification::Notification;

/// Upper bound of a single notification.
pub const MAX_PAYLOAD: usize = 4096;
/// A connection still open after this is closed, and what it sent so far is decoded.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Cannot bind event socket {0}: {1}")]
    BindError(PathBuf, std::io::Error),
}

type Consumer = Arc<dyn Fn(Notification) + Send + Sync>;
/// Shared with the accept loop, so a consumer registered while running takes over at once.
type ConsumerSlot = Arc<RwLock<Option<Consumer>>>;

/// The event ingress server.
#[derive(Default)]
pub struct IngressServer {
    consumer: ConsumerSlot,
    path: Option<PathBuf>,
    task: Option<Task<()>>,
}

impl IngressServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the callback receiving every decoded notification, replacing the previous one.
    pub fn register(&mut self, consumer: impl Fn(Notification) + Send + Sync + 'static) {
        match self.consumer.write() {
            Ok(mut slot) => *slot = Some(Arc::new(consumer)),
            Err(err) => log::error!("Cannot register event consumer: {err}"),
        }
    }

    /// Binds the socket at `path` and starts accepting connections.
    ///
    /// A stale socket file left by a previous run is removed first, unless something still
    /// listens on it. The socket is made world-writable, as the hook runs as another user.
    ///
    /// # Errors
    /// [`IngressError::BindError`] if the socket cannot be created.
    pub fn start(&mut self, path: &Path) -> Result<(), IngressError> {
        self.stop();
        let listener = bind(path).map_err(|err| IngressError::BindError(path.into(), err))?;
        log::info!("Event socket listening at {}", path.to_string_lossy());

        self.path = Some(path.to_path_buf());
        self.task = Some(smol::spawn(accept_loop(listener, self.consumer.clone())));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Stops accepting, drops the connection being handled and removes the socket file.
    /// Does nothing when not started.
    pub fn stop(&mut self) {
        // Dropping the task cancels it and closes the listener
        if self.task.take().is_none() {
            return;
        }
        if let Some(path) = self.path.take() {
            if let Err(err) = std::fs::remove_file(&path) {
                log::debug!("Cannot remove {}: {err}", path.to_string_lossy());
            }
        }
        log::info!("Event socket stopped");
    }
}

impl Drop for IngressServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Prepares `path` for a new listener: creates its directory and removes a socket file left
/// behind by a dead process. Fails with [`std::io::ErrorKind::AddrInUse`] if a live process
/// still listens on it.
pub(crate) fn remove_stale(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        if std::os::unix::net::UnixStream::connect(path).is_ok() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "another process is listening",
            ));
        }
        std::fs::remove_file(path)?;
    }
    Ok(())
}

fn bind(path: &Path) -> std::io::Result<UnixListener> {
    remove_stale(path)?;
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    Ok(listener)
}

/// Handles connections one by one, so notifications reach the consumer in accept order.
async fn accept_loop(listener: UnixListener, consumer: ConsumerSlot) {
    let mut incoming = listener.incoming();
    while let Some(conn) = incoming.next().await {
        match conn {
            Ok(conn) => {
                let Some(notification) = receive(conn).await else {
                    continue;
                };
                let current = consumer.read().ok().and_then(|slot| slot.clone());
                match current {
                    Some(consumer) => consumer(notification),
                    None => log::warn!("Received event but no consumer is registered"),
                }
            }
            Err(err) => log::warn!("Failed to accept event connection: {err}"),
        }
    }
}

/// Reads and decodes one notification. Anything wrong with it is logged and dropped.
///
/// The payload is decoded as soon as the bytes read so far form a complete record, so a hook
/// that keeps its end open is not made to wait for the timeout. Otherwise reading goes on until
/// the writer closes or [`READ_TIMEOUT`] passes, and whatever arrived is decoded.
async fn receive(mut conn: UnixStream) -> Option<Notification> {
    let deadline = Instant::now() + READ_TIMEOUT;
    let mut payload = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let read = smol::future::or(async { Some(conn.read(&mut chunk).await) }, async {
            smol::Timer::at(deadline).await;
            None
        })
        .await;
        match read {
            None => {
                log::debug!("Event connection timed out after {} bytes", payload.len());
                break;
            }
            Some(Err(err)) => {
                log::debug!("Failed to read event: {err}");
                return None;
            }
            Some(Ok(0)) => break,
            Some(Ok(read)) => {
                payload.extend_from_slice(&chunk[..read]);
                if payload.len() > MAX_PAYLOAD {
                    log::debug!("Dropping event larger than {MAX_PAYLOAD} bytes");
                    return None;
                }
                if let Ok(notification) = Notification::decode(&payload) {
                    return Some(notification);
                }
            }
        }
    }
    Notification::decode(&payload)
        .inspect_err(|err| log::debug!("Dropping malformed event: {err}"))
        .ok()
}
