//! Do some preparations for integration tests

use smol::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use smol::net::unix::UnixStream;
use std::path::Path;
use std::time::Duration;

pub fn setup() {
    // Every test calls this, only the first one installs the logger
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .try_init();
}

/// Awaits `future`, panicking when it takes longer than `limit`.
pub async fn within<F: Future>(limit: Duration, future: F) -> F::Output {
    smol::future::or(async { Some(future.await) }, async {
        smol::Timer::after(limit).await;
        None
    })
    .await
    .expect("Timed out")
}

/// Writes `payload` the way the backend's hook does: connect, write, close.
pub async fn notify(path: &Path, payload: &[u8]) {
    let mut conn = UnixStream::connect(path)
        .await
        .expect("Cannot connect to event socket");
    conn.write_all(payload).await.expect("Cannot write event");
}

/// Sends one control command and returns the first reply line.
pub async fn request(path: &Path, command: &str) -> serde_json::Value {
    let mut conn = UnixStream::connect(path)
        .await
        .expect("Cannot connect to control socket");
    conn.write_all(format!("{command}\n").as_bytes())
        .await
        .expect("Cannot write command");
    let mut reader = BufReader::new(conn);
    read_json(&mut reader).await
}

pub async fn read_json(reader: &mut BufReader<UnixStream>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).await.expect("Cannot read reply");
    serde_json::from_str(&line).expect("Reply is not JSON")
}
