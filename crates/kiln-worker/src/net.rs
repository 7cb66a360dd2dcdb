use crate::errors::WorkerError;
use bytes::BytesMut;
use kiln_link::{Inbound, Link, LinkContext, LinkError};
use kiln_protocol::{BinaryFile, Letter};
use rand::Rng;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Payload size of one `BinaryFile` chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Opens an active link, retrying with a jittered backoff before giving up.
pub async fn connect_with_retry(
    ctx: &LinkContext,
    peer: &str,
    remote: &str,
    hello: Letter,
    attempts: u32,
) -> Result<Link, LinkError> {
    let mut attempt = 1;
    loop {
        match Link::connect(ctx, peer, remote, Some(hello.clone())).await {
            Ok(link) => return Ok(link),
            Err(error) if attempt < attempts => {
                warn!(peer = %peer, remote = %remote, attempt, error = %error, "connect failed, retrying");
                attempt += 1;
                tokio::time::sleep(jitter(ctx.config.reconnect_backoff)).await;
            }
            Err(error) => return Err(error),
        }
    }
}

fn jitter(base: Duration) -> Duration {
    let base_ms = base.as_millis() as i64;
    let spread = ((base_ms as f64) * 0.1).round() as i64;
    let delta = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(-spread..=spread)
    };
    Duration::from_millis(std::cmp::max(0, base_ms + delta) as u64)
}

/// Where a finished artifact goes.
#[derive(Debug, Clone)]
pub enum Outlet {
    Link(Link),
    /// Straight into this worker's own post listener.
    Local {
        ident: String,
        intake: mpsc::Sender<Inbound>,
    },
}

impl Outlet {
    pub async fn send(&self, letter: impl Into<Letter>) -> Result<(), WorkerError> {
        match self {
            Self::Link(link) => Ok(link.send(letter).await?),
            Self::Local { ident, intake } => intake
                .send(Inbound {
                    peer: ident.clone(),
                    link_id: 0,
                    letter: letter.into(),
                })
                .await
                .map_err(|_| WorkerError::NoListener),
        }
    }
}

/// Sends `path` as chunks shaped like `template`, then the terminator.
///
/// Returns the number of payload bytes sent.
pub async fn stream_file(
    outlet: &Outlet,
    path: &Path,
    template: &BinaryFile,
) -> Result<u64, WorkerError> {
    let io = |e: std::io::Error| WorkerError::Io(format!("{}: {e}", path.display()));
    let mut file = tokio::fs::File::open(path).await.map_err(io)?;
    let mut sent = 0u64;
    loop {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        while buf.len() < CHUNK_SIZE {
            if file.read_buf(&mut buf).await.map_err(io)? == 0 {
                break;
            }
        }
        if buf.is_empty() {
            break;
        }
        sent += buf.len() as u64;
        let chunk = BinaryFile {
            payload: buf.freeze(),
            ..template.clone()
        };
        outlet.send(chunk).await?;
    }
    outlet.send(template.terminator()).await?;
    debug!(tid = %template.tid, file = %template.file_name, bytes = sent, "artifact streamed");
    Ok(sent)
}

/// The last path component; artifacts travel and are stored under it.
pub fn file_label(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
        .to_string()
}
