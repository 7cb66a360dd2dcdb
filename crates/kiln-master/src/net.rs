use crate::errors::MasterError;
use crate::room::WorkerRoom;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, MasterError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| MasterError::Bind(e.to_string()))
}

/// Hands every incoming connection to the room's handshake.
pub async fn run_accept_loop(
    listener: TcpListener,
    room: Arc<WorkerRoom>,
    cancel: CancellationToken,
) -> Result<(), MasterError> {
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                accepted.map_err(|e| MasterError::Listener(e.to_string()))?
            }
        };
        debug!(addr = %addr, "connection accepted");
        let room = Arc::clone(&room);
        tokio::spawn(async move {
            if let Err(error) = room.accept(stream, addr).await {
                warn!(addr = %addr, error = %error, "worker not admitted");
            }
        });
    }
}
