//! Deadline-bounded UDP helpers used by every role.

use crate::wire::{self, Message};
use crate::SessionError;
use log::debug;
use std::io;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};

/// Receive buffer size: the largest UDP payload over IPv4.
///
/// A `moves` datagram carries the whole position window, so it grows with
/// the player count. Anything smaller truncates large sessions.
pub const MAX_DATAGRAM: usize = 65_507;

/// Receives one datagram, or returns `Ok(None)` once `deadline` passes.
pub async fn recv_until(
    socket: &UdpSocket,
    buf: &mut [u8],
    deadline: Instant,
) -> io::Result<Option<(usize, SocketAddr)>> {
    match timeout_at(deadline, socket.recv_from(buf)).await {
        Ok(Ok(received)) => Ok(Some(received)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}

pub async fn send_message(
    socket: &UdpSocket,
    message: &Message,
    addr: SocketAddr,
) -> Result<usize, SessionError> {
    let bytes = wire::encode(message)?;
    socket.send_to(&bytes, addr).await?;
    Ok(bytes.len())
}

/// Sends the same encoded message to every address; returns bytes written.
pub async fn broadcast<I>(
    socket: &UdpSocket,
    message: &Message,
    addrs: I,
) -> Result<usize, SessionError>
where
    I: IntoIterator<Item = SocketAddr>,
{
    let bytes = wire::encode(message)?;
    let mut written = 0;
    for addr in addrs {
        socket.send_to(&bytes, addr).await?;
        written += bytes.len();
    }
    debug!("Broadcast {} ({} bytes total)", message.kind().as_str(), written);
    Ok(written)
}

pub async fn resolve(addr: &str) -> Result<SocketAddr, SessionError> {
    lookup_host(addr)
        .await
        .map_err(|_| SessionError::BadAddress(addr.to_string()))?
        .next()
        .ok_or_else(|| SessionError::BadAddress(addr.to_string()))
}
