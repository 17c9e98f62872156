//! Discovery socket and probe scheduling

use crate::error::{MiioError, Result};
use crate::packet::build_handshake;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Delay of the extra broadcast that follows each probe
pub const REBROADCAST_DELAY: Duration = Duration::from_millis(500);

/// Bind a broadcast-capable UDP socket
pub fn create_discovery_socket(bind: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| MiioError::socket(format!("failed to create socket: {e}")))?;

    socket
        .set_broadcast(true)
        .map_err(|e| MiioError::socket(format!("failed to enable broadcast: {e}")))?;
    socket
        .bind(&bind.into())
        .map_err(|e| MiioError::socket(format!("failed to bind {bind}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| MiioError::socket(format!("failed to set non-blocking: {e}")))?;

    UdpSocket::from_std(socket.into())
        .map_err(|e| MiioError::socket(format!("failed to register socket: {e}")))
}

/// Offsets, relative to the start of a search cycle, at which the handshake
/// is broadcast.
///
/// Cycles longer than [`REBROADCAST_DELAY`] send a second copy to make up
/// for lost broadcast packets.
pub fn probe_offsets(search_interval: Duration) -> Vec<Duration> {
    if search_interval > REBROADCAST_DELAY {
        vec![Duration::ZERO, REBROADCAST_DELAY]
    } else {
        vec![Duration::ZERO]
    }
}

/// Send one handshake probe to `target`
pub async fn send_probe(socket: &UdpSocket, target: SocketAddr) -> Result<()> {
    let probe = build_handshake();
    socket
        .send_to(&probe, target)
        .await
        .map_err(|e| MiioError::socket(format!("failed to send probe to {target}: {e}")))?;
    debug!("Sent handshake probe to {}", target);
    Ok(())
}
