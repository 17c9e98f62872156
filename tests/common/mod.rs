//! Common test utilities
//!
//! A fake miio device answering handshake probes over localhost UDP.

#![allow(dead_code)]

use miio_discovery::mock::StaticResolver;
use miio_discovery::packet::{self, PacketHeader};
use miio_discovery::{Browser, DiscoveryConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub const TOKEN_HEX: &str = "00112233445566778899aabbccddeeff";

/// Fake device replying to every handshake it receives
pub struct FakeDevice {
    pub addr: SocketAddr,
    socket: Arc<UdpSocket>,
    probes: Arc<AtomicUsize>,
    responder: JoinHandle<()>,
    header: PacketHeader,
}

impl FakeDevice {
    /// Start a device on `ip` replying with `device_id` and `checksum`
    pub async fn start(ip: &str, device_id: u32, checksum: [u8; 16]) -> Self {
        let socket = Arc::new(UdpSocket::bind((ip, 0)).await.expect("bind fake device"));
        let addr = socket.local_addr().unwrap();
        let probes = Arc::new(AtomicUsize::new(0));
        let header = PacketHeader::reply(device_id, 1, checksum);

        let responder = {
            let socket = socket.clone();
            let probes = probes.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                    if buf[..len] == packet::build_handshake() {
                        probes.fetch_add(1, Ordering::SeqCst);
                        let _ = socket.send_to(&header.to_bytes(), from).await;
                    }
                }
            })
        };

        Self {
            addr,
            socket,
            probes,
            responder,
            header,
        }
    }

    /// Device exposing its token on the wire
    pub async fn with_token(device_id: u32) -> Self {
        let token: miio_discovery::Token = TOKEN_HEX.parse().unwrap();
        Self::start("127.0.0.1", device_id, *token.as_bytes()).await
    }

    /// Device hiding its token behind the all-`f` sentinel
    pub async fn hidden_token(device_id: u32) -> Self {
        Self::start("127.0.0.1", device_id, [0xff; 16]).await
    }

    /// Send an unsolicited reply to `to`
    pub async fn announce_to(&self, to: SocketAddr) {
        self.socket
            .send_to(&self.header.to_bytes(), to)
            .await
            .expect("send reply");
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Stop answering probes
    pub fn silence(&self) {
        self.responder.abort();
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.responder.abort();
    }
}

/// Configuration probing `device` directly instead of broadcasting
pub fn config_for(device: &FakeDevice, cache_time: u64) -> DiscoveryConfig {
    DiscoveryConfig {
        cache_time,
        use_token_storage: false,
        port: device.addr.port(),
        broadcast_address: "127.0.0.1".parse().unwrap(),
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    }
}

/// Browser for `device` with a fixed reverse DNS answer
pub fn browser_for(device: &FakeDevice, cache_time: u64) -> Browser {
    Browser::new(config_for(device, cache_time)).with_reverse_resolver(Arc::new(
        StaticResolver::hostname("zhimi-airpurifier-m1_miio168496141"),
    ))
}

/// Await `future` or fail the test
pub async fn within<F: std::future::Future>(secs: u64, future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(secs), future)
        .await
        .expect("timed out")
}
