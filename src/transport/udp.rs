//! src/transport/udp.rs
//!
//! The IP mesh transport: a connectionless datagram socket with broadcast
//! and address reuse enabled, riding whatever routing layer (batman-adv,
//! OLSR) the host provides underneath. Broadcast is the default addressing
//! mode; unicast is best-effort.

use crate::error::{Error, Result};
use crate::transport::{Frame, Transport};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;

pub const DEFAULT_PORT: u16 = 47474;

/// Largest datagram `recv` will return.
const MAX_DATAGRAM: usize = 65_535;

pub struct UdpTransport {
    port: u16,
    /// Optional device name to bind (e.g. `bat0`). Linux only; ignored with
    /// a warning elsewhere.
    interface: Option<String>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl UdpTransport {
    pub fn new(port: u16, interface: Option<String>) -> Self {
        Self {
            port,
            interface,
            socket: Mutex::new(None),
        }
    }

    fn active_socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .expect("udp socket lock poisoned")
            .clone()
            .ok_or_else(|| Error::Transport("udp transport not started".into()))
    }

    fn resolve_dest(&self, dest: Option<&str>) -> Result<SocketAddr> {
        match dest {
            None => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.port)),
            Some(host) => {
                if let Ok(addr) = host.parse::<SocketAddr>() {
                    return Ok(addr);
                }
                host.parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, self.port))
                    .map_err(|_| Error::Transport(format!("unresolvable destination {host}")))
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn start(&self) -> Result<()> {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);

        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;

        if let Some(device) = &self.interface {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            socket.bind_device(Some(device.as_bytes()))?;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            tracing::warn!(device = %device, "Interface binding is unsupported on this platform");
        }

        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;

        tracing::info!(port = self.port, "UDP transport bound");
        *self.socket.lock().expect("udp socket lock poisoned") = Some(Arc::new(socket));
        Ok(())
    }

    async fn send(&self, data: &[u8], dest: Option<&str>) -> Result<()> {
        let socket = self.active_socket()?;
        let addr = self.resolve_dest(dest)?;
        socket
            .send_to(data, addr)
            .await
            .map_err(|e| Error::Transport(format!("udp send to {addr}: {e}")))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Frame>> {
        let socket = self.active_socket()?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match socket.try_recv_from(&mut buf) {
            Ok((len, peer)) => {
                buf.truncate(len);
                Ok(Some(Frame {
                    data: buf,
                    source: Some(peer.to_string()),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Transport(format!("udp recv: {e}"))),
        }
    }

    async fn stop(&self) {
        self.socket.lock().expect("udp socket lock poisoned").take();
    }
}

// --- Unit Tests ---
