//! Reflection probe
//!
//! A peer answers `WhatsMyIp` with the address it sees the caller connect
//! from. A correct answer proves the path to the peer works end to end and
//! tells the caller whether it is publicly reachable.

use crate::framing::Frame;
use crate::messages::ReflectedAddr;
use crate::transport::{connect, recv_frame, send_frame, TransportError};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Asks a peer for the caller's apparent IP address
pub trait Reflector: Send + Sync {
    fn reflect(&self, host: &str) -> impl Future<Output = Result<IpAddr, TransportError>> + Send;
}

/// Reflection over the frame protocol
#[derive(Clone, Debug)]
pub struct TcpReflector {
    timeout: Duration,
}

impl TcpReflector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Reflector for TcpReflector {
    async fn reflect(&self, host: &str) -> Result<IpAddr, TransportError> {
        let mut stream = connect(host, self.timeout).await?;
        send_frame(&mut stream, Frame::whats_my_ip()).await?;
        let frame = recv_frame(&mut stream, self.timeout).await?;
        Ok(ReflectedAddr::from_frame(&frame)?.ip)
    }
}

/// Whether `ip` is publicly routable (not private, loopback or link-local)
pub fn is_external_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_external_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_external_v4(v4),
            None => is_external_v6(v6),
        },
    }
}

fn is_external_v4(ip: Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast())
}

fn is_external_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = first & 0xfe00 == 0xfc00;
    let link_local = first & 0xffc0 == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}
