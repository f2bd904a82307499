//! TCP transport layer
//!
//! Every link and probe is one TCP connection carrying length-prefixed frames.
//! The first frame names what the connection is for.

use crate::framing::{Frame, FrameCodec, FrameError};
use crate::messages::{Channel, OpenChannel};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::debug;

/// A TCP connection speaking the frame codec
pub type FramedStream = Framed<TcpStream, FrameCodec>;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Wrap an accepted or connected stream in the frame codec
pub fn framed(stream: TcpStream) -> FramedStream {
    Framed::new(stream, FrameCodec::new())
}

/// Connect to `host` (`name:port`) within `wait`
pub async fn connect(host: &str, wait: Duration) -> Result<FramedStream, TransportError> {
    let stream = timeout(wait, TcpStream::connect(host))
        .await
        .map_err(|_| TransportError::Timeout(wait))??;
    stream.set_nodelay(true)?;
    debug!("Connected to {}", host);
    Ok(framed(stream))
}

/// Connect to `host` and open a gossip channel on it
pub async fn open_channel(
    host: &str,
    channel: Channel,
    local_host: Option<&str>,
    wait: Duration,
) -> Result<FramedStream, TransportError> {
    let mut stream = connect(host, wait).await?;
    let open = OpenChannel {
        channel,
        host: local_host.map(str::to_string),
    };
    timeout(wait, stream.send(open.to_frame()?))
        .await
        .map_err(|_| TransportError::Timeout(wait))??;
    Ok(stream)
}

/// Send one frame
pub async fn send_frame(stream: &mut FramedStream, frame: Frame) -> Result<(), TransportError> {
    stream.send(frame).await?;
    Ok(())
}

/// Receive the next frame within `wait`
pub async fn recv_frame(stream: &mut FramedStream, wait: Duration) -> Result<Frame, TransportError> {
    match timeout(wait, stream.next()).await {
        Err(_) => Err(TransportError::Timeout(wait)),
        Ok(None) => Err(TransportError::ConnectionClosed),
        Ok(Some(frame)) => Ok(frame?),
    }
}

/// Keepalive and idle detection for a long-lived link.
///
/// Pings go out every third of the idle window; a link that has not been
/// heard from for the whole window is dead.
pub struct Heartbeat {
    idle: Duration,
    deadline: Instant,
    ticker: Interval,
}

impl Heartbeat {
    pub fn new(idle: Duration) -> Self {
        let period = (idle / 3).max(Duration::from_millis(10));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            idle,
            deadline: Instant::now() + idle,
            ticker,
        }
    }

    /// Something arrived from the peer
    pub fn heard(&mut self) {
        self.deadline = Instant::now() + self.idle;
    }

    /// When the link is dead unless heard from
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The error for a link that stayed silent past its deadline
    pub fn expired(&self) -> TransportError {
        TransportError::Timeout(self.idle)
    }

    /// Wait until the next ping is due
    pub async fn tick(&mut self) {
        self.ticker.tick().await;
    }
}
