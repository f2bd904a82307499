//! sharemeshd server - accept loop, link sessions and background tasks

use crate::broadcast::{BroadcastStats, Freshness, GossipBroadcaster};
use crate::config::Config;
use crate::link::LinkManager;
use crate::selector::PeerSelector;
use crate::storage::{RecordStore, StorageError};
use crate::sync::{AntiEntropy, SyncError};
use chrono::{DateTime, Local, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use sharemesh_core::unix_now;
use sharemesh_net::messages::{share_content, shared_record};
use sharemesh_net::transport::{framed, open_channel, recv_frame, send_frame};
use sharemesh_net::{
    Channel, Frame, FrameError, FrameType, FramedStream, GetHistory, Heartbeat, History, OpenChannel,
    PeerHandle, PeerRole, ReflectedAddr, TcpReflector, TransportError,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capacity of the downstream outbound queue
pub const OUTBOUND_CAPACITY: usize = 256;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Server state
pub struct Server {
    config: Config,
    local_host: String,
    store: Arc<RecordStore>,
    links: Arc<LinkManager>,
    broadcaster: Arc<GossipBroadcaster>,
    sync: Arc<AntiEntropy>,
    selector: PeerSelector<TcpReflector>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance. The record store opens on first use.
    pub fn new(config: Config) -> Arc<Self> {
        let local_host = config.local_host();
        let store = Arc::new(RecordStore::new(&config.data_dir, config.store_options()));
        let links = Arc::new(LinkManager::new());
        let broadcaster = Arc::new(GossipBroadcaster::new(
            store.clone(),
            links.clone(),
            config.broadcast_options(),
        ));
        let sync = Arc::new(AntiEntropy::new(broadcaster.clone(), config.sync_options()));
        let selector = PeerSelector::new(
            TcpReflector::new(config.probe_timeout()),
            local_host.clone(),
            config.production,
            config.probe_timeout(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            config,
            local_host,
            store,
            links,
            broadcaster,
            sync,
            selector,
            shutdown_tx,
        })
    }

    /// Ingestion entry point, also used for local submissions
    pub fn broadcaster(&self) -> &Arc<GossipBroadcaster> {
        &self.broadcaster
    }

    pub fn links(&self) -> &Arc<LinkManager> {
        &self.links
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(self.config.listen)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: self.config.listen,
                source,
            })
    }

    /// Run the server on the configured listen address
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.run_on(listener).await
    }

    /// Run the server on an already bound listener until shutdown
    pub async fn run_on(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            "Starting sharemeshd as {} on {} ({} known peer(s))",
            self.local_host,
            listener.local_addr()?,
            self.config.peers.len()
        );

        // Spawn background tasks
        let reconcile_handle = self.spawn_reconcile_task();
        let eviction_handle = self.spawn_eviction_task();

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, addr).await {
                                    debug!("Connection from {} ended: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        reconcile_handle.abort();
        eviction_handle.abort();

        if self.store.is_provisioned() {
            self.store.flush().await?;
        }

        Ok(())
    }

    /// Dispatch an incoming connection on its first frame
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        stream.set_nodelay(true)?;
        let mut stream = framed(stream);
        let first = recv_frame(&mut stream, self.config.probe_timeout()).await?;

        match first.frame_type {
            FrameType::WhatsMyIp => {
                send_frame(&mut stream, ReflectedAddr { ip: addr.ip() }.to_frame()?).await?;
                Ok(())
            }
            FrameType::OpenChannel => {
                let open = OpenChannel::from_frame(&first)?;
                let peer = open.host.unwrap_or_else(|| addr.to_string());
                match open.channel {
                    Channel::Subscribe => self.serve_subscriber(stream, &peer).await,
                    Channel::Deliver => self.accept_deliveries(stream, &peer).await,
                }
            }
            other => Err(FrameError::Unexpected(other).into()),
        }
    }

    /// A downstream subscribed to us: answer its history request and stream
    /// every newly stored record to it.
    async fn serve_subscriber(&self, stream: FramedStream, peer: &str) -> Result<(), ServerError> {
        info!("{} subscribed", peer);
        let mut feed = self.broadcaster.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut heartbeat = Heartbeat::new(self.config.link_idle());
        let (mut sink, mut source) = stream.split();

        loop {
            let deadline = heartbeat.deadline();
            tokio::select! {
                frame = source.next() => {
                    let frame = match frame {
                        None => return Ok(()),
                        Some(frame) => frame?,
                    };
                    heartbeat.heard();
                    match frame.frame_type {
                        FrameType::Ping => {}
                        FrameType::GetHistory => {
                            let request = GetHistory::from_frame(&frame)?;
                            let history = self.sync.serve(&request, unix_now()).await?;
                            sink.send(history.to_frame()?).await?;
                        }
                        other => debug!("Ignoring {:?} from subscriber {}", other, peer),
                    }
                }
                record = feed.recv() => {
                    match record {
                        Ok(record) => sink.send(share_content(&record)?).await?,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Subscriber {} lagging, skipped {} record(s)", peer, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                _ = heartbeat.tick() => sink.send(Frame::ping()).await?,
                _ = sleep_until(deadline) => return Err(heartbeat.expired().into()),
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }

    /// An upstream delivers to us: ingest its records as live gossip
    async fn accept_deliveries(&self, mut stream: FramedStream, peer: &str) -> Result<(), ServerError> {
        info!("{} delivering", peer);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut heartbeat = Heartbeat::new(self.config.link_idle());

        loop {
            let deadline = heartbeat.deadline();
            tokio::select! {
                frame = stream.next() => {
                    let frame = match frame {
                        None => return Ok(()),
                        Some(frame) => frame?,
                    };
                    heartbeat.heard();
                    match frame.frame_type {
                        FrameType::Ping => {}
                        FrameType::ShareContent => self.ingest(&frame, peer).await,
                        other => debug!("Ignoring {:?} from {}", other, peer),
                    }
                }
                _ = heartbeat.tick() => stream.send(Frame::ping()).await?,
                _ = sleep_until(deadline) => return Err(heartbeat.expired().into()),
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }

    async fn ingest(&self, frame: &Frame, peer: &str) {
        let record = match shared_record(frame) {
            Ok(record) => record,
            Err(e) => {
                warn!("Undecodable record from {}: {}", peer, e);
                return;
            }
        };
        match self.broadcaster.receive(record, Freshness::Live).await {
            Ok(outcome) => debug!("Record from {}: {:?}", peer, outcome),
            Err(e) => warn!("Could not store record from {}: {}", peer, e),
        }
    }

    /// Spawn the link reconciler
    fn spawn_reconcile_task(self: &Arc<Self>) -> JoinHandle<()> {
        let server = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            if !server.config.production {
                let delay = Duration::from_millis(server.config.startup_delay_ms);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_rx.recv() => return,
                }
            }

            let mut ticker = interval(Duration::from_secs(server.config.reconcile_interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = server.broadcaster.retry_deferred().await {
                            warn!("Deferred records still waiting: {}", e);
                        }
                        server.reconcile().await
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Fill empty link slots, upstream first
    async fn reconcile(self: &Arc<Self>) {
        for role in [PeerRole::Upstream, PeerRole::Downstream] {
            if !self.links.is_vacant(role) {
                continue;
            }
            let candidates = self.links.candidates(role, &self.config.peers, &self.local_host);
            let Some(host) = self.selector.select(&candidates).await else {
                debug!("No {} candidate available", role);
                continue;
            };
            // Slots may have changed while probing
            let Some(generation) = self.links.begin_connect(role, &host) else {
                continue;
            };

            let server = self.clone();
            let session = async move {
                match role {
                    PeerRole::Upstream => server.upstream_session(&host, generation).await,
                    PeerRole::Downstream => server.downstream_session(&host, generation).await,
                }
            };
            supervise_link(self.links.clone(), role, generation, session);
        }
    }

    /// Subscribe to an upstream, catch up on its history, and ingest its
    /// live records until the link drops.
    async fn upstream_session(&self, host: &str, generation: u64) -> Result<(), ServerError> {
        let stream = open_channel(
            host,
            Channel::Subscribe,
            Some(&self.local_host),
            self.config.probe_timeout(),
        )
        .await?;
        if !self.links.mark_connected(PeerRole::Upstream, generation, None) {
            return Ok(());
        }

        let (mut sink, mut source) = stream.split();
        let request = self.sync.request(unix_now()).await?;
        sink.send(request.to_frame()?).await?;

        let (history_tx, history_rx) = oneshot::channel();
        let mut history_tx = Some(history_tx);
        let sync = self.sync.clone();
        let upstream = host.to_string();
        tokio::spawn(async move {
            match sync.await_history(&request, history_rx).await {
                Ok(report) => debug!("Catch-up from {}: {:?}", upstream, report),
                Err(e) => warn!("Catch-up from {} ended: {}", upstream, e),
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut heartbeat = Heartbeat::new(self.config.link_idle());
        loop {
            let deadline = heartbeat.deadline();
            tokio::select! {
                frame = source.next() => {
                    let frame = match frame {
                        None => return Err(TransportError::ConnectionClosed.into()),
                        Some(frame) => frame?,
                    };
                    heartbeat.heard();
                    match frame.frame_type {
                        FrameType::Ping => {}
                        FrameType::ShareContent => self.ingest(&frame, host).await,
                        FrameType::History => match (history_tx.take(), History::from_frame(&frame)) {
                            (Some(tx), Ok(history)) => {
                                let _ = tx.send(history);
                            }
                            (None, _) => debug!("Ignoring unsolicited history from {}", host),
                            (Some(_), Err(e)) => warn!("Bad history from {}: {}", host, e),
                        },
                        other => debug!("Ignoring {:?} from upstream {}", other, host),
                    }
                }
                _ = heartbeat.tick() => sink.send(Frame::ping()).await?,
                _ = sleep_until(deadline) => return Err(heartbeat.expired().into()),
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }

    /// Deliver newly stored records to a downstream until the link drops
    async fn downstream_session(&self, host: &str, generation: u64) -> Result<(), ServerError> {
        let mut stream = open_channel(
            host,
            Channel::Deliver,
            Some(&self.local_host),
            self.config.probe_timeout(),
        )
        .await?;
        let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        if !self
            .links
            .mark_connected(PeerRole::Downstream, generation, Some(outbound_tx))
        {
            return Ok(());
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut heartbeat = Heartbeat::new(self.config.link_idle());
        loop {
            let deadline = heartbeat.deadline();
            tokio::select! {
                record = outbound_rx.recv() => match record {
                    Some(record) => stream.send(share_content(&record)?).await?,
                    None => return Ok(()),
                },
                frame = stream.next() => {
                    let frame = match frame {
                        None => return Err(TransportError::ConnectionClosed.into()),
                        Some(frame) => frame?,
                    };
                    heartbeat.heard();
                    if frame.frame_type != FrameType::Ping {
                        debug!("Ignoring {:?} from downstream {}", frame.frame_type, host);
                    }
                }
                _ = heartbeat.tick() => stream.send(Frame::ping()).await?,
                _ = sleep_until(deadline) => return Err(heartbeat.expired().into()),
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }
    }

    /// Spawn the daily shard eviction, at local midnight
    fn spawn_eviction_task(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let wait = until_next_midnight(Local::now());
                debug!("Next shard eviction in {:?}", wait);
                tokio::select! {
                    _ = sleep(wait) => {
                        if let Err(e) = store.evict(Utc::now().date_naive()).await {
                            warn!("Shard eviction failed, retrying tomorrow: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            upstream: self.links.handle(PeerRole::Upstream),
            downstream: self.links.handle(PeerRole::Downstream),
            ingest: self.broadcaster.stats(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub upstream: Option<PeerHandle>,
    pub downstream: Option<PeerHandle>,
    pub ingest: BroadcastStats,
}

/// Run a link session in its own task and free its slot however it ends,
/// panics included.
fn supervise_link<F>(links: Arc<LinkManager>, role: PeerRole, generation: u64, session: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), ServerError>> + Send + 'static,
{
    tokio::spawn(async move {
        let error = match tokio::spawn(session).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => {
                error!("{} link task failed: {}", role, e);
                Some(format!("Link task failed: {e}"))
            }
        };
        links.mark_disconnected(role, generation, error);
    })
}

/// Time left until the next local midnight
fn until_next_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> Duration {
    let fallback = Duration::from_secs(60 * 60);
    let tz = now.timezone();
    now.date_naive()
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .and_then(|midnight| tz.from_local_datetime(&midnight).earliest())
        .and_then(|next| (next - now).to_std().ok())
        .unwrap_or(fallback)
}
