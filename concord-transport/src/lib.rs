// SPDX-License-Identifier: MIT

mod frame;
mod policy;

pub use policy::DeliveryPolicy;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use concord_core::{now_ms, ConcordError, Envelope, MessageKind, PeerId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered message handler. The returned bytes, if any, ride back to
/// the sender inside the ack frame.
pub type Handler = Box<dyn Fn(Envelope) -> BoxFuture<'static, Result<Option<Vec<u8>>>> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerCounters {
    pub sent: u64,
    pub received: u64,
    pub failed: u64,
}

/// Bounded memory of recently handled message ids and their replies, so a
/// retried message is re-acked instead of re-dispatched.
struct SeenIds {
    replies: HashMap<String, Option<Vec<u8>>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            replies: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, id: &str) -> Option<&Option<Vec<u8>>> {
        self.replies.get(id)
    }

    fn insert(&mut self, id: String, reply: Option<Vec<u8>>) {
        if self.replies.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.replies.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.replies.insert(id, reply);
    }
}

/// Reliable point-to-point messaging between cluster peers.
///
/// Every message is one framed envelope over a fresh TCP connection; an
/// acknowledged send waits for the ack frame on the same connection, so
/// delivery, the ack deadline and the retry loop all live here and callers
/// only see success or `ConcordError::Transport`.
pub struct Transport {
    self_id: PeerId,
    policy: DeliveryPolicy,
    peers: RwLock<HashMap<PeerId, String>>,
    handlers: RwLock<HashMap<MessageKind, Handler>>,
    seen: Mutex<SeenIds>,
    counters: Mutex<HashMap<PeerId, PeerCounters>>,
    msg_counter: AtomicU64,
}

impl Transport {
    pub fn new(self_id: PeerId) -> Arc<Self> {
        Self::with_policy(self_id, DeliveryPolicy::default())
    }

    pub fn with_policy(self_id: PeerId, policy: DeliveryPolicy) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            policy,
            peers: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenIds::new(1024)),
            counters: Mutex::new(HashMap::new()),
            msg_counter: AtomicU64::new(0),
        })
    }

    pub async fn add_peer(&self, peer: PeerId, addr: String) {
        self.peers.write().await.insert(peer, addr);
    }

    pub async fn remove_peer(&self, peer: PeerId) {
        self.peers.write().await.remove(&peer);
    }

    pub async fn register_handler(&self, kind: MessageKind, handler: Handler) {
        debug!("[Transport] Registered handler for {:?}", kind);
        self.handlers.write().await.insert(kind, handler);
    }

    /// Bind the listener and start accepting peer connections. Returns the
    /// bound address (useful when binding port 0).
    pub async fn start(
        self: Arc<Self>,
        bind: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("transport failed to bind {}", bind))?;
        let addr = listener.local_addr()?;
        info!("[Transport] Node {} listening on {}", self.self_id, addr);

        let transport = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let t = transport.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = t.handle_connection(stream).await {
                                        debug!("[Transport] Connection error: {:#}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("[Transport] Accept failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("[Transport] Listener stopped");
                            return;
                        }
                    }
                }
            }
        });
        Ok(addr)
    }

    /// Send `payload` to `peer`. With `requires_ack` the call resolves to
    /// the handler's reply bytes once the peer acknowledges; without it the
    /// frame is written and forgotten. Retries and backoff per policy.
    pub async fn send(
        &self,
        peer: PeerId,
        kind: MessageKind,
        payload: Vec<u8>,
        requires_ack: bool,
    ) -> Result<Option<Vec<u8>>> {
        let addr = self
            .peers
            .read()
            .await
            .get(&peer)
            .cloned()
            .ok_or_else(|| ConcordError::Transport(format!("unknown peer {}", peer)))?;

        let envelope = Envelope {
            id: self.next_message_id(),
            kind,
            sender: self.self_id,
            payload,
            timestamp_ms: now_ms(),
            requires_ack,
        };

        let mut last_err = anyhow!("no attempts made");
        for attempt in 1..=self.policy.max_attempts {
            match self.send_once(&addr, &envelope).await {
                Ok(reply) => {
                    self.counters.lock().await.entry(peer).or_default().sent += 1;
                    return Ok(reply);
                }
                Err(e) => {
                    warn!(
                        "[Transport] Send {:?} to peer {} failed (attempt {}/{}): {:#}",
                        kind, peer, attempt, self.policy.max_attempts, e
                    );
                    last_err = e;
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.backoff(attempt)).await;
                    }
                }
            }
        }

        self.counters.lock().await.entry(peer).or_default().failed += 1;
        Err(ConcordError::Transport(format!("peer {}: {:#}", peer, last_err)).into())
    }

    async fn send_once(&self, addr: &str, envelope: &Envelope) -> Result<Option<Vec<u8>>> {
        let deadline = self.policy.ack_timeout;
        let mut stream = tokio::time::timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow!("connect timeout"))??;
        frame::write_frame(&mut stream, envelope).await?;

        if !envelope.requires_ack {
            return Ok(None);
        }

        let ack = tokio::time::timeout(deadline, frame::read_frame(&mut stream))
            .await
            .map_err(|_| anyhow!("ack timeout"))??;
        if ack.kind != MessageKind::Ack || ack.id != format!("ack:{}", envelope.id) {
            anyhow::bail!("unexpected ack frame {:?}", ack.kind);
        }
        Ok(if ack.payload.is_empty() { None } else { Some(ack.payload) })
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let envelope = frame::read_frame(&mut stream).await?;

        // Duplicate delivery: re-ack with the remembered reply, skip dispatch.
        if let Some(prev) = self.seen.lock().await.get(&envelope.id).cloned() {
            debug!("[Transport] Duplicate message {}, re-acking", envelope.id);
            if envelope.requires_ack {
                let ack = envelope.ack(self.self_id, prev);
                frame::write_frame(&mut stream, &ack).await?;
            }
            return Ok(());
        }

        self.counters
            .lock()
            .await
            .entry(envelope.sender)
            .or_default()
            .received += 1;

        let reply = {
            let handlers = self.handlers.read().await;
            match handlers.get(&envelope.kind) {
                Some(handler) => match handler(envelope.clone()).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!("[Transport] Handler for {:?} failed: {:#}", envelope.kind, e);
                        None
                    }
                },
                None => {
                    warn!("[Transport] No handler for {:?}, dropping", envelope.kind);
                    return Ok(());
                }
            }
        };

        self.seen.lock().await.insert(envelope.id.clone(), reply.clone());

        if envelope.requires_ack {
            let ack = envelope.ack(self.self_id, reply);
            frame::write_frame(&mut stream, &ack).await?;
        }
        Ok(())
    }

    fn next_message_id(&self) -> String {
        let n = self.msg_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}:{}", self.self_id, now_ms(), n)
    }

    pub async fn stats(&self) -> Vec<(PeerId, PeerCounters)> {
        let mut stats: Vec<_> = self
            .counters
            .lock()
            .await
            .iter()
            .map(|(peer, c)| (*peer, *c))
            .collect();
        stats.sort_by_key(|(peer, _)| *peer);
        stats
    }
}
