//! Peer replication client
//!
//! Mutations are queued on a bounded tokio channel and drained by one worker
//! task, strictly in FIFO order. Each update is pushed to every peer that is
//! not marked down, with a fixed number of attempts per peer. One accepting
//! peer is enough for the update to count as sent; a peer that exhausts its
//! attempts is marked down and skipped until a call to it succeeds again (or
//! [`DistributedClient::revive_peers`] is called).
//!
//! Enqueueing never blocks and works from any thread. In sync mode
//! (`async_updates = false`) the caller blocks on the runtime until the
//! fan-out finishes, so it must run on a plain thread, a `spawn_blocking`
//! thread, or a multi-threaded runtime worker.

use super::{Mutation, PropagateRequest, Replicator};
use crate::KvError;
use crate::config::DistributedConfig;
use crate::core::{Key, Value};
use crate::metrics::Metrics;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

struct Peer {
    url: String,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Per-peer counters
#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub url: String,
    pub down: bool,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Client statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub node_id: String,
    pub nodes: usize,
    pub nodes_down: usize,
    pub propagations_sent: u64,
    pub propagations_failed: u64,
    pub propagations_dropped: u64,
    pub reads_sent: u64,
    pub reads_failed: u64,
    pub async_updates: bool,
    /// Updates waiting in the queue
    pub queue_size: usize,
    /// Updates accepted and not yet finished (queued plus in flight)
    pub pending: usize,
    pub max_queue_size: usize,
    pub queue_utilization: f64,
    pub retry_attempts: u32,
    pub retry_interval_ms: u64,
    pub peers: Vec<PeerStats>,
}

/// State shared between callers and the worker task
struct ClientInner {
    node_id: String,
    api_prefix: String,
    auth_token: Option<String>,
    source_header: String,
    config: DistributedConfig,
    http: Client,
    peers: Vec<Peer>,
    down: Mutex<HashSet<String>>,
    pending: AtomicUsize,
    idle: Notify,
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    reads_sent: AtomicU64,
    reads_failed: AtomicU64,
    metrics: Option<Arc<Metrics>>,
    span: Span,
}

/// Builder for [`DistributedClient`]
pub struct ClientBuilder {
    config: DistributedConfig,
    node_id: String,
    api_prefix: String,
    auth_token: Option<String>,
    source_header: String,
    metrics: Option<Arc<Metrics>>,
    span: Option<Span>,
    runtime: Option<Handle>,
    cancel_token: Option<CancellationToken>,
}

impl ClientBuilder {
    /// Route prefix on the peers (default `/api/v1`)
    pub fn api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    /// Bearer token sent to peers
    pub fn auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    /// Loop-guard header carrying this node's id
    pub fn source_header(mut self, header: impl Into<String>) -> Self {
        self.source_header = header.into();
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Runtime the worker runs on (default: the current one)
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Stop the worker when `token` is cancelled
    pub fn cancel_token(mut self, token: &CancellationToken) -> Self {
        self.cancel_token = Some(token.child_token());
        self
    }

    /// Build the client and, in async mode, spawn its worker task
    pub fn build(self) -> crate::Result<DistributedClient> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| {
                KvError::Config(
                    "DistributedClient needs a Tokio runtime: build it inside one or pass a handle"
                        .to_string(),
                )
            })?,
        };

        let http = Client::builder()
            .connect_timeout(self.config.connect_timeout())
            .read_timeout(self.config.read_timeout())
            .build()
            .map_err(|e| KvError::Config(format!("Failed to build HTTP client: {e}")))?;

        let span = self.span.unwrap_or_else(
            || tracing::info_span!("distributed_client", node_id = %self.node_id),
        );

        let peers = self
            .config
            .peers
            .iter()
            .map(|url| Peer {
                url: url.trim_end_matches('/').to_string(),
                attempts: AtomicU64::new(0),
                successes: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            })
            .collect();

        let async_updates = self.config.async_updates;
        let max_queue_size = self.config.max_queue_size.max(1);
        let cancel_token = self.cancel_token.unwrap_or_else(CancellationToken::new);

        let inner = Arc::new(ClientInner {
            node_id: self.node_id,
            api_prefix: self.api_prefix,
            auth_token: self.auth_token,
            source_header: self.source_header,
            config: self.config,
            http,
            peers,
            down: Mutex::new(HashSet::new()),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            reads_sent: AtomicU64::new(0),
            reads_failed: AtomicU64::new(0),
            metrics: self.metrics,
            span,
        });

        let (sender, worker) = if async_updates {
            let (tx, rx) = mpsc::channel(max_queue_size);
            let worker = runtime.spawn(
                run_worker(Arc::clone(&inner), rx, cancel_token.clone())
                    .instrument(inner.span.clone()),
            );
            (Some(tx), Some(worker))
        } else {
            (None, None)
        };

        inner.span.in_scope(|| {
            info!(
                peers = inner.peers.len(),
                async_updates,
                max_queue_size,
                "Initialized distributed client"
            );
        });

        Ok(DistributedClient {
            inner,
            runtime,
            sender: Mutex::new(sender),
            worker: Mutex::new(worker),
            cancel_token,
        })
    }
}

/// Best-effort replication client
pub struct DistributedClient {
    inner: Arc<ClientInner>,
    runtime: Handle,
    sender: Mutex<Option<mpsc::Sender<Mutation>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl DistributedClient {
    pub fn builder(config: DistributedConfig, node_id: impl Into<String>) -> ClientBuilder {
        ClientBuilder {
            config,
            node_id: node_id.into(),
            api_prefix: "/api/v1".to_string(),
            auth_token: None,
            source_header: "X-Propagation-Source".to_string(),
            metrics: None,
            span: None,
            runtime: None,
            cancel_token: None,
        }
    }

    /// Build on the current runtime
    pub fn new(config: DistributedConfig, node_id: impl Into<String>) -> crate::Result<Self> {
        Self::builder(config, node_id).build()
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn propagate_set(&self, key: &Key, value: &Value) -> bool {
        self.submit(Mutation::Set {
            key: key.clone(),
            value: value.clone(),
        })
    }

    pub fn propagate_delete(&self, key: &Key) -> bool {
        self.submit(Mutation::Delete { key: key.clone() })
    }

    pub fn propagate_clear(&self) -> bool {
        self.submit(Mutation::Clear)
    }

    /// Queue (async mode) or deliver (sync mode) a mutation
    ///
    /// Returns `true` if the update was queued, or in sync mode, accepted by
    /// at least one peer. Never waits on a full queue.
    pub fn submit(&self, mutation: Mutation) -> bool {
        let inner = &self.inner;
        let _enter = inner.span.enter();

        if self.cancel_token.is_cancelled() {
            warn!(operation = ?mutation.operation(), "Client is shut down, dropping update");
            inner.record_drop();
            return false;
        }

        if !inner.config.async_updates {
            return self.block_on(inner.deliver(&mutation));
        }

        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            warn!(operation = ?mutation.operation(), "Client is shut down, dropping update");
            inner.record_drop();
            return false;
        };

        inner.begin_one();
        match tx.try_send(mutation) {
            Ok(()) => true,
            Err(TrySendError::Full(mutation)) => {
                inner.finish_one();
                inner.record_drop();
                error!(operation = ?mutation.operation(), "Update queue is full, dropping update");
                false
            }
            Err(TrySendError::Closed(mutation)) => {
                inner.finish_one();
                inner.record_drop();
                error!(operation = ?mutation.operation(), "Propagation worker is gone, dropping update");
                false
            }
        }
    }

    /// Fetch a key from the first peer that answers definitively
    ///
    /// 200 yields the envelope, 404 yields `None`. Errors and undecodable
    /// bodies move on to the next peer; down peers are skipped.
    pub async fn get_remote(&self, key: &Key) -> Option<Value> {
        self.inner
            .get_remote(key)
            .instrument(self.inner.span.clone())
            .await
    }

    /// Wait until every accepted update has been processed
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        tokio::time::timeout(timeout, async {
            loop {
                let idle = inner.idle.notified();
                if inner.pending.load(Ordering::Acquire) == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok()
    }

    /// Clear the down-set so every peer is tried again
    pub fn revive_peers(&self) {
        let revived = std::mem::take(&mut *self.inner.down.lock()).len();
        if revived > 0 {
            let _enter = self.inner.span.enter();
            info!(revived, "Peers revived");
        }
    }

    /// Stop the worker and wait at most `shutdown_timeout` for it
    ///
    /// The update in flight finishes; updates still queued behind it are
    /// abandoned. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        drop(self.sender.lock().take());

        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };

        let timeout = self.inner.config.shutdown_timeout();
        let span = self.inner.span.clone();
        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(())) => span.in_scope(|| info!("Distributed client stopped")),
            Ok(Err(e)) => span.in_scope(|| error!("Propagation worker failed: {}", e)),
            Err(_) => span.in_scope(|| {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Propagation worker did not stop in time, detaching"
                );
            }),
        }
    }

    pub fn stats(&self) -> ClientStats {
        let inner = &self.inner;
        let down = inner.down.lock().clone();
        let queue_size = self
            .sender
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity());
        let max_queue_size = inner.config.max_queue_size;

        ClientStats {
            node_id: inner.node_id.clone(),
            nodes: inner.peers.len(),
            nodes_down: down.len(),
            propagations_sent: inner.sent.load(Ordering::Relaxed),
            propagations_failed: inner.failed.load(Ordering::Relaxed),
            propagations_dropped: inner.dropped.load(Ordering::Relaxed),
            reads_sent: inner.reads_sent.load(Ordering::Relaxed),
            reads_failed: inner.reads_failed.load(Ordering::Relaxed),
            async_updates: inner.config.async_updates,
            queue_size,
            pending: inner.pending.load(Ordering::Acquire),
            max_queue_size,
            queue_utilization: if max_queue_size > 0 {
                queue_size as f64 / max_queue_size as f64 * 100.0
            } else {
                0.0
            },
            retry_attempts: inner.config.retry_attempts,
            retry_interval_ms: inner.config.retry_interval_ms,
            peers: inner
                .peers
                .iter()
                .map(|peer| PeerStats {
                    url: peer.url.clone(),
                    down: down.contains(&peer.url),
                    attempts: peer.attempts.load(Ordering::Relaxed),
                    successes: peer.successes.load(Ordering::Relaxed),
                    failures: peer.failures.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    /// Drive `future` to completion from synchronous code
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match Handle::try_current().map(|h| h.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => {
                tokio::task::block_in_place(|| self.runtime.block_on(future))
            }
            _ => self.runtime.block_on(future),
        }
    }
}

impl Replicator for DistributedClient {
    fn propagate(&self, mutation: Mutation) -> bool {
        self.submit(mutation)
    }
}

impl Drop for DistributedClient {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.sender.get_mut().take();
    }
}

async fn run_worker(
    inner: Arc<ClientInner>,
    mut rx: mpsc::Receiver<Mutation>,
    cancel_token: CancellationToken,
) {
    debug!("Propagation worker started");

    loop {
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => break,
            next = rx.recv() => {
                let Some(mutation) = next else { break };
                inner.deliver(&mutation).await;
                inner.finish_one();
            }
        }
    }

    rx.close();
    let mut abandoned = 0usize;
    while rx.try_recv().is_ok() {
        abandoned += 1;
        inner.finish_one();
    }
    if abandoned > 0 {
        warn!(abandoned, "Abandoned queued updates at shutdown");
    }

    debug!("Propagation worker stopped");
}

impl ClientInner {
    /// Push one update to every eligible peer. `true` if any accepted it.
    async fn deliver(self: &Arc<Self>, mutation: &Mutation) -> bool {
        let request = match mutation.to_request() {
            Ok(request) => request,
            Err(e) => {
                error!(operation = ?mutation.operation(), "Cannot encode update: {}", e);
                self.record_failure();
                return false;
            }
        };

        let eligible: Vec<usize> = (0..self.peers.len())
            .filter(|&idx| !self.is_down(&self.peers[idx].url))
            .collect();
        if eligible.is_empty() {
            warn!(operation = ?mutation.operation(), "No reachable peers for update");
            self.record_failure();
            return false;
        }

        let mut success = false;
        if self.config.concurrent_fanout && eligible.len() > 1 {
            let request = Arc::new(request);
            let mut fanout = JoinSet::new();
            for idx in eligible {
                let inner = Arc::clone(self);
                let request = Arc::clone(&request);
                fanout.spawn(
                    async move { inner.push_to_peer(&inner.peers[idx], &request).await }
                        .instrument(Span::current()),
                );
            }
            while let Some(joined) = fanout.join_next().await {
                success |= joined.unwrap_or(false);
            }
        } else {
            for idx in eligible {
                success |= self.push_to_peer(&self.peers[idx], &request).await;
            }
        }

        if success {
            self.sent.fetch_add(1, Ordering::Relaxed);
            self.metric(|m| m.propagations_sent.inc());
            debug!(operation = ?mutation.operation(), "Update propagated");
        } else {
            self.record_failure();
        }
        success
    }

    async fn push_to_peer(&self, peer: &Peer, request: &PropagateRequest) -> bool {
        let url = format!("{}{}/propagate", peer.url, self.api_prefix);
        let attempts = self.config.retry_attempts.max(1);

        for attempt in 1..=attempts {
            peer.attempts.fetch_add(1, Ordering::Relaxed);
            let outcome = self
                .authorize(self.http.post(&url))
                .header(self.source_header.as_str(), self.node_id.as_str())
                .json(request)
                .send()
                .await;

            match outcome {
                Ok(resp) if resp.status() == StatusCode::OK => {
                    peer.successes.fetch_add(1, Ordering::Relaxed);
                    self.mark_up(peer);
                    return true;
                }
                Ok(resp) => {
                    warn!(peer = %peer.url, attempt, status = %resp.status(), "Error propagating update");
                }
                Err(e) => {
                    warn!(peer = %peer.url, attempt, "Connection error propagating update: {}", e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_interval()).await;
            }
        }

        peer.failures.fetch_add(1, Ordering::Relaxed);
        self.mark_down(peer);
        false
    }

    async fn get_remote(&self, key: &Key) -> Option<Value> {
        let attempts = self.config.retry_attempts.max(1);

        for peer in &self.peers {
            if self.is_down(&peer.url) {
                debug!(peer = %peer.url, "Skipping down peer");
                continue;
            }

            let Some(url) = self.key_url(&peer.url, key) else {
                warn!(peer = %peer.url, "Invalid peer URL");
                continue;
            };

            for attempt in 1..=attempts {
                peer.attempts.fetch_add(1, Ordering::Relaxed);
                match self.authorize(self.http.get(url.clone())).send().await {
                    Ok(resp) if resp.status() == StatusCode::OK => {
                        let decoded = match resp.json::<serde_json::Value>().await {
                            Ok(raw) => Value::from_structured(&raw).map_err(|e| e.to_string()),
                            Err(e) => Err(e.to_string()),
                        };
                        match decoded {
                            Ok(value) => {
                                self.mark_up(peer);
                                self.reads_sent.fetch_add(1, Ordering::Relaxed);
                                return Some(value);
                            }
                            Err(e) => {
                                warn!(peer = %peer.url, attempt, "Undecodable value from peer: {}", e);
                            }
                        }
                    }
                    Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                        self.mark_up(peer);
                        self.reads_sent.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                    Ok(resp) => {
                        warn!(peer = %peer.url, attempt, status = %resp.status(), "Error getting key from peer");
                    }
                    Err(e) => {
                        warn!(peer = %peer.url, attempt, "Connection error getting key from peer: {}", e);
                    }
                }
                if attempt < attempts {
                    tokio::time::sleep(self.config.retry_interval()).await;
                }
            }

            self.reads_failed.fetch_add(1, Ordering::Relaxed);
            peer.failures.fetch_add(1, Ordering::Relaxed);
            self.mark_down(peer);
        }

        warn!(key = %key, "All peers failed while getting key");
        None
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn key_url(&self, peer: &str, key: &Key) -> Option<reqwest::Url> {
        let mut url = reqwest::Url::parse(&format!("{peer}{}/key", self.api_prefix)).ok()?;
        url.path_segments_mut().ok()?.push(key.as_str());
        Some(url)
    }

    fn is_down(&self, url: &str) -> bool {
        self.down.lock().contains(url)
    }

    fn mark_down(&self, peer: &Peer) {
        if self.down.lock().insert(peer.url.clone()) {
            warn!(peer = %peer.url, "Peer marked down");
        }
    }

    fn mark_up(&self, peer: &Peer) {
        if self.down.lock().remove(&peer.url) {
            info!(peer = %peer.url, "Peer is back up");
        }
    }

    fn begin_one(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.metric(|m| m.propagations_failed.inc());
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.metric(|m| m.propagations_dropped.inc());
    }

    fn metric(&self, f: impl FnOnce(&Metrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}
