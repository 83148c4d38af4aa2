//! The connection hub.
//!
//! Authoritative for `{connection → subscriptions}` and
//! `{document → subscriber connections}`, owner of agent lifecycles, and
//! the commit publisher the orchestrator fans out through. Registry locks
//! are only ever held to copy or update membership; all delivery happens
//! through the agents' mailboxes and the connections' outbound queues.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use easygrid_core::{Collection, ConnectionId, DocumentKey, Error, Result};
use easygrid_engine::{CommitPublisher, WriteOrchestrator};
use easygrid_ops::Operation;

use crate::agent::{presence_frame, AgentMsg, AgentShared, DocumentAgent, Outbound, Snapshot};
use crate::protocol::{action, Frame};

/// Hub tuning knobs, defaulted to the protocol's stated limits.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Outbound heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// A connection silent this long is force-closed.
    pub connection_timeout: Duration,
    /// An agent with no subscribers this long is reaped.
    pub agent_idle_timeout: Duration,
    /// Sweep cadence for the two timeouts above.
    pub sweep_interval: Duration,
    /// Bounded outbound queue per subscriber.
    pub outbound_queue: usize,
    /// Control queue for errors that must bypass a full data queue.
    pub control_queue: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(300),
            agent_idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            outbound_queue: 100,
            control_queue: 8,
        }
    }
}

/// Agent-to-hub notifications.
pub(crate) enum HubEvent {
    SlowSubscriber { conn: ConnectionId, key: DocumentKey },
}

#[derive(Clone)]
struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentMsg>,
    shared: Arc<AgentShared>,
}

struct ConnectionEntry {
    outbound: Outbound,
    subscriptions: BTreeSet<DocumentKey>,
    last_seen_ms: u64,
    handshaken: bool,
}

struct HubInner {
    orchestrator: Arc<WriteOrchestrator>,
    config: HubConfig,
    agents: RwLock<hashbrown::HashMap<DocumentKey, AgentHandle>>,
    connections: RwLock<hashbrown::HashMap<ConnectionId, ConnectionEntry>>,
    events: mpsc::UnboundedSender<HubEvent>,
}

/// The broker hub. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Creates the hub, installs it as the orchestrator's commit
    /// publisher, and spawns its background tasks. Must run inside a
    /// tokio runtime.
    pub fn new(orchestrator: Arc<WriteOrchestrator>, config: HubConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(HubInner {
            orchestrator: orchestrator.clone(),
            config,
            agents: RwLock::new(hashbrown::HashMap::new()),
            connections: RwLock::new(hashbrown::HashMap::new()),
            events: events_tx,
        });
        orchestrator.set_publisher(Arc::new(HubPublisher {
            inner: inner.clone(),
        }));

        let hub = Self { inner };
        hub.spawn_event_loop(events_rx);
        hub.spawn_sweeper();
        hub
    }

    /// The configured heartbeat cadence (the transport layer sends the
    /// actual pings).
    pub fn heartbeat_interval(&self) -> Duration {
        self.inner.config.heartbeat_interval
    }

    /// Registers a connection; returns its id plus the data and control
    /// frame streams the transport must pump to the client.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Frame>, mpsc::Receiver<Frame>) {
        let conn: ConnectionId = uuid::Uuid::new_v4().simple().to_string();
        let (data_tx, data_rx) = mpsc::channel(self.inner.config.outbound_queue);
        let (control_tx, control_rx) = mpsc::channel(self.inner.config.control_queue);
        let entry = ConnectionEntry {
            outbound: Outbound::new(conn.clone(), data_tx, control_tx),
            subscriptions: BTreeSet::new(),
            last_seen_ms: unix_ms(),
            handshaken: false,
        };
        self.inner.connections.write().insert(conn.clone(), entry);
        tracing::info!(conn = %conn, "connection registered");
        (conn, data_rx, control_rx)
    }

    /// Tears a connection down: every subscription is removed, the agents
    /// are notified, and no further frames are emitted to it.
    pub fn disconnect(&self, conn: &ConnectionId) {
        let entry = self.inner.connections.write().remove(conn);
        let Some(entry) = entry else {
            return;
        };
        tracing::info!(conn = %conn, subs = entry.subscriptions.len(), "connection closed");
        let handles: Vec<AgentHandle> = {
            let agents = self.inner.agents.read();
            entry
                .subscriptions
                .iter()
                .filter_map(|key| agents.get(key).cloned())
                .collect()
        };
        for handle in handles {
            let _ = handle.tx.send(AgentMsg::Unsubscribe { conn: conn.clone() });
        }
    }

    /// Marks a connection alive (inbound frame or transport pong).
    pub fn touch(&self, conn: &ConnectionId) {
        if let Some(entry) = self.inner.connections.write().get_mut(conn) {
            entry.last_seen_ms = unix_ms();
        }
    }

    /// Processes one inbound frame; per-connection arrival order is
    /// preserved because each transport task awaits the reply before
    /// reading the next frame. Returns the direct reply, if the action
    /// has one.
    pub async fn handle_frame(&self, conn: &ConnectionId, frame: Frame) -> Option<Frame> {
        self.touch(conn);
        if frame.a == action::HANDSHAKE {
            if let Some(entry) = self.inner.connections.write().get_mut(conn) {
                entry.handshaken = true;
            }
            return Some(Frame::handshake_reply(conn));
        }
        let handshaken = self
            .inner
            .connections
            .read()
            .get(conn)
            .map(|e| e.handshaken)
            .unwrap_or(false);
        if !handshaken {
            return Some(Frame::error(
                &frame.a,
                &Error::operation_invalid("handshake required"),
            ));
        }

        match frame.a.as_str() {
            action::SUBSCRIBE => {
                let reply = match frame.document_key() {
                    Ok(key) => match self.subscribe(conn, key.clone()).await {
                        Ok(snapshot) => Frame::snapshot(
                            action::SUBSCRIBE,
                            &key,
                            snapshot.version,
                            serde_json::Value::Object(snapshot.data),
                        ),
                        Err(err) => Frame::error(action::SUBSCRIBE, &err),
                    },
                    Err(err) => Frame::error(action::SUBSCRIBE, &err),
                };
                Some(reply)
            }
            action::UNSUBSCRIBE => {
                if let Ok(key) = frame.document_key() {
                    self.unsubscribe(conn, &key);
                }
                None
            }
            action::OP => {
                let reply = match self.handle_submit(conn, &frame).await {
                    Ok(version) => Frame::op_ack(version),
                    Err(err) => Frame::error(action::OP, &err),
                };
                Some(reply)
            }
            action::FETCH => {
                let reply = match frame.document_key() {
                    Ok(key) => match self.fetch(&key).await {
                        Ok(snapshot) => Frame::snapshot(
                            action::FETCH,
                            &key,
                            snapshot.version,
                            serde_json::Value::Object(snapshot.data),
                        ),
                        Err(err) => Frame::error(action::FETCH, &err),
                    },
                    Err(err) => Frame::error(action::FETCH, &err),
                };
                Some(reply)
            }
            action::PRESENCE => {
                self.presence(conn, &frame);
                None
            }
            other => Some(Frame::error(
                other,
                &Error::operation_invalid(format!("unknown action: {}", other)),
            )),
        }
    }

    async fn handle_submit(&self, conn: &ConnectionId, frame: &Frame) -> Result<u64> {
        let key = frame.document_key()?;
        let version = frame
            .v
            .ok_or_else(|| Error::operation_invalid("missing version"))?;
        let op = frame
            .op
            .clone()
            .ok_or_else(|| Error::operation_invalid("missing op"))?;
        self.submit(conn, &key, version, op).await
    }

    /// Subscribes a connection to a document, returning the snapshot.
    pub async fn subscribe(&self, conn: &ConnectionId, key: DocumentKey) -> Result<Snapshot> {
        let outbound = self
            .inner
            .connections
            .read()
            .get(conn)
            .map(|e| e.outbound.clone())
            .ok_or_else(|| Error::internal("unknown connection"))?;

        for _ in 0..3 {
            let handle = self.agent(&key);
            let (reply_tx, reply_rx) = oneshot::channel();
            if handle
                .tx
                .send(AgentMsg::Subscribe {
                    outbound: outbound.clone(),
                    reply: reply_tx,
                })
                .is_err()
            {
                continue;
            }
            match reply_rx.await {
                Ok(Ok(snapshot)) => {
                    if let Some(entry) = self.inner.connections.write().get_mut(conn) {
                        entry.subscriptions.insert(key.clone());
                    }
                    tracing::debug!(conn = %conn, doc = %key, version = snapshot.version, "subscribed");
                    return Ok(snapshot);
                }
                // A retired agent tells us to try again with a fresh one.
                Ok(Err(_)) | Err(_) => continue,
            }
        }
        Err(Error::internal("could not reach a document agent"))
    }

    /// Removes one subscription.
    pub fn unsubscribe(&self, conn: &ConnectionId, key: &DocumentKey) {
        if let Some(entry) = self.inner.connections.write().get_mut(conn) {
            entry.subscriptions.remove(key);
        }
        let handle = self.inner.agents.read().get(key).cloned();
        if let Some(handle) = handle {
            let _ = handle.tx.send(AgentMsg::Unsubscribe { conn: conn.clone() });
        }
    }

    /// Submits an operation through the document's agent.
    pub async fn submit(
        &self,
        conn: &ConnectionId,
        key: &DocumentKey,
        version: u64,
        op: Operation,
    ) -> Result<u64> {
        for _ in 0..2 {
            let handle = self.agent(key);
            let (reply_tx, reply_rx) = oneshot::channel();
            if handle
                .tx
                .send(AgentMsg::Submit {
                    conn: conn.clone(),
                    version,
                    op: op.clone(),
                    reply: reply_tx,
                })
                .is_err()
            {
                continue;
            }
            match reply_rx.await {
                Ok(result) => return result,
                Err(_) => continue,
            }
        }
        Err(Error::internal("could not reach a document agent"))
    }

    /// Fetches a snapshot without subscribing.
    pub async fn fetch(&self, key: &DocumentKey) -> Result<Snapshot> {
        for _ in 0..2 {
            let handle = self.agent(key);
            let (reply_tx, reply_rx) = oneshot::channel();
            if handle.tx.send(AgentMsg::Fetch { reply: reply_tx }).is_err() {
                continue;
            }
            match reply_rx.await {
                Ok(result) => return result,
                Err(_) => continue,
            }
        }
        Err(Error::internal("could not reach a document agent"))
    }

    /// Fans a presence frame out to every other connection subscribed in
    /// the same collection. Presence is ephemeral: a full queue just
    /// drops the frame.
    pub fn presence(&self, conn: &ConnectionId, frame: &Frame) {
        let Some(collection) = frame.c.as_deref() else {
            return;
        };
        let Ok(collection) = Collection::parse(collection) else {
            return;
        };
        let frame = presence_frame(
            collection.as_str(),
            frame.d.as_deref(),
            frame.data.clone(),
        );
        let targets: Vec<Outbound> = {
            let connections = self.inner.connections.read();
            connections
                .iter()
                .filter(|(id, entry)| {
                    *id != conn
                        && entry
                            .subscriptions
                            .iter()
                            .any(|key| key.collection == collection)
                })
                .map(|(_, entry)| entry.outbound.clone())
                .collect()
        };
        for outbound in targets {
            outbound.try_data(frame.clone());
        }
    }

    /// Returns the live agent handle for a document, spawning it lazily.
    fn agent(&self, key: &DocumentKey) -> AgentHandle {
        if let Some(handle) = self.inner.agents.read().get(key) {
            if !handle.shared.killed.load(Ordering::Acquire) {
                return handle.clone();
            }
        }
        let mut agents = self.inner.agents.write();
        if let Some(handle) = agents.get(key) {
            if !handle.shared.killed.load(Ordering::Acquire) {
                return handle.clone();
            }
        }
        let shared = Arc::new(AgentShared::new(unix_ms()));
        let tx = DocumentAgent::spawn(
            key.clone(),
            self.inner.orchestrator.clone(),
            self.inner.events.clone(),
            shared.clone(),
        );
        let handle = AgentHandle { tx, shared };
        agents.insert(key.clone(), handle.clone());
        handle
    }

    fn spawn_event_loop(&self, mut events: mpsc::UnboundedReceiver<HubEvent>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    HubEvent::SlowSubscriber { conn, key } => {
                        if let Some(entry) = inner.connections.write().get_mut(&conn) {
                            entry.subscriptions.remove(&key);
                        }
                    }
                }
            }
        });
    }

    fn spawn_sweeper(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep(&inner);
            }
        });
    }
}

/// Reaps silent connections and idle agents.
fn sweep(inner: &Arc<HubInner>) {
    let now = unix_ms();

    let timeout_ms = inner.config.connection_timeout.as_millis() as u64;
    let stale: Vec<ConnectionId> = inner
        .connections
        .read()
        .iter()
        .filter(|(_, entry)| now.saturating_sub(entry.last_seen_ms) > timeout_ms)
        .map(|(id, _)| id.clone())
        .collect();
    for conn in stale {
        tracing::info!(conn = %conn, "connection timed out");
        let entry = inner.connections.write().remove(&conn);
        if let Some(entry) = entry {
            let handles: Vec<AgentHandle> = {
                let agents = inner.agents.read();
                entry
                    .subscriptions
                    .iter()
                    .filter_map(|key| agents.get(key).cloned())
                    .collect()
            };
            for handle in handles {
                let _ = handle.tx.send(AgentMsg::Unsubscribe { conn: conn.clone() });
            }
        }
    }

    let idle_ms = inner.config.agent_idle_timeout.as_millis() as u64;
    let mut agents = inner.agents.write();
    agents.retain(|key, handle| {
        let idle = handle.shared.subscriber_count.load(Ordering::Acquire) == 0
            && now.saturating_sub(handle.shared.idle_since_ms.load(Ordering::Acquire)) > idle_ms;
        if idle {
            handle.shared.killed.store(true, Ordering::Release);
            tracing::debug!(doc = %key, "document agent reaped");
        }
        !idle
    });
}

/// The orchestrator-facing commit hook: route each committed bundle to
/// the document's live agent, if any. A document with no live agent has
/// no subscribers; its next activation loads the committed row.
struct HubPublisher {
    inner: Arc<HubInner>,
}

impl CommitPublisher for HubPublisher {
    fn publish(&self, key: &DocumentKey, version: u64, op: &Operation) {
        let handle = self.inner.agents.read().get(key).cloned();
        if let Some(handle) = handle {
            let _ = handle.tx.send(AgentMsg::ApplyExternal {
                version,
                op: op.clone(),
            });
        }
    }

    fn publish_deleted(&self, key: &DocumentKey) {
        let handle = self.inner.agents.read().get(key).cloned();
        if let Some(handle) = handle {
            let _ = handle.tx.send(AgentMsg::Deleted);
        }
    }
}

/// Unix-millisecond wall clock for liveness bookkeeping.
pub(crate) fn unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
