//! Per-document agents.
//!
//! One tokio task per live document. All work for a document goes through
//! its mailbox, which is what serialises subscribes, submissions, and
//! external applies against each other. The agent owns the in-memory
//! `(version, data)` pair, kept in lockstep with the stored row by only
//! ever advancing it with committed bundles.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use easygrid_core::{ConnectionId, DocumentKey, Error, Fields, Result};
use easygrid_engine::WriteOrchestrator;
use easygrid_ops::Operation;

use crate::hub::HubEvent;
use crate::protocol::{action, Frame};

/// The `(version, data)` pair returned on subscribe or fetch.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub version: u64,
    pub data: Fields,
}

/// Per-connection outbound handles: a bounded data queue for broadcasts
/// and a small control queue for errors that must bypass a full data
/// queue.
#[derive(Clone)]
pub struct Outbound {
    conn: ConnectionId,
    data: mpsc::Sender<Frame>,
    control: mpsc::Sender<Frame>,
}

impl Outbound {
    /// Creates the handle pair for a connection.
    pub fn new(conn: ConnectionId, data: mpsc::Sender<Frame>, control: mpsc::Sender<Frame>) -> Self {
        Self { conn, data, control }
    }

    /// Returns the connection id.
    pub fn conn(&self) -> &ConnectionId {
        &self.conn
    }

    /// Queues a broadcast frame. False means the queue overflowed.
    pub fn try_data(&self, frame: Frame) -> bool {
        self.data.try_send(frame).is_ok()
    }

    /// Queues a control frame. False means even the control queue is gone.
    pub fn try_control(&self, frame: Frame) -> bool {
        self.control.try_send(frame).is_ok()
    }
}

/// Mailbox messages of a document agent.
pub enum AgentMsg {
    Subscribe {
        outbound: Outbound,
        reply: oneshot::Sender<Result<Snapshot>>,
    },
    Unsubscribe {
        conn: ConnectionId,
    },
    Fetch {
        reply: oneshot::Sender<Result<Snapshot>>,
    },
    Submit {
        conn: ConnectionId,
        version: u64,
        op: Operation,
        reply: oneshot::Sender<Result<u64>>,
    },
    /// Commit-hook delivery of a bundle originated elsewhere.
    ApplyExternal {
        version: u64,
        op: Operation,
    },
    /// The underlying record was deleted.
    Deleted,
}

/// State shared between an agent task and the hub's sweeper.
pub(crate) struct AgentShared {
    pub subscriber_count: AtomicUsize,
    pub killed: AtomicBool,
    /// Unix-ms timestamp since the agent last had zero subscribers.
    pub idle_since_ms: AtomicU64,
}

impl AgentShared {
    pub(crate) fn new(now_ms: u64) -> Self {
        Self {
            subscriber_count: AtomicUsize::new(0),
            killed: AtomicBool::new(false),
            idle_since_ms: AtomicU64::new(now_ms),
        }
    }
}

pub(crate) struct DocumentAgent {
    key: DocumentKey,
    version: u64,
    data: Fields,
    exists: bool,
    subscribers: hashbrown::HashMap<ConnectionId, Outbound>,
    orchestrator: Arc<WriteOrchestrator>,
    events: mpsc::UnboundedSender<HubEvent>,
    shared: Arc<AgentShared>,
}

impl DocumentAgent {
    /// Spawns the agent task; the returned sender is its mailbox.
    pub(crate) fn spawn(
        key: DocumentKey,
        orchestrator: Arc<WriteOrchestrator>,
        events: mpsc::UnboundedSender<HubEvent>,
        shared: Arc<AgentShared>,
    ) -> mpsc::UnboundedSender<AgentMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (data, version, exists) = match orchestrator
                .load_document(&key)
                .await
            {
                Some((data, version)) => (data, version, true),
                None => (Fields::new(), 0, false),
            };
            tracing::debug!(doc = %key, version, "document agent activated");
            let agent = DocumentAgent {
                key,
                version,
                data,
                exists,
                subscribers: hashbrown::HashMap::new(),
                orchestrator,
                events,
                shared,
            };
            agent.run(rx).await;
        });
        tx
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AgentMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                AgentMsg::Subscribe { outbound, reply } => {
                    if self.shared.killed.load(Ordering::Acquire) {
                        // The hub already dropped this agent; the caller
                        // retries against a fresh one.
                        let _ = reply.send(Err(Error::internal("agent retired")));
                        continue;
                    }
                    self.subscribers.insert(outbound.conn().clone(), outbound);
                    self.shared
                        .subscriber_count
                        .store(self.subscribers.len(), Ordering::Release);
                    let _ = reply.send(Ok(Snapshot {
                        version: self.version,
                        data: self.data.clone(),
                    }));
                }
                AgentMsg::Unsubscribe { conn } => {
                    self.subscribers.remove(&conn);
                    self.note_subscriber_count();
                }
                AgentMsg::Fetch { reply } => {
                    let result = if self.exists {
                        Ok(Snapshot {
                            version: self.version,
                            data: self.data.clone(),
                        })
                    } else {
                        Err(Error::document_not_found(
                            self.key.collection.as_str(),
                            &self.key.doc_id,
                        ))
                    };
                    let _ = reply.send(result);
                }
                AgentMsg::Submit {
                    conn,
                    version,
                    op,
                    reply,
                } => {
                    let result = self.submit(&conn, version, op).await;
                    let _ = reply.send(result);
                }
                AgentMsg::ApplyExternal { version, op } => {
                    self.apply_external(version, op).await;
                }
                AgentMsg::Deleted => {
                    self.exists = false;
                    self.version = 0;
                    self.data = Fields::new();
                    // Subscribers learn of the deletion through a
                    // superseding empty snapshot.
                    self.broadcast_snapshot(None);
                }
            }
        }
    }

    /// Handles an OT submission: strict version equality, then one
    /// committed bundle which advances this document exactly once.
    async fn submit(&mut self, conn: &ConnectionId, version: u64, op: Operation) -> Result<u64> {
        if op.is_empty() {
            return Err(Error::operation_invalid("empty operation"));
        }
        if version != self.version {
            return Err(Error::version_mismatch(version, self.version));
        }
        let outcome = self
            .orchestrator
            .submit_operation(&self.key, version, op)
            .await?;
        let own = outcome
            .doc(&self.key)
            .ok_or_else(|| Error::internal("commit did not touch the submitted document"))?;

        self.data = own.op.apply_to_data(&self.data)?;
        self.version = own.version;
        self.exists = true;
        self.broadcast_op(own.version, own.op.clone(), Some(conn));
        Ok(own.version)
    }

    /// Applies a committed bundle published by another writer. Every
    /// current subscriber receives it, including a connection that
    /// originated the outer request.
    async fn apply_external(&mut self, version: u64, op: Operation) {
        if version <= self.version {
            return;
        }
        if version == self.version + 1 {
            match op.apply_to_data(&self.data) {
                Ok(next) => {
                    self.data = next;
                    self.version = version;
                    self.exists = true;
                    self.broadcast_op(version, op, None);
                    return;
                }
                Err(err) => {
                    tracing::warn!(doc = %self.key, error = %err, "external op did not apply; resyncing");
                }
            }
        }
        // A gap (or a non-applying op) means this agent's copy raced the
        // commit; reload and supersede everything with a snapshot.
        match self.orchestrator.load_document(&self.key).await {
            Some((data, version)) => {
                self.data = data;
                self.version = version;
                self.exists = true;
            }
            None => {
                self.data = Fields::new();
                self.version = 0;
                self.exists = false;
            }
        }
        self.broadcast_snapshot(None);
    }

    /// Sends an op frame to every subscriber except `skip`, tearing down
    /// slow ones.
    fn broadcast_op(&mut self, version: u64, op: Operation, skip: Option<&ConnectionId>) {
        let frame = Frame::op_broadcast(&self.key, version, op);
        self.broadcast(frame, skip);
    }

    fn broadcast_snapshot(&mut self, skip: Option<&ConnectionId>) {
        let frame = Frame::snapshot(
            action::SUBSCRIBE,
            &self.key,
            self.version,
            Value::Object(self.data.clone()),
        );
        self.broadcast(frame, skip);
    }

    fn broadcast(&mut self, frame: Frame, skip: Option<&ConnectionId>) {
        let mut slow: Vec<ConnectionId> = Vec::new();
        for (conn, outbound) in &self.subscribers {
            if Some(conn) == skip {
                continue;
            }
            if !outbound.try_data(frame.clone()) {
                slow.push(conn.clone());
            }
        }
        for conn in slow {
            let outbound = self.subscribers.remove(&conn).expect("collected above");
            tracing::warn!(doc = %self.key, conn = %conn, "outbound queue overflow; dropping subscription");
            outbound.try_control(Frame {
                a: action::SUBSCRIBE.to_string(),
                c: Some(self.key.collection.as_str().to_string()),
                d: Some(self.key.doc_id.clone()),
                error: Some(crate::protocol::ErrorPayload {
                    code: "resync_required".to_string(),
                    message: Some("outbound queue overflowed; re-subscribe".to_string()),
                }),
                ..Default::default()
            });
            let _ = self.events.send(HubEvent::SlowSubscriber {
                conn,
                key: self.key.clone(),
            });
        }
        self.note_subscriber_count();
    }

    fn note_subscriber_count(&self) {
        self.shared
            .subscriber_count
            .store(self.subscribers.len(), Ordering::Release);
        if self.subscribers.is_empty() {
            self.shared.idle_since_ms.store(
                crate::hub::unix_ms(),
                Ordering::Release,
            );
        }
    }
}

/// Builds the presence fan-out frame for a collection.
pub(crate) fn presence_frame(collection: &str, doc_id: Option<&str>, data: Option<Value>) -> Frame {
    Frame {
        a: action::PRESENCE.to_string(),
        c: Some(collection.to_string()),
        d: doc_id.map(str::to_string),
        data: Some(data.unwrap_or_else(|| json!({}))),
        ..Default::default()
    }
}
