//! Bridges external peers to an `Engine`, see `spec.md` sections 3 and 4.7.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use ten_runtime_protocol::Loc;

use crate::message::Message;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The pluggable transport a `Connection` speaks over, see `spec.md` section 1
/// ("the core only requires a pluggable protocol").
///
/// A concrete implementation (the bundled [`crate::jsonl_protocol`], or any
/// other) owns the actual socket; this trait is the seam the runtime core
/// calls through.
pub trait Protocol: Send + Sync {
    fn send(&self, message: Message) -> BoxFuture<()>;

    fn close(&self) -> BoxFuture<()>;
}

/// Migration state of a `Connection`, see `spec.md` section 4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Owned by the App thread; no graph has claimed it yet.
    Init,
    /// The first message was forwarded to a target Engine; cleanup pending.
    FirstMsg,
    /// Fully re-parented onto the Engine's thread.
    Done,
}

/// A connection from an external peer, owning one `Protocol`.
///
/// During `Init`/`FirstMsg` the App thread is the only one that may touch
/// this connection's protocol; once `Done`, only the target Engine may.
/// [`MigratingProtocol`] wraps the underlying protocol so callers on either
/// side of that handoff always go through the same seam (`SPEC_FULL.md`'s
/// `protocol_asynced.c` supplement).
pub struct Connection {
    pub peer_uri: String,
    pub migration_state: MigrationState,
    pub graph_id: Option<String>,
    protocol: MigratingProtocol,
}

impl Connection {
    pub fn new(peer_uri: impl Into<String>, protocol: Box<dyn Protocol>) -> Self {
        Self {
            peer_uri: peer_uri.into(),
            migration_state: MigrationState::Init,
            graph_id: None,
            protocol: MigratingProtocol::new(protocol),
        }
    }

    /// Step one of `spec.md` section 4.7's migration: the App forwards the
    /// connection's first message to `graph_id`'s engine and marks `FirstMsg`.
    pub fn begin_migration(&mut self, graph_id: impl Into<String>) {
        self.migration_state = MigrationState::FirstMsg;
        self.graph_id = Some(graph_id.into());
    }

    /// Step two: the App has detached the protocol (`on_connection_cleaned`
    /// ran) and the Engine has attached it; the connection now belongs to the
    /// Engine's thread.
    pub fn complete_migration(&mut self) {
        self.migration_state = MigrationState::Done;
    }

    /// Resets migration to `Init`, as happens when the target Engine cannot
    /// be found (invalid `graph_id`), per `spec.md` section 4.7: the
    /// connection keeps carrying unrelated traffic on the App thread.
    pub fn reset_migration(&mut self) {
        self.migration_state = MigrationState::Init;
        self.graph_id = None;
    }

    pub async fn send(&self, message: Message) {
        self.protocol.send(message).await;
    }
}

/// Wraps a `Protocol` so the same handle keeps working across the
/// App-thread-to-Engine-thread migration in `spec.md` section 4.7.
///
/// The original implementation swaps an internal vtable under a lock at the
/// moment of migration; here the wrapped `Box<dyn Protocol>` is simply moved
/// into the `Connection` that owns it once migration completes, since in this
/// design only one task ever calls through `MigratingProtocol` at a time
/// (App before migration, Engine after) and `Connection` itself is moved
/// between the structures that track each, not shared across them.
pub struct MigratingProtocol {
    inner: Box<dyn Protocol>,
}

impl MigratingProtocol {
    pub fn new(inner: Box<dyn Protocol>) -> Self {
        Self { inner }
    }

    pub async fn send(&self, message: Message) {
        self.inner.send(message).await;
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }
}

/// Maps peer URIs to their `Connection`, owned by one `Engine`.
#[derive(Default)]
pub struct Remote {
    connections: HashMap<String, Connection>,
}

impl Remote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(connection.peer_uri.clone(), connection);
    }

    pub fn get(&self, peer_uri: &str) -> Option<&Connection> {
        self.connections.get(peer_uri)
    }

    pub fn get_mut(&mut self, peer_uri: &str) -> Option<&mut Connection> {
        self.connections.get_mut(peer_uri)
    }

    pub fn remove(&mut self, peer_uri: &str) -> Option<Connection> {
        self.connections.remove(peer_uri)
    }

    /// Sends `message` to every connected peer whose `Loc` the message is
    /// addressed to, used when an Engine must forward a cross-app message.
    pub async fn route(&self, message: &Message, dest_app_uri: &str) {
        if let Some(connection) = self.connections.get(dest_app_uri) {
            connection.send(message.clone()).await;
        }
    }
}

/// Channel pair an `Engine` uses to hand a freshly migrated message to its
/// own inbound queue without routing it back through the App.
pub fn migration_channel() -> (mpsc::UnboundedSender<(Loc, Message)>, mpsc::UnboundedReceiver<(Loc, Message)>) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingProtocol(Arc<AtomicUsize>);
    impl Protocol for CountingProtocol {
        fn send(&self, _message: Message) -> BoxFuture<()> {
            let count = self.0.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        }

        fn close(&self) -> BoxFuture<()> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn migration_moves_through_three_states() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut connection = Connection::new("peer1", Box::new(CountingProtocol(count.clone())));
        assert_eq!(connection.migration_state, MigrationState::Init);

        connection.begin_migration("graph1");
        assert_eq!(connection.migration_state, MigrationState::FirstMsg);
        assert_eq!(connection.graph_id.as_deref(), Some("graph1"));

        connection.complete_migration();
        assert_eq!(connection.migration_state, MigrationState::Done);

        connection.send(Message::new_data("d", Loc::extension("g1", "e1"), vec![])).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_migration_resets_to_init() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut connection = Connection::new("peer1", Box::new(CountingProtocol(count)));
        connection.begin_migration("unknown-graph");
        connection.reset_migration();
        assert_eq!(connection.migration_state, MigrationState::Init);
        assert!(connection.graph_id.is_none());
    }
}
