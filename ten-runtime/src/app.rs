//! Process-level owner, see `spec.md` section 4.8.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use ten_runtime_protocol::{AddonKind, GraphDescription, PredefinedGraph, StatusCode};

use crate::addon::AddonRegistry;
use crate::engine::Engine;
use crate::error::GraphError;
use crate::message::{Message, MessageKind};
use crate::remote::Connection;
use crate::value::Value;

/// A control command posted to the App's own queue, see `spec.md` section 4.8.
pub enum GraphControlCommand {
    StartGraph {
        graph_id: String,
        description: GraphDescription,
        response_tx: oneshot::Sender<Result<(), GraphError>>,
    },
    StopGraph {
        graph_id: String,
        response_tx: oneshot::Sender<Result<(), GraphError>>,
    },
    /// The first message to arrive on a fresh `Connection`, see `spec.md`
    /// section 4.7. Its destination's `graph_id` decides which Engine (if
    /// any) claims the connection.
    InboundConnectionMessage {
        connection: Connection,
        message: Message,
    },
    CloseApp {
        response_tx: oneshot::Sender<()>,
    },
}

/// Observable lifecycle state of an `App`, mirrors `Closeable`'s states at
/// the app granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Running,
    Closing,
    Closed,
}

/// The per-kind addon registries plus the set of live Engines, see `spec.md`
/// section 4.8 and section 3's `App` record.
pub struct App {
    pub uri: String,
    pub state: AppState,
    pub long_running_mode: bool,
    registries: IndexMap<AddonKind, Arc<AddonRegistry>>,
    engines: IndexMap<String, Engine>,
    /// Connections whose owning Engine has not yet claimed them, see
    /// `spec.md` section 4.7.
    orphan_connections: Vec<Connection>,
    predefined_graphs: Vec<PredefinedGraph>,
    command_tx: mpsc::UnboundedSender<GraphControlCommand>,
    command_rx: Option<mpsc::UnboundedReceiver<GraphControlCommand>>,
}

impl App {
    pub fn new(uri: impl Into<String>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let mut registries = IndexMap::new();
        for kind in [AddonKind::Extension, AddonKind::ExtensionGroup, AddonKind::Protocol, AddonKind::AddonLoader] {
            registries.insert(kind, Arc::new(AddonRegistry::new()));
        }
        Self {
            uri: uri.into(),
            state: AppState::Running,
            long_running_mode: false,
            registries,
            engines: IndexMap::new(),
            orphan_connections: Vec::new(),
            predefined_graphs: Vec::new(),
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    pub fn registry(&self, kind: AddonKind) -> Arc<AddonRegistry> {
        self.registries[&kind].clone()
    }

    pub fn command_sender(&self) -> mpsc::UnboundedSender<GraphControlCommand> {
        self.command_tx.clone()
    }

    pub fn set_predefined_graphs(&mut self, graphs: Vec<PredefinedGraph>) {
        self.predefined_graphs = graphs;
    }

    pub fn push_orphan_connection(&mut self, connection: Connection) {
        self.orphan_connections.push(connection);
    }

    pub fn engine(&self, graph_id: &str) -> Option<&Engine> {
        self.engines.get(graph_id)
    }

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    /// Starts every `auto_start` predefined graph at boot, per `spec.md`
    /// section 6. A failure logs and leaves the app running rather than
    /// closing it (see DESIGN.md's resolution of the open question in
    /// `spec.md` section 9 about auto-start failure) since
    /// `long_running_mode` is a separate, explicit knob for "stay up with no
    /// graphs running".
    pub async fn start_auto_graphs(&mut self) {
        let graphs: Vec<PredefinedGraph> = self.predefined_graphs.clone();
        for graph in graphs {
            if !graph.auto_start {
                continue;
            }
            if graph.singleton && self.engines.contains_key(&graph.name) {
                tracing::warn!(graph = %graph.name, "singleton predefined graph already running, skipping auto_start");
                continue;
            }
            let description = GraphDescription {
                nodes: graph.nodes.clone(),
                connections: graph.connections.clone(),
            };
            if let Err(error) = self.start_graph(graph.name.clone(), description).await {
                tracing::error!(graph = %graph.name, %error, "auto_start predefined graph failed to start");
            }
        }
    }

    /// Looks up a predefined graph by name, honouring `singleton`: if one
    /// is already running, returns its `graph_id` instead of starting a
    /// second instance.
    pub fn predefined_graph(&self, name: &str) -> Option<&PredefinedGraph> {
        self.predefined_graphs.iter().find(|g| g.name == name)
    }

    pub async fn start_graph(&mut self, graph_id: impl Into<String>, description: GraphDescription) -> Result<(), GraphError> {
        let graph_id = graph_id.into();
        if let Some(predefined) = self.predefined_graphs.iter().find(|g| g.name == graph_id)
            && predefined.singleton
            && self.engines.contains_key(&graph_id)
        {
            return Ok(());
        }

        let registry = self.registry(AddonKind::Extension);
        let engine = Engine::start_graph(graph_id.clone(), &description, registry).await?;
        self.engines.insert(graph_id, engine);
        Ok(())
    }

    /// Drives `spec.md` section 4.7's migration handshake for a connection's
    /// first inbound message: forwards it to the target Engine and hands the
    /// connection over (`begin_migration` -> `FirstMsg` -> `complete_migration`
    /// -> `Done`), or, if `graph_id` names no running graph, answers with a
    /// `GraphNotFound` cmd_result and resets the connection to `Init` so it
    /// keeps carrying unrelated traffic on the App thread.
    pub async fn handle_connection_message(&mut self, mut connection: Connection, message: Message) {
        let graph_id = message
            .dests
            .first()
            .map(|dest| dest.graph_id.clone())
            .unwrap_or_default();

        connection.begin_migration(graph_id.clone());

        match self.engines.get(&graph_id) {
            Some(engine) => {
                engine.inbound_sender().send(message).ok();
                connection.complete_migration();
                engine.attach_connection(connection).await;
            }
            None => {
                if let MessageKind::Cmd { name, id, .. } = &message.kind {
                    let mut result = Message::new_cmd_result(StatusCode::Error, name.clone(), *id, true, message.src.clone());
                    result.dests = vec![message.src.clone()];
                    let _ = result.properties.set_path("detail", Value::String("Graph not found.".to_owned()));
                    connection.send(result).await;
                }
                connection.reset_migration();
                self.push_orphan_connection(connection);
            }
        }
    }

    pub async fn stop_graph(&mut self, graph_id: &str) -> Result<(), GraphError> {
        match self.engines.shift_remove(graph_id) {
            Some(engine) => {
                engine.stop_graph().await;
                Ok(())
            }
            None => Err(GraphError::GraphNotFound(graph_id.to_owned())),
        }
    }

    /// Runs `spec.md` section 9's "orderly close" scenario: stops every
    /// running engine, then marks the app `Closed`.
    pub async fn close(&mut self) {
        self.state = AppState::Closing;
        let graph_ids: Vec<String> = self.engines.keys().cloned().collect();
        for graph_id in graph_ids {
            if let Some(engine) = self.engines.shift_remove(&graph_id) {
                engine.stop_graph().await;
            }
        }
        self.state = AppState::Closed;
    }

    /// Drains the app's control-command queue until a `CloseApp` command is
    /// processed, see `spec.md` section 4.8 and the "signal bridge" note in
    /// section 9 (`close_app` arrives here the same way whether it came from
    /// a client command or a translated signal).
    pub async fn run(mut self) -> Self {
        let Some(mut command_rx) = self.command_rx.take() else {
            return self;
        };

        while let Some(command) = command_rx.recv().await {
            match command {
                GraphControlCommand::StartGraph {
                    graph_id,
                    description,
                    response_tx,
                } => {
                    let result = self.start_graph(graph_id, description).await;
                    let _ = response_tx.send(result);
                }
                GraphControlCommand::StopGraph { graph_id, response_tx } => {
                    let result = self.stop_graph(&graph_id).await;
                    let _ = response_tx.send(result);
                }
                GraphControlCommand::InboundConnectionMessage { connection, message } => {
                    self.handle_connection_message(connection, message).await;
                }
                GraphControlCommand::CloseApp { response_tx } => {
                    self.close().await;
                    let _ = response_tx.send(());
                    break;
                }
            }
        }

        self.command_rx = Some(command_rx);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_app_starts_running_with_no_engines() {
        let app = App::new("localhost");
        assert_eq!(app.state, AppState::Running);
        assert_eq!(app.engine_count(), 0);
    }

    #[tokio::test]
    async fn stop_unknown_graph_reports_graph_not_found() {
        let mut app = App::new("localhost");
        let result = app.stop_graph("missing").await;
        assert_eq!(result, Err(GraphError::GraphNotFound("missing".into())));
    }

    mod connection_migration {
        use super::*;
        use crate::remote::Protocol;
        use std::future::Future;
        use std::pin::Pin;
        use std::sync::Mutex;
        use ten_runtime_protocol::Loc;

        struct RecordingProtocol(Arc<Mutex<Vec<Message>>>);
        impl Protocol for RecordingProtocol {
            fn send(&self, message: Message) -> Pin<Box<dyn Future<Output = ()> + Send>> {
                let sent = self.0.clone();
                Box::pin(async move {
                    sent.lock().unwrap().push(message);
                })
            }

            fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(async {})
            }
        }

        /// `spec.md` section 8 scenario 4: a message addressed to a
        /// `graph_id` with no running Engine gets a `GraphNotFound`
        /// cmd_result back and the connection resets to `Init`.
        #[tokio::test]
        async fn unknown_graph_id_answers_graph_not_found_and_resets_migration() {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let connection = Connection::new("peer1", Box::new(RecordingProtocol(sent.clone())));

            let mut app = App::new("localhost");
            let dest = Loc {
                graph_id: "missing-graph".into(),
                ..Loc::default()
            };
            let cmd = Message::new_cmd("ping", Loc::default(), vec![dest]);

            app.handle_connection_message(connection, cmd).await;

            let sent = sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            match &sent[0].kind {
                MessageKind::CmdResult { status, .. } => assert_eq!(*status, StatusCode::Error),
                other => panic!("expected a cmd_result, got {other:?}"),
            }
            assert_eq!(sent[0].properties.get_path("detail").unwrap(), &Value::String("Graph not found.".to_owned()));
            assert_eq!(app.orphan_connections.len(), 1);
            assert_eq!(app.orphan_connections[0].migration_state, crate::remote::MigrationState::Init);
        }
    }

    #[tokio::test]
    async fn close_app_via_command_queue_sets_closed_state() {
        let app = App::new("localhost");
        let command_tx = app.command_sender();
        let app_task = tokio::spawn(app.run());

        let (response_tx, response_rx) = oneshot::channel();
        command_tx.send(GraphControlCommand::CloseApp { response_tx }).ok();
        response_rx.await.unwrap();

        let app = app_task.await.unwrap();
        assert_eq!(app.state, AppState::Closed);
    }
}
