//! The graph-instance runtime, see `spec.md` section 4.6.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use ten_runtime_protocol::{GraphDescription, GraphNode, Loc, StatusCode};

use crate::addon::AddonRegistry;
use crate::error::GraphError;
use crate::extension::{ExtensionGroup, ExtensionSpec};
use crate::extension_thread::ExtensionThread;
use crate::message::{Message, MessageKind};
use crate::path::PathTable;
use crate::remote::{Connection, Remote};

/// Which `ExtensionThread` a given extension name lives on, built once a
/// graph starts from its `nodes`.
type ExtensionMap = IndexMap<String, String>;

/// Default check interval for engine-originated paths (`start_graph`,
/// `stop_graph`), see `spec.md` section 5.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Facade handle to a running graph instance, see `spec.md` section 4.6.
///
/// Mirrors `ExtensionThread`'s actor split: the real state (threads,
/// extension map, `PathTable`) lives on a dedicated `tokio::task` that is
/// this engine's one runloop (`spec.md` section 5); this struct only holds
/// the channels to reach it.
pub struct Engine {
    pub graph_id: String,
    extension_map: ExtensionMap,
    inbound_tx: mpsc::UnboundedSender<Message>,
    call_tx: mpsc::UnboundedSender<(Message, oneshot::Sender<Message>)>,
    migrate_tx: mpsc::UnboundedSender<Connection>,
    stop_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Runs `spec.md` section 4.6's `start_graph` flow: builds the
    /// extension-group threads, fans `create_extensions` + the
    /// `on_init -> on_start` cascade out to each, and only returns once every
    /// extension of every group reaches `StartDone` (or fails).
    pub async fn start_graph(
        graph_id: impl Into<String>,
        description: &GraphDescription,
        registry: Arc<AddonRegistry>,
    ) -> Result<Self, GraphError> {
        let graph_id = graph_id.into();

        let (group_specs, extension_map) = plan_groups(description)?;
        let routes = plan_routes(description);

        let (from_threads_tx, from_threads_rx) = mpsc::unbounded_channel();

        let mut threads = IndexMap::new();
        for (group_name, specs) in &group_specs {
            let group = ExtensionGroup::new(group_name.clone(), specs.clone(), routes.clone());
            let thread = ExtensionThread::spawn(group, from_threads_tx.clone());
            thread.create_extensions(registry.clone()).await?;
            threads.insert(group_name.clone(), thread);
        }

        for thread in threads.values() {
            thread.start().await;
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let (migrate_tx, migrate_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();

        let state = EngineState {
            threads,
            extension_map: extension_map.clone(),
            path_table: PathTable::new(),
            remote: Remote::new(),
            from_threads_tx,
        };
        let handle = tokio::spawn(run(state, inbound_rx, from_threads_rx, call_rx, migrate_rx, stop_rx));

        Ok(Self {
            graph_id,
            extension_map,
            inbound_tx,
            call_tx,
            migrate_tx,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// A sender other components (the owning `App`, a `Remote`) can use to
    /// push messages into this engine's inbound queue.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<Message> {
        self.inbound_tx.clone()
    }

    /// Sends a `Cmd` into the graph and awaits its final result, registering
    /// the expectation in the engine's own `PathTable` (the engine acts as
    /// the command's "original sender" for commands that did not originate
    /// from any extension, see `spec.md` section 4.5).
    ///
    /// Returns `None` if the engine's runloop is gone before a result arrives.
    pub async fn call(&self, message: Message) -> Option<Message> {
        let (response_tx, response_rx) = oneshot::channel();
        self.call_tx.send((message, response_tx)).ok()?;
        response_rx.await.ok()
    }

    /// Completes `spec.md` section 4.7's migration handoff: hands a
    /// `Connection` the App has already detached over to this engine, which
    /// from here on is the only side allowed to touch it.
    pub async fn attach_connection(&self, connection: Connection) {
        let _ = self.migrate_tx.send(connection);
    }

    pub fn extension_count(&self) -> usize {
        self.extension_map.len()
    }

    pub fn owns_extension(&self, extension_name: &str) -> bool {
        self.extension_map.contains_key(extension_name)
    }

    /// Runs the `on_stop` then `on_deinit` cascade across every thread in
    /// the graph and stops the engine's runloop.
    pub async fn stop_graph(mut self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.stop_tx.send(response_tx).is_err() {
            return;
        }
        let _ = response_rx.await;
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn plan_groups(description: &GraphDescription) -> Result<(IndexMap<String, Vec<ExtensionSpec>>, ExtensionMap), GraphError> {
    let mut group_specs: IndexMap<String, Vec<ExtensionSpec>> = IndexMap::new();
    let mut extension_map = ExtensionMap::new();
    let mut seen_extensions = std::collections::HashSet::new();

    for node in &description.nodes {
        match node {
            GraphNode::ExtensionGroup { name, .. } => {
                group_specs.entry(name.clone()).or_default();
            }
            GraphNode::Extension {
                name,
                addon,
                extension_group,
                ..
            } => {
                if !seen_extensions.insert(name.clone()) {
                    return Err(GraphError::DuplicateExtension(name.clone()));
                }
                group_specs.entry(extension_group.clone()).or_default().push(ExtensionSpec {
                    addon_name: addon.clone(),
                    instance_name: name.clone(),
                });
                extension_map.insert(name.clone(), extension_group.clone());
            }
        }
    }

    for connection in &description.connections {
        if !extension_map.contains_key(&connection.extension) {
            return Err(GraphError::UnresolvedDestination(Loc::extension(
                connection.extension_group.clone(),
                connection.extension.clone(),
            )));
        }
        for routes in [&connection.cmd, &connection.data, &connection.video_frame, &connection.audio_frame] {
            for route in routes {
                for dest in &route.dest {
                    if !dest.extension.is_empty() && !extension_map.contains_key(&dest.extension) {
                        return Err(GraphError::UnresolvedDestination(dest.clone()));
                    }
                }
            }
        }
    }

    Ok((group_specs, extension_map))
}

/// Compiles `description.connections` into each source extension's
/// `message name -> destinations` routing table, see `spec.md` section 6.
///
/// `cmd`/`data`/`video_frame`/`audio_frame` routes all merge into the same
/// per-extension map, matching `Extension::resolve_dests`'s single-map
/// lookup (it does not distinguish message kind, only name, falling back to
/// the `"*"` wildcard entry). A name appearing in more than one route list
/// for the same source extension accumulates destinations from each.
fn plan_routes(description: &GraphDescription) -> IndexMap<String, IndexMap<String, Vec<Loc>>> {
    let mut routes: IndexMap<String, IndexMap<String, Vec<Loc>>> = IndexMap::new();

    for connection in &description.connections {
        let entry = routes.entry(connection.extension.clone()).or_default();
        for route_list in [&connection.cmd, &connection.data, &connection.video_frame, &connection.audio_frame] {
            for route in route_list {
                entry.entry(route.name.clone()).or_default().extend(route.dest.iter().cloned());
            }
        }
    }

    routes
}

/// The state actually owned by the engine's runloop task.
struct EngineState {
    threads: IndexMap<String, ExtensionThread>,
    extension_map: ExtensionMap,
    path_table: PathTable,
    /// Connections migrated in from the App, see `spec.md` section 4.7.
    remote: Remote,
    from_threads_tx: mpsc::UnboundedSender<Message>,
}

impl EngineState {
    fn thread_for(&self, extension_name: &str) -> Option<&ExtensionThread> {
        let group = self.extension_map.get(extension_name)?;
        self.threads.get(group)
    }

    /// Registers an engine-originated call's expectation, then routes the
    /// command like any other message.
    async fn handle_call(&mut self, message: Message, response_tx: oneshot::Sender<Message>) {
        let Some(cmd_id) = message.cmd_id() else {
            return;
        };
        let cmd_name = message.kind.name().to_owned();
        let original_src = message.src.clone();
        self.path_table.add_out_path(
            cmd_id,
            cmd_name,
            original_src,
            Some(DEFAULT_CHECK_INTERVAL),
            Box::new(move |result| {
                let _ = response_tx.send(result);
            }),
        );
        self.route(message).await;
    }

    /// Routes one message to the `ExtensionThread` owning its destination,
    /// per `spec.md` section 4.6's "routes each to the right ExtensionThread"
    /// responsibility. A destination this engine cannot resolve gets a
    /// `GraphNotFound`-flavoured error result back, per `spec.md` section 7.
    ///
    /// A `CmdResult` is first offered to the engine's own `PathTable`, which
    /// holds the expectations registered by [`Engine::call`]; only once that
    /// comes up empty is it routed like any other message.
    async fn route(&mut self, message: Message) {
        if let MessageKind::CmdResult {
            status,
            is_final,
            correlates_to,
            ..
        } = &message.kind
        {
            let is_ok = matches!(status, StatusCode::Ok);
            let is_final = *is_final;
            let correlates_to = *correlates_to;
            if self.path_table.resolve_out_path(correlates_to, is_final, is_ok, message.clone()) {
                return;
            }
        }

        let Some(dest) = message.dests.first() else {
            return;
        };

        match self.thread_for(&dest.extension) {
            Some(thread) => thread.dispatch(message).await,
            None if !dest.app_uri.is_empty() && self.remote.get(&dest.app_uri).is_some() => {
                self.remote.route(&message, &dest.app_uri).await;
            }
            None => {
                if let MessageKind::Cmd { name, id, .. } = &message.kind {
                    let mut not_found = Message::new_cmd_result(
                        StatusCode::Error,
                        name.clone(),
                        *id,
                        true,
                        Loc::extension(String::new(), String::new()),
                    );
                    not_found.dests = vec![message.src.clone()];
                    self.from_threads_tx.send(not_found).ok();
                }
            }
        }
    }

    fn attach_connection(&mut self, connection: Connection) {
        self.remote.insert(connection);
    }

    async fn stop_graph(&mut self) {
        for thread in self.threads.values() {
            thread.stop().await;
        }
        for (_, thread) in self.threads.drain(..) {
            thread.deinit_and_shutdown().await;
        }
    }
}

async fn run(
    mut state: EngineState,
    mut inbound_rx: mpsc::UnboundedReceiver<Message>,
    mut from_threads_rx: mpsc::UnboundedReceiver<Message>,
    mut call_rx: mpsc::UnboundedReceiver<(Message, oneshot::Sender<Message>)>,
    mut migrate_rx: mpsc::UnboundedReceiver<Connection>,
    mut stop_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
) {
    loop {
        tokio::select! {
            message = inbound_rx.recv() => {
                match message {
                    Some(message) => state.route(message).await,
                    None => {}
                }
            }
            message = from_threads_rx.recv() => {
                match message {
                    Some(message) => state.route(message).await,
                    None => {}
                }
            }
            call = call_rx.recv() => {
                if let Some((message, response_tx)) = call {
                    state.handle_call(message, response_tx).await;
                }
            }
            connection = migrate_rx.recv() => {
                if let Some(connection) = connection {
                    state.attach_connection(connection);
                }
            }
            response_tx = stop_rx.recv() => {
                if let Some(response_tx) = response_tx {
                    state.stop_graph().await;
                    let _ = response_tx.send(());
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addon::{Addon, AddonKind};
    use crate::extension::{self, ExtensionImpl};
    use std::future::Future;
    use std::pin::Pin;

    struct Passthrough;
    impl ExtensionImpl for Passthrough {}

    struct EchoAddon;
    impl Addon for EchoAddon {
        fn on_create_instance(
            &self,
            _instance_name: &str,
        ) -> Pin<Box<dyn Future<Output = Result<crate::addon::Instance, crate::error::AddonError>> + Send>> {
            Box::pin(async { Ok(extension::into_instance(Box::new(Passthrough))) })
        }

        fn on_destroy_instance(&self, _instance: crate::addon::Instance) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    fn single_extension_graph() -> GraphDescription {
        serde_json::from_value(serde_json::json!({
            "nodes": [
                {"type": "extension", "name": "e1", "addon": "echo", "extension_group": "g1"}
            ],
            "connections": []
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn start_graph_rejects_duplicate_extension_names() {
        let description: GraphDescription = serde_json::from_value(serde_json::json!({
            "nodes": [
                {"type": "extension", "name": "e1", "addon": "echo", "extension_group": "g1"},
                {"type": "extension", "name": "e1", "addon": "echo", "extension_group": "g1"}
            ],
            "connections": []
        }))
        .unwrap();

        let registry = Arc::new(AddonRegistry::new());
        registry.register(AddonKind::Extension, "echo", None, Arc::new(EchoAddon)).unwrap();

        let result = Engine::start_graph("graph1", &description, registry).await;
        assert_eq!(result.err(), Some(GraphError::DuplicateExtension("e1".into())));
    }

    #[tokio::test]
    async fn start_graph_builds_one_thread_per_group() {
        let registry = Arc::new(AddonRegistry::new());
        registry.register(AddonKind::Extension, "echo", None, Arc::new(EchoAddon)).unwrap();

        let engine = Engine::start_graph("graph1", &single_extension_graph(), registry).await.unwrap();
        assert_eq!(engine.extension_count(), 1);
        assert!(engine.owns_extension("e1"));
        engine.stop_graph().await;
    }

    #[tokio::test]
    async fn call_awaits_the_matching_cmd_result() {
        let registry = Arc::new(AddonRegistry::new());
        registry.register(AddonKind::Extension, "echo", None, Arc::new(EchoAddon)).unwrap();

        let engine = Engine::start_graph("graph1", &single_extension_graph(), registry).await.unwrap();

        let cmd = Message::new_cmd("ping", Loc::default(), vec![Loc::extension("g1", "e1")]);
        let cmd_id = cmd.cmd_id();
        let result = engine.call(cmd).await.expect("runloop is still alive");

        let MessageKind::CmdResult { status, correlates_to, .. } = result.kind else {
            panic!("expected a CmdResult");
        };
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(Some(correlates_to), cmd_id);

        engine.stop_graph().await;
    }

    #[test]
    fn plan_routes_compiles_connections_per_source_extension() {
        let description: GraphDescription = serde_json::from_value(serde_json::json!({
            "nodes": [
                {"type": "extension", "name": "e1", "addon": "echo", "extension_group": "g1"},
                {"type": "extension", "name": "e2", "addon": "echo", "extension_group": "g1"},
                {"type": "extension", "name": "e3", "addon": "echo", "extension_group": "g1"}
            ],
            "connections": [
                {
                    "extension_group": "g1",
                    "extension": "e1",
                    "cmd": [
                        {"name": "fan", "dest": [
                            {"extension_group": "g1", "extension": "e2"},
                            {"extension_group": "g1", "extension": "e3"}
                        ]}
                    ]
                }
            ]
        }))
        .unwrap();

        let routes = plan_routes(&description);
        let e1_routes = routes.get("e1").expect("e1 should have a routing entry");
        let fan_dests = e1_routes.get("fan").expect("fan should be routed");
        assert_eq!(
            fan_dests,
            &vec![Loc::extension("g1", "e2"), Loc::extension("g1", "e3")]
        );
    }

    /// `spec.md` section 8 scenario 2: `e1` emits `fan` with no explicit
    /// dests; the graph's `connections` must fan it out to `e2` and `e3`
    /// with no help from the sender.
    #[tokio::test]
    async fn fan_out_graph_resolves_destinations_from_connections() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct FanSource;
        impl ExtensionImpl for FanSource {
            fn on_cmd(&mut self, ten_env: &mut crate::extension::TenEnv<'_>, cmd: Message) {
                let crate::message::MessageKind::Cmd { name, id, .. } = &cmd.kind else {
                    return;
                };
                if name == "trigger" {
                    let fan = Message::new_cmd("fan", ten_env.loc().clone(), vec![]);
                    ten_env.send_cmd(fan, None);
                    let result = Message::new_cmd_result(StatusCode::Ok, name.clone(), *id, true, cmd.src.clone());
                    ten_env.return_result(result);
                }
            }
        }

        struct FanSourceAddon;
        impl Addon for FanSourceAddon {
            fn on_create_instance(
                &self,
                _instance_name: &str,
            ) -> Pin<Box<dyn Future<Output = Result<crate::addon::Instance, crate::error::AddonError>> + Send>> {
                Box::pin(async { Ok(extension::into_instance(Box::new(FanSource))) })
            }

            fn on_destroy_instance(&self, _instance: crate::addon::Instance) -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(async {})
            }
        }

        struct CountingAck(Arc<AtomicUsize>);
        impl ExtensionImpl for CountingAck {
            fn on_cmd(&mut self, ten_env: &mut crate::extension::TenEnv<'_>, cmd: Message) {
                self.0.fetch_add(1, Ordering::SeqCst);
                let crate::message::MessageKind::Cmd { name, id, .. } = &cmd.kind else {
                    return;
                };
                let result = Message::new_cmd_result(StatusCode::Ok, name.clone(), *id, true, cmd.src.clone());
                ten_env.return_result(result);
            }
        }

        struct CountingAckAddon(Arc<AtomicUsize>);
        impl Addon for CountingAckAddon {
            fn on_create_instance(
                &self,
                _instance_name: &str,
            ) -> Pin<Box<dyn Future<Output = Result<crate::addon::Instance, crate::error::AddonError>> + Send>> {
                let counter = self.0.clone();
                Box::pin(async move { Ok(extension::into_instance(Box::new(CountingAck(counter)))) })
            }

            fn on_destroy_instance(&self, _instance: crate::addon::Instance) -> Pin<Box<dyn Future<Output = ()> + Send>> {
                Box::pin(async {})
            }
        }

        let description: GraphDescription = serde_json::from_value(serde_json::json!({
            "nodes": [
                {"type": "extension", "name": "e1", "addon": "fan_source", "extension_group": "g1"},
                {"type": "extension", "name": "e2", "addon": "counting_ack", "extension_group": "g1"},
                {"type": "extension", "name": "e3", "addon": "counting_ack", "extension_group": "g1"}
            ],
            "connections": [
                {
                    "extension_group": "g1",
                    "extension": "e1",
                    "cmd": [
                        {"name": "fan", "dest": [
                            {"extension_group": "g1", "extension": "e2"},
                            {"extension_group": "g1", "extension": "e3"}
                        ]}
                    ]
                }
            ]
        }))
        .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(AddonRegistry::new());
        registry.register(AddonKind::Extension, "fan_source", None, Arc::new(FanSourceAddon)).unwrap();
        registry
            .register(AddonKind::Extension, "counting_ack", None, Arc::new(CountingAckAddon(counter.clone())))
            .unwrap();

        let engine = Engine::start_graph("graph1", &description, registry).await.unwrap();

        let cmd = Message::new_cmd("trigger", Loc::default(), vec![Loc::extension("g1", "e1")]);
        let result = engine.call(cmd).await.expect("runloop is still alive");
        let MessageKind::CmdResult { status, .. } = result.kind else {
            panic!("expected a CmdResult");
        };
        assert_eq!(status, StatusCode::Ok);

        // Give the extension thread a tick to fan the `fan` cmd out and have
        // both e2 and e3 process it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        engine.stop_graph().await;
    }
}
