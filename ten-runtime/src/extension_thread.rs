//! The single-threaded dispatch core, see `spec.md` section 4.4.
//!
//! One `ExtensionThread` owns exactly one `ExtensionGroup` and runs a
//! dedicated OS thread with its own current-thread Tokio runtime; only that
//! thread ever touches the group's extensions, so no extension-state locking
//! is required (`spec.md` section 8, "thread isolation"). The facade/actor
//! split mirrors `veecle-orchestrator`'s `Conductor`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use ten_runtime_protocol::{Loc, StatusCode};

use crate::addon::{AddonKind, AddonRegistry};
use crate::error::GraphError;
use crate::extension::{self, Extension, ExtensionGroup, LifecycleDone, LifecycleState, OutboundEvent, TenEnv};
use crate::message::{Message, MessageKind};
use crate::path::GroupPolicy;

/// Runloop state, see `spec.md` section 4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Init,
    CreatingExtensions,
    Normal,
    Closing,
    Closed,
}

enum Command {
    Dispatch(Message),
    CreateExtensions {
        registry: Arc<AddonRegistry>,
        response_tx: oneshot::Sender<Result<(), GraphError>>,
    },
    StartCascade {
        response_tx: oneshot::Sender<()>,
    },
    StopCascade {
        response_tx: oneshot::Sender<()>,
    },
    DeinitCascade {
        response_tx: oneshot::Sender<()>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Facade handle to a running dispatch thread.
pub struct ExtensionThread {
    command_tx: mpsc::UnboundedSender<Command>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl std::fmt::Debug for ExtensionThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionThread").finish()
    }
}

impl ExtensionThread {
    /// Spawns the dedicated OS thread and its current-thread runtime.
    pub fn spawn(group: ExtensionGroup, to_engine: mpsc::UnboundedSender<Message>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = std::thread::Builder::new()
            .name(format!("extension-thread-{}", group.name))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build extension thread runtime");
                runtime.block_on(run(State::new(group, to_engine), command_rx));
            })
            .expect("failed to spawn extension thread");

        Self {
            command_tx,
            handle: Some(handle),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn dispatch(&self, message: Message) {
        let _ = self.command_tx.send(Command::Dispatch(message));
    }

    /// Drives the thread through `CreatingExtensions`, creating every
    /// configured extension via the addon registry (`spec.md` section 4.6 step 3).
    #[tracing::instrument(skip(self, registry))]
    pub async fn create_extensions(&self, registry: Arc<AddonRegistry>) -> Result<(), GraphError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::CreateExtensions { registry, response_tx })
            .map_err(|_| GraphError::GraphNotFound("extension thread gone".to_owned()))?;
        response_rx
            .await
            .map_err(|_| GraphError::GraphNotFound("extension thread gone".to_owned()))?
    }

    /// Runs the `on_init -> on_start` cascade for every extension in the group.
    pub async fn start(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        let _ = self.command_tx.send(Command::StartCascade { response_tx });
        let _ = response_rx.await;
    }

    /// Runs the `on_stop` cascade for every extension in the group.
    pub async fn stop(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        let _ = self.command_tx.send(Command::StopCascade { response_tx });
        let _ = response_rx.await;
    }

    /// Runs the `on_deinit` cascade, then stops the thread.
    pub async fn deinit_and_shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        let _ = self.command_tx.send(Command::DeinitCascade { response_tx });
        let _ = response_rx.await;

        let (response_tx, response_rx) = oneshot::channel();
        let _ = self.command_tx.send(Command::Shutdown { response_tx });
        let _ = response_rx.await;
    }
}

impl Drop for ExtensionThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The state actually owned by the dispatch thread.
struct State {
    group: ExtensionGroup,
    thread_state: ThreadState,
    to_engine: mpsc::UnboundedSender<Message>,
}

impl State {
    fn new(group: ExtensionGroup, to_engine: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            group,
            thread_state: ThreadState::Init,
            to_engine,
        }
    }

    fn create_extensions(&mut self, created: Vec<(String, Box<dyn extension::ExtensionImpl>)>) {
        self.thread_state = ThreadState::CreatingExtensions;
        for (name, imp) in created {
            let mut extension = Extension::new(name.clone(), imp);
            if let Some(routes) = self.group.routes.get(&name) {
                extension.msg_dest_runtime_info = routes.clone();
            }
            self.group.extensions.insert(name, extension);
        }
        self.thread_state = ThreadState::Normal;
    }

    /// Runs `on_init` then `on_start` for every extension, in group order.
    fn run_start_cascade(&mut self) {
        let names: Vec<String> = self.group.extensions.keys().cloned().collect();
        for name in &names {
            self.invoke(name, Phase::Init);
        }
        for name in &names {
            self.invoke(name, Phase::Start);
        }
    }

    fn run_stop_cascade(&mut self) {
        self.thread_state = ThreadState::Closing;
        let names: Vec<String> = self.group.extensions.keys().cloned().collect();
        for name in &names {
            self.invoke(name, Phase::Stop);
        }
    }

    fn run_deinit_cascade(&mut self) {
        let names: Vec<String> = self.group.extensions.keys().cloned().collect();
        for name in &names {
            self.invoke(name, Phase::Deinit);
        }
        self.thread_state = ThreadState::Closed;
    }

    fn invoke(&mut self, extension_name: &str, phase: Phase) {
        let Some(extension) = self.group.extensions.get_mut(extension_name) else {
            return;
        };

        let loc = Loc::extension(self.group.name.clone(), extension.name.clone());
        let mut outbox = Vec::new();
        {
            let mut ten_env = TenEnv::new(loc, &mut outbox);
            match phase {
                Phase::Init => extension.imp_mut().on_init(&mut ten_env),
                Phase::Start => extension.imp_mut().on_start(&mut ten_env),
                Phase::Stop => extension.imp_mut().on_stop(&mut ten_env),
                Phase::Deinit => extension.imp_mut().on_deinit(&mut ten_env),
                Phase::Cmd(cmd) => extension.imp_mut().on_cmd(&mut ten_env, cmd),
                Phase::Data(data) => extension.imp_mut().on_data(&mut ten_env, data),
                Phase::AudioFrame(frame) => extension.imp_mut().on_audio_frame(&mut ten_env, frame),
                Phase::VideoFrame(frame) => extension.imp_mut().on_video_frame(&mut ten_env, frame),
            }
        }

        self.drain_outbox(extension_name, outbox);
    }

    fn drain_outbox(&mut self, extension_name: &str, outbox: Vec<OutboundEvent>) {
        for event in outbox {
            match event {
                OutboundEvent::Lifecycle(done) => self.apply_lifecycle_done(extension_name, done),
                OutboundEvent::Send {
                    message,
                    result_handler,
                } => self.handle_outbound(extension_name, message, result_handler),
            }
        }
    }

    fn apply_lifecycle_done(&mut self, extension_name: &str, done: LifecycleDone) {
        if let Some(extension) = self.group.extensions.get_mut(extension_name) {
            extension.state = match done {
                LifecycleDone::InitDone => LifecycleState::InitDone,
                LifecycleDone::StartDone => LifecycleState::StartDone,
                LifecycleDone::StopDone => LifecycleState::StopDone,
                LifecycleDone::DeinitDone => LifecycleState::Deinited,
            };
        }
    }

    /// Handles an inbound message per `spec.md` section 4.4's five steps.
    fn handle_inbound(&mut self, mut message: Message) {
        if self.thread_state == ThreadState::Closed {
            return;
        }

        let Some(dest) = message.dests.first().cloned() else {
            return;
        };

        let Some(extension) = self.group.extensions.get_mut(&dest.extension) else {
            return;
        };

        if self.thread_state == ThreadState::Closing && !message.kind.is_cmd_result() {
            return;
        }

        match &message.kind {
            MessageKind::Cmd { name, id, seq_id } => {
                if let Some(schema) = extension.schema_store.cmd_in.get(name)
                    && crate::schema::SchemaValidator::validate(&crate::schema::BasicSchemaValidator, schema, &message.properties)
                        .is_err()
                {
                    let mut error = Message::new_cmd_result(
                        StatusCode::Error,
                        name.clone(),
                        *id,
                        true,
                        dest.clone(),
                    );
                    error.dests = vec![message.src.clone()];
                    self.to_engine.send(error).ok();
                    return;
                }

                extension
                    .path_table
                    .add_in_path(*id, name.clone(), message.src.clone(), *seq_id, extension.path_timeout);

                let extension_name = extension.name.clone();
                self.invoke(&extension_name, Phase::Cmd(message));
            }
            MessageKind::CmdResult {
                status, is_final, correlates_to, ..
            } => {
                let mut is_ok = matches!(status, StatusCode::Ok);
                let is_final = *is_final;
                let correlates_to = *correlates_to;

                let failed_schema = extension
                    .path_table
                    .out_path_cmd_name(correlates_to)
                    .and_then(|cmd_name| extension.schema_store.cmd_out.get(cmd_name))
                    .is_some_and(|schema| {
                        crate::schema::SchemaValidator::validate(&crate::schema::BasicSchemaValidator, schema, &message.properties).is_err()
                    });

                if failed_schema {
                    is_ok = false;
                    if let MessageKind::CmdResult { status, .. } = &mut message.kind {
                        *status = StatusCode::Error;
                    }
                }

                extension.path_table.resolve_out_path(correlates_to, is_final, is_ok, message);
            }
            MessageKind::Data { name } => {
                if let Some(schema) = extension.schema_store.data_in.get(name)
                    && crate::schema::SchemaValidator::validate(&crate::schema::BasicSchemaValidator, schema, &message.properties)
                        .is_err()
                {
                    tracing::warn!(extension = %extension.name, %name, "dropping data message failing schema");
                    return;
                }
                let extension_name = extension.name.clone();
                self.invoke(&extension_name, Phase::Data(message));
            }
            MessageKind::AudioFrame { .. } => {
                let extension_name = extension.name.clone();
                self.invoke(&extension_name, Phase::AudioFrame(message));
            }
            MessageKind::VideoFrame { .. } => {
                let extension_name = extension.name.clone();
                self.invoke(&extension_name, Phase::VideoFrame(message));
            }
        }
    }

    /// Handles a message emitted from within a callback, per `spec.md`
    /// section 4.4's outbound steps.
    fn handle_outbound(
        &mut self,
        extension_name: &str,
        mut message: Message,
        result_handler: Option<crate::path::ResultHandler>,
    ) {
        let Some(extension) = self.group.extensions.get_mut(extension_name) else {
            return;
        };

        if message.kind.is_cmd_result() {
            let MessageKind::CmdResult { correlates_to, .. } = &message.kind else {
                unreachable!("matched CmdResult above");
            };
            match extension.path_table.take_in_path(*correlates_to) {
                Some(path) => message.dests = vec![path.original_src],
                None => {
                    tracing::warn!(extension = extension_name, "dropping cmd_result with no matching in-path");
                    return;
                }
            }
        }

        if message.dests.is_empty() {
            message.dests = extension.resolve_dests(message.kind.name());
        }

        if message.dests.is_empty() {
            tracing::warn!(extension = extension_name, "message has no resolved destination, dropping");
            return;
        }

        let is_cmd = message.kind.is_cmd();
        let fanout = message.dests.len() > 1;
        let dests = message.dests.clone();
        let messages = message.explode();

        if is_cmd && fanout {
            let cmd_ids: Vec<_> = messages.iter().filter_map(Message::cmd_id).collect();
            let cmd_name = messages[0].kind.name().to_owned();
            let original_src = messages[0].src.clone();
            let handler = result_handler.unwrap_or_else(|| Box::new(|_| {}));
            extension.path_table.add_out_path_group(
                cmd_ids,
                cmd_name,
                original_src,
                extension.path_timeout,
                GroupPolicy::OneFailReturnAndAllOkReturnLast,
                handler,
            );
        } else if is_cmd {
            if let Some(cmd_id) = messages[0].cmd_id() {
                let handler = result_handler.unwrap_or_else(|| Box::new(|_| {}));
                extension.path_table.add_out_path(
                    cmd_id,
                    messages[0].kind.name().to_owned(),
                    messages[0].src.clone(),
                    extension.path_timeout,
                    handler,
                );
            }
        }

        for (msg, dest) in messages.into_iter().zip(dests) {
            self.route(dest, msg);
        }
    }

    fn route(&mut self, dest: Loc, message: Message) {
        if self.group.extensions.contains_key(&dest.extension) && dest.extension_group == self.group.name {
            self.handle_inbound(message);
        } else {
            self.to_engine.send(message).ok();
        }
    }

    /// Sweeps every extension's `PathTable` for expired paths, synthesising
    /// timeouts, see `spec.md` section 4.4's timer paragraph.
    fn sweep_timeouts(&mut self, now: Instant) {
        let names: Vec<String> = self.group.extensions.keys().cloned().collect();
        for name in names {
            let Some(extension) = self.group.extensions.get_mut(&name) else {
                continue;
            };

            for path in extension.path_table.take_expired_in_paths(now) {
                let mut timeout = Message::new_cmd_result(
                    StatusCode::Timeout,
                    path.cmd_name,
                    path.cmd_id,
                    true,
                    Loc::extension(self.group.name.clone(), name.clone()),
                );
                timeout.dests = vec![path.original_src];
                self.to_engine.send(timeout).ok();
            }

            for (path, handler) in extension.path_table.take_expired_out_paths(now) {
                let timeout = Message::new_cmd_result(
                    StatusCode::Timeout,
                    path.cmd_name,
                    path.cmd_id,
                    true,
                    Loc::extension(self.group.name.clone(), name.clone()),
                );
                handler(timeout);
            }
        }
    }
}

enum Phase {
    Init,
    Start,
    Stop,
    Deinit,
    Cmd(Message),
    Data(Message),
    AudioFrame(Message),
    VideoFrame(Message),
}

async fn create_configured_extensions(
    specs: &[extension::ExtensionSpec],
    registry: &AddonRegistry,
) -> Result<Vec<(String, Box<dyn extension::ExtensionImpl>)>, GraphError> {
    let mut created = Vec::with_capacity(specs.len());
    for spec in specs {
        let instance = registry
            .create_instance(AddonKind::Extension, &spec.addon_name, &spec.instance_name)
            .await
            .map_err(|_| GraphError::UnknownAddon(spec.addon_name.clone()))?;
        let imp = extension::from_instance(instance).map_err(|_| GraphError::UnknownAddon(spec.addon_name.clone()))?;
        created.push((spec.instance_name.clone(), imp));
    }
    Ok(created)
}

async fn run(mut state: State, mut command_rx: mpsc::UnboundedReceiver<Command>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Dispatch(message) => state.handle_inbound(message),
                    Command::CreateExtensions { registry, response_tx } => {
                        let specs = state.group.specs.clone();
                        let result = create_configured_extensions(&specs, &registry).await;
                        let response = match result {
                            Ok(created) => {
                                state.create_extensions(created);
                                Ok(())
                            }
                            Err(error) => Err(error),
                        };
                        let _ = response_tx.send(response);
                    }
                    Command::StartCascade { response_tx } => {
                        state.run_start_cascade();
                        let _ = response_tx.send(());
                    }
                    Command::StopCascade { response_tx } => {
                        state.run_stop_cascade();
                        let _ = response_tx.send(());
                    }
                    Command::DeinitCascade { response_tx } => {
                        state.run_deinit_cascade();
                        let _ = response_tx.send(());
                    }
                    Command::Shutdown { response_tx } => {
                        let _ = response_tx.send(());
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                state.sweep_timeouts(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{ExtensionImpl, ExtensionSpec};

    struct Passthrough;
    impl ExtensionImpl for Passthrough {}

    fn test_group() -> ExtensionGroup {
        let mut group = ExtensionGroup::new(
            "g1",
            vec![ExtensionSpec {
                addon_name: "echo".into(),
                instance_name: "e1".into(),
            }],
            indexmap::IndexMap::new(),
        );
        group
            .extensions
            .insert("e1".into(), Extension::new("e1", Box::new(Passthrough)));
        group
    }

    #[test]
    fn single_extension_echo_returns_ok_result() {
        let (to_engine, mut from_thread) = mpsc::unbounded_channel();
        let mut state = State::new(test_group(), to_engine);
        state.thread_state = ThreadState::Normal;

        let cmd = Message::new_cmd("ping", Loc::extension("other", "caller"), vec![Loc::extension("g1", "e1")]);
        let cmd_id = cmd.cmd_id().unwrap();
        state.handle_inbound(cmd);

        let result = from_thread.try_recv().expect("expected a routed cmd_result");
        match result.kind {
            MessageKind::CmdResult {
                status, correlates_to, ..
            } => {
                assert_eq!(status, StatusCode::Ok);
                assert_eq!(correlates_to, cmd_id);
            }
            _ => panic!("expected a cmd_result"),
        }
        assert_eq!(result.dests, vec![Loc::extension("other", "caller")]);
    }

    /// `spec.md` section 4.4 step 3 / section 7 `SchemaViolation`: an
    /// inbound cmd_result failing the extension's `cmd_out` schema must be
    /// delivered to the waiting OUT-path with its status forced to `Error`.
    #[test]
    fn cmd_result_failing_cmd_out_schema_is_forced_to_error() {
        use crate::schema::{FieldType, Schema};
        use std::sync::atomic::{AtomicBool, Ordering};

        let (to_engine, _from_thread) = mpsc::unbounded_channel();
        let mut state = State::new(test_group(), to_engine);
        state.thread_state = ThreadState::Normal;

        let extension = state.group.extensions.get_mut("e1").unwrap();
        extension
            .schema_store
            .cmd_out
            .insert("ping".to_owned(), Schema::new().field("reply", FieldType::String));

        let cmd_id = ten_runtime_protocol::CmdId::new();
        let delivered_ok = Arc::new(AtomicBool::new(false));
        let delivered_ok_clone = delivered_ok.clone();
        extension.path_table.add_out_path(
            cmd_id,
            "ping",
            Loc::extension("g1", "e1"),
            None,
            Box::new(move |result| {
                let MessageKind::CmdResult { status, .. } = result.kind else {
                    panic!("expected a cmd_result");
                };
                delivered_ok_clone.store(status == StatusCode::Ok, Ordering::SeqCst);
            }),
        );

        // Missing the schema's required `reply` field.
        let mut result = Message::new_cmd_result(StatusCode::Ok, "ping", cmd_id, true, Loc::extension("g1", "callee"));
        result.dests = vec![Loc::extension("g1", "e1")];
        state.handle_inbound(result);

        assert!(!delivered_ok.load(Ordering::SeqCst));
    }

    #[test]
    fn unknown_destination_extension_is_dropped() {
        let (to_engine, mut from_thread) = mpsc::unbounded_channel();
        let mut state = State::new(test_group(), to_engine);
        state.thread_state = ThreadState::Normal;

        let cmd = Message::new_cmd("ping", Loc::extension("other", "caller"), vec![Loc::extension("g1", "missing")]);
        state.handle_inbound(cmd);

        assert!(from_thread.try_recv().is_err());
    }
}
