//! The user-facing unit (`Extension`) and its container (`ExtensionGroup`),
//! see `spec.md` section 4.3.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use ten_runtime_protocol::Loc;

use crate::closeable::Closeable;
use crate::message::Message;
use crate::path::{PathTable, ResultHandler};
use crate::schema::Schema;

/// Lifecycle state shared by [`Extension`] and [`ExtensionGroup`], see
/// `spec.md` section 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Init,
    InitDone,
    Start,
    StartDone,
    Stop,
    StopDone,
    Deinit,
    Deinited,
}

/// A pending lifecycle acknowledgement a callback reports via [`TenEnv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleDone {
    InitDone,
    StartDone,
    StopDone,
    DeinitDone,
}

/// Something a user callback produced during its single synchronous
/// invocation: either a lifecycle acknowledgement or an outgoing message.
///
/// The owning `ExtensionThread` drains these after every callback runs to
/// completion (`spec.md` section 5: "every user callback runs to completion
/// before the next task is dispatched").
pub enum OutboundEvent {
    Lifecycle(LifecycleDone),
    Send {
        message: Message,
        result_handler: Option<ResultHandler>,
    },
}

/// The handle a user callback uses to acknowledge lifecycle steps and emit
/// messages, see the `ten_env` glossary entry in `spec.md`.
///
/// Callbacks run synchronously to completion on the owning `ExtensionThread`,
/// so `TenEnv` only needs to buffer what happened during the call; the
/// thread drains `outbox` once the callback returns.
pub struct TenEnv<'a> {
    loc: Loc,
    outbox: &'a mut Vec<OutboundEvent>,
}

impl<'a> TenEnv<'a> {
    pub fn new(loc: Loc, outbox: &'a mut Vec<OutboundEvent>) -> Self {
        Self { loc, outbox }
    }

    pub fn loc(&self) -> &Loc {
        &self.loc
    }

    pub fn on_init_done(&mut self) {
        self.outbox.push(OutboundEvent::Lifecycle(LifecycleDone::InitDone));
    }

    pub fn on_start_done(&mut self) {
        self.outbox.push(OutboundEvent::Lifecycle(LifecycleDone::StartDone));
    }

    pub fn on_stop_done(&mut self) {
        self.outbox.push(OutboundEvent::Lifecycle(LifecycleDone::StopDone));
    }

    pub fn on_deinit_done(&mut self) {
        self.outbox.push(OutboundEvent::Lifecycle(LifecycleDone::DeinitDone));
    }

    /// Emits a cmd, stamping `src` as this extension's location.
    ///
    /// `result_handler` is invoked with the eventual (or synthesised
    /// timeout) `CmdResult`; pass `None` to fire-and-forget.
    pub fn send_cmd(&mut self, mut cmd: Message, result_handler: Option<ResultHandler>) {
        cmd.src = self.loc.clone();
        self.outbox.push(OutboundEvent::Send {
            message: cmd,
            result_handler,
        });
    }

    pub fn send_data(&mut self, mut data: Message) {
        data.src = self.loc.clone();
        self.outbox.push(OutboundEvent::Send {
            message: data,
            result_handler: None,
        });
    }

    pub fn send_audio_frame(&mut self, mut frame: Message) {
        frame.src = self.loc.clone();
        self.outbox.push(OutboundEvent::Send {
            message: frame,
            result_handler: None,
        });
    }

    pub fn send_video_frame(&mut self, mut frame: Message) {
        frame.src = self.loc.clone();
        self.outbox.push(OutboundEvent::Send {
            message: frame,
            result_handler: None,
        });
    }

    /// Returns a result for an inbound cmd; its dest is resolved later from
    /// the `PathTable`, never set here, per `spec.md` section 3.
    pub fn return_result(&mut self, mut result: Message) {
        result.src = self.loc.clone();
        result.dests.clear();
        self.outbox.push(OutboundEvent::Send {
            message: result,
            result_handler: None,
        });
    }
}

/// The five user-overridable callbacks, see `spec.md` section 4.3.
///
/// Defaults forward to the matching `*_done` call (lifecycle) or, for
/// message callbacks, perform the original's default-forwarding behaviour
/// (`SPEC_FULL.md`'s `extension.c` supplement): an extension that doesn't
/// care about a message kind doesn't have to override its callback. The
/// default for `on_cmd` answers with an OK result so an un-overridden
/// extension never causes the sender to hang; `on_data`/frame defaults drop
/// silently, since those are one-way.
pub trait ExtensionImpl: Send {
    fn on_init(&mut self, ten_env: &mut TenEnv<'_>) {
        ten_env.on_init_done();
    }

    fn on_start(&mut self, ten_env: &mut TenEnv<'_>) {
        ten_env.on_start_done();
    }

    fn on_stop(&mut self, ten_env: &mut TenEnv<'_>) {
        ten_env.on_stop_done();
    }

    fn on_deinit(&mut self, ten_env: &mut TenEnv<'_>) {
        ten_env.on_deinit_done();
    }

    fn on_cmd(&mut self, ten_env: &mut TenEnv<'_>, cmd: Message) {
        use ten_runtime_protocol::StatusCode;
        let crate::message::MessageKind::Cmd { name, id, .. } = &cmd.kind else {
            return;
        };
        let result = Message::new_cmd_result(StatusCode::Ok, name.clone(), *id, true, cmd.src.clone());
        ten_env.return_result(result);
    }

    fn on_data(&mut self, _ten_env: &mut TenEnv<'_>, _data: Message) {}

    fn on_audio_frame(&mut self, _ten_env: &mut TenEnv<'_>, _frame: Message) {}

    fn on_video_frame(&mut self, _ten_env: &mut TenEnv<'_>, _frame: Message) {}
}

/// Per-direction schema requirements for one extension, see `spec.md`
/// sections 3 and 4.4 ("schema-validate on in"/"on out").
#[derive(Default)]
pub struct SchemaStore {
    pub cmd_in: IndexMap<String, Schema>,
    pub cmd_out: IndexMap<String, Schema>,
    pub data_in: IndexMap<String, Schema>,
    pub data_out: IndexMap<String, Schema>,
    pub audio_frame_in: IndexMap<String, Schema>,
    pub audio_frame_out: IndexMap<String, Schema>,
    pub video_frame_in: IndexMap<String, Schema>,
    pub video_frame_out: IndexMap<String, Schema>,
}

/// A single user-supplied processing unit, see `spec.md` section 3.
///
/// Owned exclusively by one `ExtensionThread` after creation; only that
/// thread ever mutates it (`spec.md` section 8, "thread isolation").
pub struct Extension {
    pub name: String,
    pub state: LifecycleState,
    pub schema_store: SchemaStore,
    pub path_table: PathTable,
    pub pending_msgs: Vec<Message>,
    /// Resolved `message name -> destinations` routing table, built from the
    /// graph description's `connections` when the graph starts.
    pub msg_dest_runtime_info: IndexMap<String, Vec<Loc>>,
    pub path_timeout: Option<Duration>,
    pub path_check_interval: Duration,
    pub closeable: Arc<Closeable>,
    imp: Box<dyn ExtensionImpl>,
}

impl Extension {
    pub fn new(name: impl Into<String>, imp: Box<dyn ExtensionImpl>) -> Self {
        Self {
            name: name.into(),
            state: LifecycleState::New,
            schema_store: SchemaStore::default(),
            path_table: PathTable::new(),
            pending_msgs: Vec::new(),
            msg_dest_runtime_info: IndexMap::new(),
            path_timeout: None,
            path_check_interval: Duration::from_secs(10),
            closeable: Closeable::new(),
            imp,
        }
    }

    pub fn imp_mut(&mut self) -> &mut dyn ExtensionImpl {
        self.imp.as_mut()
    }

    /// Looks up the resolved destinations for `name`, falling back to the
    /// `"*"` wildcard entry, see `spec.md` section 6.
    pub fn resolve_dests(&self, name: &str) -> Vec<Loc> {
        self.msg_dest_runtime_info
            .get(name)
            .or_else(|| self.msg_dest_runtime_info.get("*"))
            .cloned()
            .unwrap_or_default()
    }
}

/// One extension this group is configured to create, see `spec.md` section 3.
#[derive(Clone, Debug)]
pub struct ExtensionSpec {
    pub addon_name: String,
    pub instance_name: String,
}

/// The container of extensions running on one `ExtensionThread`, see
/// `spec.md` section 3.
pub struct ExtensionGroup {
    pub name: String,
    pub state: LifecycleState,
    pub specs: Vec<ExtensionSpec>,
    pub extensions: IndexMap<String, Extension>,
    pub closeable: Arc<Closeable>,
    /// `extension name -> (message name -> destinations)` routing, compiled
    /// from the graph description's `connections` when the graph starts, see
    /// `spec.md` section 6. Each extension created in this group picks up
    /// its own entry as its `msg_dest_runtime_info`.
    pub routes: IndexMap<String, IndexMap<String, Vec<Loc>>>,
}

/// Wraps a boxed [`ExtensionImpl`] so it can travel through
/// [`crate::addon::AddonRegistry`]'s type-erased [`crate::addon::Instance`]
/// slot and be downcast back on the other side.
pub struct BoxedExtensionImpl(pub Box<dyn ExtensionImpl>);

/// Packs an extension implementation into an addon [`crate::addon::Instance`].
pub fn into_instance(imp: Box<dyn ExtensionImpl>) -> crate::addon::Instance {
    Box::new(BoxedExtensionImpl(imp))
}

/// Unpacks an addon [`crate::addon::Instance`] produced by an extension addon.
pub fn from_instance(instance: crate::addon::Instance) -> Result<Box<dyn ExtensionImpl>, crate::error::AddonError> {
    instance
        .downcast::<BoxedExtensionImpl>()
        .map(|boxed| boxed.0)
        .map_err(|_| crate::error::AddonError::UnknownAddon("instance was not an ExtensionImpl".to_owned()))
}

impl ExtensionGroup {
    pub fn new(
        name: impl Into<String>,
        specs: Vec<ExtensionSpec>,
        routes: IndexMap<String, IndexMap<String, Vec<Loc>>>,
    ) -> Self {
        Self {
            name: name.into(),
            state: LifecycleState::New,
            specs,
            extensions: IndexMap::new(),
            closeable: Closeable::new(),
            routes,
        }
    }

    pub fn all_extensions_in_state(&self, state: LifecycleState) -> bool {
        self.extensions.values().all(|e| e.state == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ten_runtime_protocol::StatusCode;

    struct Passthrough;
    impl ExtensionImpl for Passthrough {}

    #[test]
    fn default_on_cmd_answers_ok() {
        let mut extension = Extension::new("e1", Box::new(Passthrough));
        let mut outbox = Vec::new();
        let mut ten_env = TenEnv::new(Loc::extension("g1", "e1"), &mut outbox);

        let cmd = Message::new_cmd("ping", Loc::extension("g1", "caller"), vec![]);
        extension.imp_mut().on_cmd(&mut ten_env, cmd);

        assert_eq!(outbox.len(), 1);
        let OutboundEvent::Send { message, .. } = &outbox[0] else {
            panic!("expected a Send event");
        };
        match &message.kind {
            crate::message::MessageKind::CmdResult { status, .. } => {
                assert_eq!(*status, StatusCode::Ok);
            }
            _ => panic!("expected a cmd_result"),
        }
    }

    #[test]
    fn default_lifecycle_callbacks_self_acknowledge() {
        let mut extension = Extension::new("e1", Box::new(Passthrough));
        let mut outbox = Vec::new();
        let mut ten_env = TenEnv::new(Loc::extension("g1", "e1"), &mut outbox);
        extension.imp_mut().on_init(&mut ten_env);
        assert!(matches!(outbox[0], OutboundEvent::Lifecycle(LifecycleDone::InitDone)));
    }

    #[test]
    fn resolve_dests_falls_back_to_wildcard() {
        let mut extension = Extension::new("e1", Box::new(Passthrough));
        extension
            .msg_dest_runtime_info
            .insert("*".to_owned(), vec![Loc::extension("g1", "e2")]);
        assert_eq!(extension.resolve_dests("anything"), vec![Loc::extension("g1", "e2")]);
    }
}
