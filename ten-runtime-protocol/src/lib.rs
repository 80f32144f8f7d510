//! Data definitions shared between the `ten-runtime` core and any external
//! binding or transport that talks to it.
//!
//! Nothing in this crate performs I/O; it only describes shapes. A transport
//! ("protocol" in `ten-runtime` terms) picks an actual wire encoding
//! (MessagePack, JSON, ...) for [`WireEnvelope`]; this crate just fixes the
//! fields that encoding must carry.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod value;
pub use value::WireValue;

/// A 4-tuple identifying a node within the runtime's address space.
///
/// Any suffix may be empty, meaning "the containing scope": an empty
/// `extension` on a destination means "let the containing extension group
/// decide", an empty `app_uri` means "this app".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Loc {
    /// URI of the app that owns this location, empty means "this app".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_uri: String,

    /// Id of the graph instance, empty means "this graph".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub graph_id: String,

    /// Name of the extension group, empty means "unresolved".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extension_group: String,

    /// Name of the extension, empty means "unresolved".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extension: String,
}

impl Loc {
    /// Returns a `Loc` addressing just an extension within the current app and graph.
    pub fn extension(extension_group: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            app_uri: String::new(),
            graph_id: String::new(),
            extension_group: extension_group.into(),
            extension: extension.into(),
        }
    }

    /// Whether every field of this location is empty.
    pub fn is_empty(&self) -> bool {
        self.app_uri.is_empty()
            && self.graph_id.is_empty()
            && self.extension_group.is_empty()
            && self.extension.is_empty()
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.app_uri, self.graph_id, self.extension_group, self.extension
        )
    }
}

/// A freshly generated identifier for a command, regenerated on `clone`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CmdId(pub ulid::Ulid);

impl CmdId {
    /// Generates a new, time-sortable, unique command id.
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for CmdId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CmdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CmdId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_str(s)?))
    }
}

/// Status attached to a [`WireEnvelope`] of kind `CmdResult`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// The command completed successfully.
    Ok,
    /// The command failed; `detail` in the envelope's properties explains why.
    Error,
    /// The command's path expired before a result arrived.
    Timeout,
}

/// The kind-specific tail of a [`WireEnvelope`], distinguishing the five message kinds from
/// `spec.md` section 3.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireKind {
    /// A request expecting zero or more [`WireKind::CmdResult`]s back.
    Cmd,

    /// A response correlated to a `Cmd` by `cmd_id`.
    CmdResult {
        /// Outcome of the correlated command.
        status: StatusCode,
        /// Name of the command this result answers, for diagnostics.
        original_cmd_name: String,
        /// Whether more results for the same `cmd_id` will follow.
        is_final: bool,
    },

    /// A one-way data message, no response expected.
    Data,

    /// A one-way audio frame.
    AudioFrame {
        /// Sample rate in Hz.
        sample_rate: u32,
        /// Number of interleaved channels.
        channels: u16,
    },

    /// A one-way video frame.
    VideoFrame {
        /// Frame width in pixels.
        width: u32,
        /// Frame height in pixels.
        height: u32,
    },
}

/// The wire-serializable envelope of a message, see `spec.md` section 6 ("Wire message").
///
/// Any serialization format is permitted for the bytes a `Protocol` transport actually puts on
/// the wire; this type only fixes which fields must round-trip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// Which message kind this is, and its kind-specific fields.
    pub kind: WireKind,

    /// Name of the message, empty for `CmdResult`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Identifies the command this belongs to; present on `Cmd` and `CmdResult`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cmd_id: Option<CmdId>,

    /// Optional application-level correlator, used to order streamed results.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub seq_id: Option<u64>,

    /// Where this message originated.
    pub src: Loc,

    /// Where this message is headed; serialized even when empty.
    pub dest: Vec<Loc>,

    /// The message's property tree.
    pub properties: WireValue,
}

/// The kind of addon a registration in the addon registry belongs to.
///
/// There is one process-global store per kind, see `spec.md` section 4.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddonKind {
    /// Produces extension instances.
    Extension,
    /// Produces extension-group instances.
    ExtensionGroup,
    /// Produces transport ("protocol") instances.
    Protocol,
    /// Produces addon-loader instances.
    AddonLoader,
}

impl fmt::Display for AddonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Extension => "extension",
            Self::ExtensionGroup => "extension_group",
            Self::Protocol => "protocol",
            Self::AddonLoader => "addon_loader",
        };
        f.write_str(name)
    }
}

/// One entry of a [`GraphDescription`]'s `nodes` array.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphNode {
    /// An extension instance to create.
    Extension {
        /// Unique name within its extension group.
        name: String,
        /// Name of the registered addon that creates this instance.
        addon: String,
        /// Extension group this extension belongs to.
        extension_group: String,
        /// App this node lives on; empty means the current app.
        #[serde(default)]
        app: String,
        /// Initial property values for this extension.
        #[serde(default)]
        property: WireValue,
    },
    /// An extension group to create (and the thread that will run it).
    ExtensionGroup {
        /// Unique name within the graph.
        name: String,
        /// Name of the registered addon that creates this group.
        addon: String,
        /// App this node lives on; empty means the current app.
        #[serde(default)]
        app: String,
        /// Initial property values for this group.
        #[serde(default)]
        property: WireValue,
    },
}

/// A single named destination list for one message-name pattern.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamedDestinations {
    /// Message name this entry applies to; `"*"` matches every name.
    pub name: String,
    /// Destinations messages of this name are routed to.
    pub dest: Vec<Loc>,
}

/// One entry of a [`GraphDescription`]'s `connections` array: everything a single source
/// extension sends out, grouped by message kind.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Connection {
    /// App the source extension lives on; empty means the current app.
    #[serde(default)]
    pub app: String,
    /// Extension group of the source extension.
    pub extension_group: String,
    /// Name of the source extension.
    pub extension: String,
    /// Command routes.
    #[serde(default)]
    pub cmd: Vec<NamedDestinations>,
    /// Data routes.
    #[serde(default)]
    pub data: Vec<NamedDestinations>,
    /// Video frame routes.
    #[serde(default)]
    pub video_frame: Vec<NamedDestinations>,
    /// Audio frame routes.
    #[serde(default)]
    pub audio_frame: Vec<NamedDestinations>,
}

/// A declarative description of nodes and message connections, see `spec.md` section 6.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphDescription {
    /// Extensions and extension groups to create.
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    /// Message routing between them.
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// One entry of the app's `ten.predefined_graphs` property.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PredefinedGraph {
    /// Name clients use to address a singleton instance of this graph.
    pub name: String,
    /// Whether to start this graph automatically at app boot.
    #[serde(default)]
    pub auto_start: bool,
    /// Whether at most one running instance of this graph is allowed.
    #[serde(default)]
    pub singleton: bool,
    /// The graph's nodes.
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    /// The graph's connections.
    #[serde(default)]
    pub connections: Vec<Connection>,
}
