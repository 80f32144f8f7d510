//! The typed message envelope, see `spec.md` section 3.

use ten_runtime_protocol::{CmdId, Loc, StatusCode, WireEnvelope, WireKind, WireValue};

use crate::error::WireError;
use crate::value::{OpaquePtr, Value};

/// The kind-specific payload of a [`Message`].
#[derive(Clone, Debug)]
pub enum MessageKind {
    Cmd {
        name: String,
        id: CmdId,
        seq_id: Option<u64>,
    },
    CmdResult {
        status: StatusCode,
        original_cmd_name: String,
        is_final: bool,
        correlates_to: CmdId,
    },
    Data {
        name: String,
    },
    AudioFrame {
        name: String,
        sample_rate: u32,
        channels: u16,
    },
    VideoFrame {
        name: String,
        width: u32,
        height: u32,
    },
}

impl MessageKind {
    pub fn name(&self) -> &str {
        match self {
            MessageKind::Cmd { name, .. } => name,
            MessageKind::CmdResult { .. } => "",
            MessageKind::Data { name } => name,
            MessageKind::AudioFrame { name, .. } => name,
            MessageKind::VideoFrame { name, .. } => name,
        }
    }

    pub fn is_cmd(&self) -> bool {
        matches!(self, MessageKind::Cmd { .. })
    }

    pub fn is_cmd_result(&self) -> bool {
        matches!(self, MessageKind::CmdResult { .. })
    }
}

/// An in-flight message travelling between extensions, see `spec.md` section 3.
#[derive(Clone, Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub src: Loc,
    pub dests: Vec<Loc>,
    pub properties: Value,
    /// Non-owning handles into caller-owned buffers that must outlive this message.
    pub locked_resources: Vec<OpaquePtr>,
}

impl Message {
    /// Builds a new `Cmd` message with a freshly generated `cmd_id`.
    pub fn new_cmd(name: impl Into<String>, src: Loc, dests: Vec<Loc>) -> Self {
        Self {
            kind: MessageKind::Cmd {
                name: name.into(),
                id: CmdId::new(),
                seq_id: None,
            },
            src,
            dests,
            properties: Value::empty_object(),
            locked_resources: Vec::new(),
        }
    }

    /// Builds a `CmdResult` correlated to `cmd_id`. The dest is left empty;
    /// per `spec.md` section 3 it must be filled in from the `PathTable`,
    /// never set directly by the sender.
    pub fn new_cmd_result(
        status: StatusCode,
        original_cmd_name: impl Into<String>,
        correlates_to: CmdId,
        is_final: bool,
        src: Loc,
    ) -> Self {
        Self {
            kind: MessageKind::CmdResult {
                status,
                original_cmd_name: original_cmd_name.into(),
                is_final,
                correlates_to,
            },
            src,
            dests: Vec::new(),
            properties: Value::empty_object(),
            locked_resources: Vec::new(),
        }
    }

    pub fn new_data(name: impl Into<String>, src: Loc, dests: Vec<Loc>) -> Self {
        Self {
            kind: MessageKind::Data { name: name.into() },
            src,
            dests,
            properties: Value::empty_object(),
            locked_resources: Vec::new(),
        }
    }

    /// Clones this message, regenerating `cmd_id` if it is a `Cmd`, per
    /// `spec.md` section 3 ("clone regenerates a cmd's id").
    pub fn clone_for_fanout(&self) -> Self {
        let mut cloned = self.clone();
        if let MessageKind::Cmd { id, .. } = &mut cloned.kind {
            *id = CmdId::new();
        }
        cloned
    }

    /// Explodes this message across its `dests`: the first destination keeps
    /// the original, the rest get fresh clones (with regenerated `cmd_id` for
    /// commands), per `spec.md` section 3.
    ///
    /// Each returned message carries exactly one destination.
    pub fn explode(self) -> Vec<Message> {
        if self.dests.len() <= 1 {
            return vec![self];
        }

        let mut out = Vec::with_capacity(self.dests.len());
        let dests = self.dests.clone();
        for (index, dest) in dests.into_iter().enumerate() {
            if index == 0 {
                let mut first = self.clone();
                first.dests = vec![dest];
                out.push(first);
            } else {
                let mut copy = self.clone_for_fanout();
                copy.dests = vec![dest];
                out.push(copy);
            }
        }
        out
    }

    pub fn cmd_id(&self) -> Option<CmdId> {
        match &self.kind {
            MessageKind::Cmd { id, .. } => Some(*id),
            MessageKind::CmdResult { correlates_to, .. } => Some(*correlates_to),
            _ => None,
        }
    }
}

impl From<&Message> for WireEnvelope {
    /// Flattens this message into the wire shape a [`crate::remote::Protocol`]
    /// puts on the transport, see `spec.md` section 6.
    fn from(message: &Message) -> Self {
        let (kind, name, cmd_id, seq_id) = match &message.kind {
            MessageKind::Cmd { name, id, seq_id } => (WireKind::Cmd, name.clone(), Some(*id), *seq_id),
            MessageKind::CmdResult {
                status,
                original_cmd_name,
                is_final,
                correlates_to,
            } => (
                WireKind::CmdResult {
                    status: *status,
                    original_cmd_name: original_cmd_name.clone(),
                    is_final: *is_final,
                },
                String::new(),
                Some(*correlates_to),
                None,
            ),
            MessageKind::Data { name } => (WireKind::Data, name.clone(), None, None),
            MessageKind::AudioFrame { name, sample_rate, channels } => (
                WireKind::AudioFrame {
                    sample_rate: *sample_rate,
                    channels: *channels,
                },
                name.clone(),
                None,
                None,
            ),
            MessageKind::VideoFrame { name, width, height } => (
                WireKind::VideoFrame { width: *width, height: *height },
                name.clone(),
                None,
                None,
            ),
        };

        Self {
            kind,
            name,
            cmd_id,
            seq_id,
            src: message.src.clone(),
            dest: message.dests.clone(),
            properties: WireValue::from(&message.properties),
        }
    }
}

impl TryFrom<WireEnvelope> for Message {
    type Error = WireError;

    /// Reconstitutes a `Message` from a wire envelope, see `spec.md` section 6.
    ///
    /// `locked_resources` never travels over the wire (`spec.md` section 5);
    /// a message reconstituted from a `Protocol` always carries none.
    fn try_from(envelope: WireEnvelope) -> Result<Self, Self::Error> {
        let kind = match envelope.kind {
            WireKind::Cmd => MessageKind::Cmd {
                name: envelope.name,
                id: envelope.cmd_id.ok_or(WireError::MissingCmdId)?,
                seq_id: envelope.seq_id,
            },
            WireKind::CmdResult { status, original_cmd_name, is_final } => MessageKind::CmdResult {
                status,
                original_cmd_name,
                is_final,
                correlates_to: envelope.cmd_id.ok_or(WireError::MissingCmdId)?,
            },
            WireKind::Data => MessageKind::Data { name: envelope.name },
            WireKind::AudioFrame { sample_rate, channels } => MessageKind::AudioFrame {
                name: envelope.name,
                sample_rate,
                channels,
            },
            WireKind::VideoFrame { width, height } => MessageKind::VideoFrame {
                name: envelope.name,
                width,
                height,
            },
        };

        Ok(Self {
            kind,
            src: envelope.src,
            dests: envelope.dest,
            properties: Value::from(&envelope.properties),
            locked_resources: Vec::new(),
        })
    }
}
