//! Core runtime for composing applications from message-routed extensions.
//!
//! An [`App`](app::App) owns a set of per-kind [`AddonRegistry`](addon::AddonRegistry)s
//! and zero or more running [`Engine`](engine::Engine)s. Each `Engine` is one graph
//! instance: it drives one or more [`ExtensionThread`](extension_thread::ExtensionThread)s,
//! each of which owns an [`ExtensionGroup`](extension::ExtensionGroup) of
//! [`Extension`](extension::Extension)s and dispatches [`Message`](message::Message)s
//! between them. [`Remote`](remote::Remote) bridges external peers in over a pluggable
//! [`Protocol`](remote::Protocol).
//!
//! See `SPEC_FULL.md` at the repository root for the full design.

#![forbid(unsafe_code)]

pub mod addon;
pub mod app;
pub mod closeable;
pub mod engine;
pub mod error;
pub mod extension;
pub mod extension_thread;
pub mod eyre_tracing_error;
pub mod jsonl_protocol;
pub mod message;
pub mod path;
pub mod remote;
pub mod schema;
pub mod signal;
pub mod value;

pub use addon::{Addon, AddonHost, AddonRegistry};
pub use app::App;
pub use closeable::Closeable;
pub use engine::Engine;
pub use error::{AddonError, GraphError, SchemaError, SendError, ValueError, WireError};
pub use extension::{Extension, ExtensionGroup, ExtensionImpl, TenEnv};
pub use extension_thread::ExtensionThread;
pub use jsonl_protocol::JsonLinesProtocol;
pub use message::{Message, MessageKind};
pub use path::PathTable;
pub use remote::{Connection, Protocol, Remote};
pub use schema::{BasicSchemaValidator, Schema, SchemaValidator};
pub use value::Value;

pub use ten_runtime_protocol::{
    AddonKind, CmdId, GraphDescription, GraphNode, Loc, PredefinedGraph, StatusCode,
};
