use thiserror::Error;

pub mod config;
pub mod event;
pub mod link;
pub mod location;
pub mod manager;
pub mod model;
pub mod session;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PACKAGE: &str = env!("CARGO_PKG_NAME");

/// Session-unique node identifier.
pub type NodeId = u32;
/// Identifier of an interface within its owning node.
pub type IfaceId = u32;
/// Network Emulation Module identity inside the radio emulator.
pub type NemId = u16;

/// Handle reference to an interface: `(node id, interface id)`. The
/// manager stores these instead of owning the interfaces themselves,
/// resolving them through the session at use time.
pub type IfaceKey = (NodeId, IfaceId);

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("unknown radio model '{0}'")]
    UnknownModel(String),
    #[error("radio emulator event bindings are not available")]
    MissingBindings,
    #[error("duplicate radio network({0}): {1}")]
    DuplicateNetwork(NodeId, String),
    #[error("radio network({0}) has no model set")]
    MissingNodeModel(NodeId),
    #[error("failed to launch radio daemon for interface '{0}'")]
    LaunchFailed(String),
    #[error("command '{cmd}' failed with status {status}")]
    CommandFailed { cmd: String, status: i32 },
    #[error("location ({0}, {1}, {2}) exceeds the session coordinate space")]
    InvalidLocation(i64, i64, i64),
    #[error("no interface registered for NEM {0}")]
    UnknownNem(NemId),
    #[error("no such node {0}")]
    NoSuchNode(NodeId),
    #[error("bad option value for '{key}': {value}")]
    InvalidOption { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, RadioError>;
