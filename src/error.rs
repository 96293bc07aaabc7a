//! Crate-wide typed error enums. Each subsystem gets its own variant set so
//! callers can match on `kind`/`retryable` instead of parsing strings, per
//! the adapter error taxonomy in the spec (§4.1, §7).

use thiserror::Error;

/// Transport-level failure kind, shared by every adapter variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Open,
    Io,
    FrameTimeout,
}

#[derive(Debug, Error)]
#[error("transport error: {kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Adapter-local error taxonomy (spec §4.1 "Error taxonomy (adapter-local)").
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transport open failed: {0}")]
    TransportOpen(String),
    #[error("transport I/O error: {0}")]
    TransportIo(String),
    #[error("frame timeout waiting for response")]
    FrameTimeout,
    #[error("frame CRC mismatch: expected {expected:04x}, got {got:04x}")]
    FrameCrc { expected: u16, got: u16 },
    #[error("frame too short: need {need} bytes, have {have}")]
    DecodeShort { need: usize, have: usize },
    #[error("decoded value {value} out of range for field {field}")]
    DecodeRange { field: String, value: i64 },
    #[error("register {0} is read-only")]
    RegisterReadOnly(String),
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("identity unavailable: {0}")]
    IdentityUnavailable(String),
}

impl AdapterError {
    /// Whether a poll/command worth retrying on the next cycle produced this
    /// error, per spec §4.1's `PollError{kind, retryable}` / `TransportError{kind}`.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::TransportOpen(_)
                | AdapterError::TransportIo(_)
                | AdapterError::FrameTimeout
                | AdapterError::FrameCrc { .. }
                | AdapterError::DecodeShort { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum RegisterMapError {
    #[error("failed to read register map file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse register map file {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
    #[error("duplicate register id {0}")]
    DuplicateId(String),
    #[error("register {id}: size {size} does not match type {ty}")]
    SizeMismatch { id: String, size: u8, ty: String },
    #[error("register {id}: invalid rw mode {mode}")]
    InvalidRw { id: String, mode: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
    #[error("invalid timezone {0}")]
    InvalidTimezone(String),
}

/// `DeviceRegistry`'s own persistence file (spec §3 "Persistent table"),
/// loaded/saved the same way `Config`/the hierarchy file are.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read device registry file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse device registry file {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
    #[error("failed to serialize device registry: {0}")]
    Serialize(serde_json::Error),
}

/// Fatal structural validation errors (spec §7 "Structural"). The process
/// refuses to start when any of these fire.
#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("child {child} has system_id {child_system} but parent {parent} has {parent_system}")]
    SystemIdMismatch { child: String, parent: String, child_system: String, parent_system: String },
    #[error("battery array {0} has more than one active inverter-array attachment")]
    MultipleActiveAttachments(String),
    #[error("battery pack {0} has no enabled adapter")]
    NoEnabledAdapter(String),
    #[error("duplicate adapter_type on shared serial port: {0}")]
    DuplicatePortBinding(String),
    #[error("meter {meter} references nonexistent array {array}")]
    DanglingMeterArray { meter: String, array: String },
    #[error("battery array {0} is attached to two inverter arrays at once")]
    CrossLinkedAttachment(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full, rejected command for {0}")]
    Full(String),
    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("no adapter registered for inverter {0}")]
    UnknownInverter(String),
    #[error("command rejected: {0}")]
    CommandFailed(String),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus publish failed: {0}")]
    Publish(String),
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),
    #[error("bus not connected")]
    NotConnected,
}

/// Top-level process errors, mapped to the exit codes of spec §6.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("config validation failed: {0}")]
    Config(#[from] ConfigError),
    #[error("hierarchy validation failed: {0}")]
    Hierarchy(#[from] HierarchyError),
    #[error("fatal orchestrator error: {0}")]
    Orchestrator(String),
}

impl HubError {
    /// Process exit code per spec §6 ("0 on clean shutdown, nonzero on
    /// config validation failure, hierarchy validation failure, or fatal
    /// orchestrator error").
    pub fn exit_code(&self) -> i32 {
        match self {
            HubError::Config(_) => 1,
            HubError::Hierarchy(_) => 2,
            HubError::Orchestrator(_) => 3,
        }
    }
}
