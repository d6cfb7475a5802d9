//! Shared types for the Smart-HTTP engine: service names, capabilities,
//! side-band channels, ref commands, and the protocol error enumeration.

use std::fmt;
use std::str::FromStr;

use crate::{
    errors::{ErrorKind, GitError},
    hash::ObjectHash,
};

/// Protocol error types surfaced to the HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid service: {0}")]
    InvalidService(String),

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pack error: {0}")]
    Pack(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn invalid_request(msg: &str) -> Self {
        ProtocolError::InvalidRequest(msg.to_string())
    }

    pub fn repository_error(msg: String) -> Self {
        ProtocolError::Internal(msg)
    }
}

impl From<GitError> for ProtocolError {
    fn from(err: GitError) -> Self {
        match err.kind() {
            ErrorKind::MalformedInput | ErrorKind::Corruption => {
                ProtocolError::InvalidRequest(err.to_string())
            }
            ErrorKind::NotFound => ProtocolError::ObjectNotFound(err.to_string()),
            ErrorKind::Permission => ProtocolError::Unauthorized(err.to_string()),
            ErrorKind::Capacity => ProtocolError::CapacityExceeded(err.to_string()),
            ErrorKind::Timeout => ProtocolError::Timeout(err.to_string()),
            ErrorKind::Conflict | ErrorKind::Transient | ErrorKind::Fatal => {
                ProtocolError::Internal(err.to_string())
            }
        }
    }
}

/// Git service types for the smart protocol.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ServiceType {
    UploadPack,
    ReceivePack,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceType::UploadPack => write!(f, "git-upload-pack"),
            ServiceType::ReceivePack => write!(f, "git-receive-pack"),
        }
    }
}

impl FromStr for ServiceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(ServiceType::UploadPack),
            "git-receive-pack" => Ok(ServiceType::ReceivePack),
            _ => Err(ProtocolError::InvalidService(s.to_string())),
        }
    }
}

impl ServiceType {
    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            ServiceType::UploadPack => "application/x-git-upload-pack-advertisement",
            ServiceType::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    pub fn result_content_type(&self) -> &'static str {
        match self {
            ServiceType::UploadPack => "application/x-git-upload-pack-result",
            ServiceType::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

/// Capabilities this server understands on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    MultiAckDetailed,
    SideBand,
    SideBand64k,
    ReportStatus,
    OfsDelta,
    ThinPack,
    NoProgress,
    DeleteRefs,
    Atomic,
    Shallow,
    PushOptions,
    NoDone,
    Agent(String),
    Symref(String),
    Unknown(String),
}

impl FromStr for Capability {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("agent=") {
            return Ok(Capability::Agent(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("symref=") {
            return Ok(Capability::Symref(rest.to_string()));
        }
        match s {
            "multi_ack_detailed" => Ok(Capability::MultiAckDetailed),
            "side-band" => Ok(Capability::SideBand),
            "side-band-64k" => Ok(Capability::SideBand64k),
            "report-status" => Ok(Capability::ReportStatus),
            "ofs-delta" => Ok(Capability::OfsDelta),
            "thin-pack" => Ok(Capability::ThinPack),
            "no-progress" => Ok(Capability::NoProgress),
            "delete-refs" => Ok(Capability::DeleteRefs),
            "atomic" => Ok(Capability::Atomic),
            "shallow" => Ok(Capability::Shallow),
            "push-options" => Ok(Capability::PushOptions),
            "no-done" => Ok(Capability::NoDone),
            other => Ok(Capability::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::MultiAckDetailed => write!(f, "multi_ack_detailed"),
            Capability::SideBand => write!(f, "side-band"),
            Capability::SideBand64k => write!(f, "side-band-64k"),
            Capability::ReportStatus => write!(f, "report-status"),
            Capability::OfsDelta => write!(f, "ofs-delta"),
            Capability::ThinPack => write!(f, "thin-pack"),
            Capability::NoProgress => write!(f, "no-progress"),
            Capability::DeleteRefs => write!(f, "delete-refs"),
            Capability::Atomic => write!(f, "atomic"),
            Capability::Shallow => write!(f, "shallow"),
            Capability::PushOptions => write!(f, "push-options"),
            Capability::NoDone => write!(f, "no-done"),
            Capability::Agent(agent) => write!(f, "agent={agent}"),
            Capability::Symref(symref) => write!(f, "symref={symref}"),
            Capability::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Side-band channels of the multiplexed pack stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideBand {
    /// Channel 1 carries pack data.
    PackData,
    /// Channel 2 carries human-readable progress.
    Progress,
    /// Channel 3 carries a fatal error message.
    Error,
}

impl SideBand {
    pub fn value(&self) -> u8 {
        match self {
            Self::PackData => 1,
            Self::Progress => 2,
            Self::Error => 3,
        }
    }

    pub fn from_value(v: u8) -> Result<Self, GitError> {
        match v {
            1 => Ok(Self::PackData),
            2 => Ok(Self::Progress),
            3 => Ok(Self::Error),
            other => Err(GitError::MalformedPktLine(format!(
                "side-band channel {other}"
            ))),
        }
    }
}

/// Advertised ref line: name, target, and the peeled target for annotated
/// tags.
#[derive(Clone, Debug)]
pub struct AdvertisedRef {
    pub name: String,
    pub hash: ObjectHash,
    pub peeled: Option<ObjectHash>,
}

/// Status of one ref command inside a push.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandStatus {
    Pending,
    Ok,
    Rejected(String),
}

/// One `<old> <new> <ref>` command of a receive-pack request.
#[derive(Debug, Clone)]
pub struct RefCommand {
    pub old_hash: ObjectHash,
    pub new_hash: ObjectHash,
    pub ref_name: String,
    pub status: CommandStatus,
}

impl RefCommand {
    pub fn new(old_hash: ObjectHash, new_hash: ObjectHash, ref_name: String) -> Self {
        Self {
            old_hash,
            new_hash,
            ref_name,
            status: CommandStatus::Pending,
        }
    }

    pub fn is_create(&self) -> bool {
        self.old_hash.is_zero()
    }

    pub fn is_delete(&self) -> bool {
        self.new_hash.is_zero()
    }

    pub fn reject(&mut self, reason: impl Into<String>) {
        self.status = CommandStatus::Rejected(reason.into());
    }

    pub fn succeed(&mut self) {
        self.status = CommandStatus::Ok;
    }

    /// Report-status line for this command.
    pub fn status_line(&self) -> String {
        match &self.status {
            CommandStatus::Ok => format!("ok {}", self.ref_name),
            CommandStatus::Rejected(reason) => format!("ng {} {}", self.ref_name, reason),
            CommandStatus::Pending => format!("ng {} not processed", self.ref_name),
        }
    }
}

/// Pluggable per-request rate limiting hook. Its decision is authoritative.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, principal: &str, repo: &str) -> Result<(), ProtocolError>;
}

/// Default limiter: everything passes.
pub struct AllowAll;

#[async_trait::async_trait]
impl RateLimiter for AllowAll {
    async fn check(&self, _principal: &str, _repo: &str) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Agent string advertised and sent by this implementation.
pub const AGENT: &str = concat!("git-tablet/", env!("CARGO_PKG_VERSION"));

/// Capabilities advertised on upload-pack advertisements.
pub fn upload_caps() -> String {
    format!(
        "multi_ack_detailed side-band-64k thin-pack ofs-delta no-progress shallow agent={AGENT}"
    )
}

/// Capabilities advertised on receive-pack advertisements.
pub fn receive_caps() -> String {
    format!("report-status delete-refs atomic ofs-delta side-band-64k push-options agent={AGENT}")
}
