use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid network config: {0}")]
    MalformedConfig(String),

    #[error("unsupported plugin type {0:?}")]
    UnsupportedType(String),

    #[error("no delegates and no cluster default network given")]
    MissingDelegates,

    #[error("delegate {0} has no name")]
    MissingDelegateName(usize),

    #[error("plugin list {0:?} has no plugins")]
    UnsupportedListShape(String),

    #[error("invalid attachment request: {0}")]
    BadAttachmentRequest(String),

    #[error("network definition {0:?} not found")]
    NoSuchNetworkDef(String),

    #[error("failed to find plugin binary {0:?}")]
    NoSuchBinary(String),

    #[error("[{pod}:{name}]: error adding container to network {name:?}: {message}")]
    DelegateAddFailed {
        index: usize,
        name: String,
        pod: String,
        message: String,
    },

    #[error("[{pod}:{name}]: error deleting container from network {name:?}: {message}")]
    DelegateDelFailed {
        index: usize,
        name: String,
        pod: String,
        message: String,
    },

    #[error("[{pod}:{name}]: error checking container in network {name:?}: {message}")]
    DelegateCheckFailed {
        index: usize,
        name: String,
        pod: String,
        message: String,
    },

    #[error("CHECK is not supported at config version {0:?}")]
    CheckNotSupported(String),

    #[error("unsupported CNI version {0:?}")]
    UnsupportedVersion(String),

    #[error("cannot convert result from version {from:?} to {to:?}")]
    VersionMismatch { from: String, to: String },

    #[error("transient workload lookup failure: {0}")]
    WorkloadLookupTransient(String),

    #[error("workload lookup failed: {0}")]
    WorkloadLookupTerminal(String),

    #[error("failed to persist scratch cache: {0}")]
    CachePersist(String),

    #[error("failed to decode delegate result: {0}")]
    DecodeFailure(String),

    #[error("invalid CNI environment: {0}")]
    InvalidEnv(String),

    #[error("failed to execute delegate: {0}")]
    Exec(String),

    #[error("{msg}")]
    Plugin { code: u32, msg: String, details: String },

    #[error("delegate {0:?} timed out")]
    Deadline(String),

    #[error("readiness indicator file {0:?} is not present")]
    NotReady(String),

    #[error("kubernetes client: {0}")]
    Kube(String),
}

impl Error {
    /// Stable numeric code carried in the on-wire CNI error object.
    /// 1..=11 are the well-known CNI codes; 100+ are plugin-specific.
    pub fn code(&self) -> u32 {
        match self {
            Error::UnsupportedVersion(_) | Error::VersionMismatch { .. } => 1,
            Error::CheckNotSupported(_) => 2,
            Error::InvalidEnv(_) => 4,
            Error::CachePersist(_) => 5,
            Error::DecodeFailure(_) => 6,
            Error::MalformedConfig(_)
            | Error::UnsupportedType(_)
            | Error::MissingDelegates
            | Error::MissingDelegateName(_)
            | Error::UnsupportedListShape(_)
            | Error::BadAttachmentRequest(_) => 7,
            Error::WorkloadLookupTransient(_) | Error::NotReady(_) => 11,
            Error::NoSuchNetworkDef(_) => 100,
            Error::NoSuchBinary(_) => 101,
            Error::DelegateAddFailed { .. } => 102,
            Error::DelegateDelFailed { .. } => 103,
            Error::DelegateCheckFailed { .. } => 104,
            Error::WorkloadLookupTerminal(_) => 105,
            Error::Exec(_) => 106,
            Error::Kube(_) => 107,
            Error::Deadline(_) => 110,
            Error::Plugin { code, .. } => *code,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WorkloadLookupTransient(_))
    }

    pub fn to_cni_error(&self, cni_version: &str) -> CniErrorPayload {
        let details = match self {
            Error::Plugin { details, .. } => details.clone(),
            _ => String::new(),
        };
        CniErrorPayload {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details,
        }
    }
}

/// The CNI error object exchanged over stdout, both the one this plugin
/// emits and the one parsed back from a failed delegate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniErrorPayload {
    #[serde(default)]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}
