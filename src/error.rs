use thiserror::Error;

/// Which kind of record a per-record failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Host,
    Job,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Host => write!(f, "host"),
            RecordKind::Job => write!(f, "job"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Missing {kind} {id} referenced by {referrer}")]
    MissingDependency {
        kind: &'static str,
        id: u64,
        referrer: String,
    },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Master returned HTTP status {0}")]
    Status(u16),

    #[error("RPC fault from master: {name}: {message}")]
    Rpc { name: String, message: String },

    #[error("Malformed RPC reply: {0}")]
    Decode(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl TransportError {
    /// Whether another attempt within the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            TransportError::Status(code) => *code >= 500,
            TransportError::Rpc { .. }
            | TransportError::Decode(_)
            | TransportError::Exhausted { .. } => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Cannot deserialize {kind} record {}: {reason}", display_id(.id))]
    Deserialization {
        kind: RecordKind,
        id: Option<u64>,
        reason: String,
    },

    /// A single record's transaction failed; the rest of the response still
    /// applies.
    #[error("Cannot store {kind} record {}: {source}", display_id(.id))]
    RecordStore {
        kind: RecordKind,
        id: Option<u64>,
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShardError {
    /// Recoverable errors are contained: a transport error aborts one tick,
    /// a record error drops one record. Everything else escalates.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ShardError::Transport(_)
                | ShardError::Deserialization { .. }
                | ShardError::RecordStore { .. }
        )
    }
}

fn display_id(id: &Option<u64>) -> String {
    id.map(|i| i.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

pub type Result<T> = std::result::Result<T, ShardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_faults_are_not_retried() {
        let err = TransportError::Rpc {
            name: "ValidationError".to_string(),
            message: "unknown shard".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(TransportError::Status(503).is_retryable());
        assert!(!TransportError::Status(404).is_retryable());
    }

    #[test]
    fn classification() {
        assert!(ShardError::Transport(TransportError::Status(502)).is_recoverable());
        assert!(ShardError::Deserialization {
            kind: RecordKind::Job,
            id: Some(3),
            reason: "missing field `name`".to_string(),
        }
        .is_recoverable());
        assert!(ShardError::RecordStore {
            kind: RecordKind::Host,
            id: Some(2),
            source: StoreError::Io(std::io::Error::other("disk full")),
        }
        .is_recoverable());
        assert!(!ShardError::Store(StoreError::Io(std::io::Error::other("disk full")))
            .is_recoverable());
        assert!(!ShardError::Configuration("no hostname".to_string()).is_recoverable());
        assert!(!ShardError::Internal("boom".to_string()).is_recoverable());
    }

    #[test]
    fn deserialization_message_names_record() {
        let err = ShardError::Deserialization {
            kind: RecordKind::Host,
            id: None,
            reason: "not an object".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot deserialize host record <unknown>: not an object"
        );

        let err = ShardError::RecordStore {
            kind: RecordKind::Job,
            id: Some(12),
            source: StoreError::Io(std::io::Error::other("read-only file system")),
        };
        assert_eq!(
            err.to_string(),
            "Cannot store job record 12: Store I/O error: read-only file system"
        );
    }
}
