//! Wire messages exchanged with a points store.
//!
//! Two interactions exist:
//! - snapshot: `SnapshotRequest` answered by one `SnapshotResponse`
//! - feed: one `FeedRequest` opens a stream of `FeedFrame`s
//!
//! Every message is a self-contained CBOR item.

use crate::error::{ProtocolError, ProtocolResult};
use crate::event::{ChangeEvent, Snapshot};
use crate::types::{EntityKey, KeyFilter, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

fn encode_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| ProtocolError::encoding_failed(e.to_string()))?;
    Ok(buf)
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::decoding_failed(e.to_string()))
}

fn check_version(remote: u16) -> ProtocolResult<()> {
    if remote != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote,
        });
    }
    Ok(())
}

/// Discriminant for wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Snapshot request.
    SnapshotRequest,
    /// Snapshot response.
    SnapshotResponse,
    /// Feed request.
    FeedRequest,
    /// Feed frame.
    FeedFrame,
}

impl MessageKind {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            MessageKind::SnapshotRequest => 1,
            MessageKind::SnapshotResponse => 2,
            MessageKind::FeedRequest => 3,
            MessageKind::FeedFrame => 4,
        }
    }

    /// Converts from a type code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageKind::SnapshotRequest),
            2 => Some(MessageKind::SnapshotResponse),
            3 => Some(MessageKind::FeedRequest),
            4 => Some(MessageKind::FeedFrame),
            _ => None,
        }
    }

    /// Endpoint path a request of this kind is sent to.
    ///
    /// Only requests have endpoints; responses and frames return `None`.
    pub fn endpoint(&self) -> Option<&'static str> {
        match self {
            MessageKind::SnapshotRequest => Some("/points/snapshot"),
            MessageKind::FeedRequest => Some("/points/feed"),
            MessageKind::SnapshotResponse | MessageKind::FeedFrame => None,
        }
    }

    /// Resolves an endpoint path back to its request kind.
    pub fn from_endpoint(path: &str) -> Option<Self> {
        match path {
            "/points/snapshot" => Some(MessageKind::SnapshotRequest),
            "/points/feed" => Some(MessageKind::FeedRequest),
            _ => None,
        }
    }
}

/// Request for the current value of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Protocol version.
    pub protocol_version: u16,
    /// Key to read.
    pub entity_key: EntityKey,
    /// Bearer credential, when the store requires one.
    pub token: Option<Vec<u8>>,
}

impl SnapshotRequest {
    /// Creates a new snapshot request.
    pub fn new(entity_key: impl Into<EntityKey>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            entity_key: entity_key.into(),
            token: None,
        }
    }

    /// Attaches a bearer credential.
    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = Some(token);
        self
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR, rejecting foreign protocol versions and empty keys.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let request: Self = decode_cbor(bytes)?;
        check_version(request.protocol_version)?;
        if request.entity_key.is_empty() {
            return Err(ProtocolError::invalid_message("empty entity key"));
        }
        Ok(request)
    }
}

/// Answer to a `SnapshotRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    /// Key that was read.
    pub entity_key: EntityKey,
    /// The value, or `None` when the store holds no record for the key.
    pub snapshot: Option<Snapshot>,
    /// Error message if the read failed.
    pub error: Option<String>,
    /// Whether a failed read may succeed if retried.
    pub retryable: bool,
}

impl SnapshotResponse {
    /// Creates a response carrying a value.
    pub fn found(entity_key: impl Into<EntityKey>, snapshot: Snapshot) -> Self {
        Self {
            entity_key: entity_key.into(),
            snapshot: Some(snapshot),
            error: None,
            retryable: false,
        }
    }

    /// Creates a response for a key with no record.
    pub fn not_found(entity_key: impl Into<EntityKey>) -> Self {
        Self {
            entity_key: entity_key.into(),
            snapshot: None,
            error: None,
            retryable: false,
        }
    }

    /// Creates a failed response the client may retry.
    pub fn error(entity_key: impl Into<EntityKey>, message: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            snapshot: None,
            error: Some(message.into()),
            retryable: true,
        }
    }

    /// Creates a failed response that retrying will not fix.
    pub fn rejected(entity_key: impl Into<EntityKey>, message: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            snapshot: None,
            error: Some(message.into()),
            retryable: false,
        }
    }

    /// Returns true if the read succeeded (found or not found).
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

/// Request to open a change feed for a set of keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    /// Protocol version.
    pub protocol_version: u16,
    /// Keys to receive events for.
    pub filter: KeyFilter,
    /// Bearer credential, when the store requires one.
    pub token: Option<Vec<u8>>,
}

impl FeedRequest {
    /// Creates a new feed request.
    pub fn new(filter: KeyFilter) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            filter,
            token: None,
        }
    }

    /// Attaches a bearer credential.
    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = Some(token);
        self
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR, rejecting foreign protocol versions.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let request: Self = decode_cbor(bytes)?;
        check_version(request.protocol_version)?;
        Ok(request)
    }
}

/// One frame on an open change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedFrame {
    /// A counter changed.
    Event(ChangeEvent),
    /// Keep-alive carrying the server clock.
    Heartbeat(Timestamp),
    /// The server is about to close the feed.
    Closing {
        /// Why the feed is closing.
        reason: String,
    },
}

impl FeedFrame {
    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}
