//! Replication message types.
//!
//! These messages are exchanged between a follower and a source. Field names
//! follow the JSON shape (`camelCase`); binary transports carry them as CBOR.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use revtree_core::{
    Document, ResumeCursor, RevisionId, RevisionRange, RevisionTree, Revisions, SnapshotHandle,
};

use crate::error::{ErrorKind, Result, SyncError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message size limits.
pub mod limits {
    /// Max ranges in one range query.
    pub const MAX_RANGES_PER_QUERY: usize = 4096;
    /// Max revisions across all ranges of one page.
    pub const MAX_REVISIONS_PER_PAGE: usize = 50_000;
    /// Max revisions in one document request.
    pub const MAX_DOCUMENTS_PER_REQUEST: usize = 5_000;
    /// Max collection name length.
    pub const MAX_COLLECTION_NAME: usize = 256;
}

/// A page of resolved revisions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RevisionPage {
    /// One entry per requested range, each ascending.
    pub ranges: Vec<Revisions>,
    /// Where to continue, or `None` once every range is exhausted.
    pub next: Option<ResumeCursor>,
}

impl RevisionPage {
    /// Total revisions across all ranges.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.iter().all(Vec::is_empty)
    }

    pub fn is_terminal(&self) -> bool {
        self.next.is_none()
    }

    /// The last revision in the page.
    pub fn last(&self) -> Option<RevisionId> {
        self.ranges.iter().rev().find_map(|r| r.last().copied())
    }
}

/// Range query: `{ranges: [[min, max], ...], resume}`.
///
/// `resume == 0` means start from the beginning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeQuery {
    pub ranges: Vec<RevisionRange>,
    pub resume: RevisionId,
}

impl RangeQuery {
    pub fn new(ranges: Vec<RevisionRange>, cursor: ResumeCursor) -> Self {
        Self {
            ranges,
            resume: cursor.to_wire(),
        }
    }

    pub fn cursor(&self) -> ResumeCursor {
        ResumeCursor::from_wire(self.resume)
    }
}

/// Range response: `{ranges: [[rev, ...], ...], resume, pending?}`.
///
/// `resume == 0` is terminal unless `pending` is set, which marks a page that
/// was not ready yet at the start cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeResponse {
    pub ranges: Vec<Revisions>,
    pub resume: RevisionId,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl From<RevisionPage> for RangeResponse {
    fn from(page: RevisionPage) -> Self {
        let (resume, pending) = match page.next {
            None => (RevisionId::ZERO, false),
            Some(ResumeCursor::Start) => (RevisionId::ZERO, true),
            Some(ResumeCursor::After(rev)) => (rev, false),
        };
        Self {
            ranges: page.ranges,
            resume,
            pending,
        }
    }
}

impl From<RangeResponse> for RevisionPage {
    fn from(response: RangeResponse) -> Self {
        let next = if response.resume.is_zero() {
            response.pending.then_some(ResumeCursor::Start)
        } else {
            Some(ResumeCursor::After(response.resume))
        };
        Self {
            ranges: response.ranges,
            next,
        }
    }
}

/// Document fetch: `{revisions: [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub revisions: Revisions,
}

/// Document fetch response: `{documents: [...]}`, positionally aligned with
/// the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentResponse {
    pub documents: Vec<Document>,
}

/// Error frame: `{code, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: ErrorKind,
    pub message: String,
    /// The offending revision, for `UnknownRevision`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<RevisionId>,
}

/// Requests a follower sends to a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicationRequest {
    /// Lease a snapshot of a collection.
    OpenSnapshot {
        collection: String,
        #[serde(rename = "ttlMs")]
        ttl_ms: u64,
    },
    /// Release a lease.
    CloseSnapshot { snapshot: SnapshotHandle },
    /// Fetch the revision tree of a snapshot.
    RevisionTree { snapshot: SnapshotHandle },
    /// Resolve ranges into revisions.
    Ranges {
        snapshot: SnapshotHandle,
        query: RangeQuery,
    },
    /// Materialize documents.
    Documents {
        snapshot: SnapshotHandle,
        request: DocumentRequest,
    },
}

impl ReplicationRequest {
    /// Check if this request respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            ReplicationRequest::OpenSnapshot { collection, .. } => {
                if collection.len() > limits::MAX_COLLECTION_NAME {
                    return Err("collection name too long");
                }
            }
            ReplicationRequest::Ranges { query, .. } => {
                if query.ranges.len() > limits::MAX_RANGES_PER_QUERY {
                    return Err("too many ranges");
                }
            }
            ReplicationRequest::Documents { request, .. } => {
                if request.revisions.len() > limits::MAX_DOCUMENTS_PER_REQUEST {
                    return Err("too many revisions requested");
                }
            }
            ReplicationRequest::CloseSnapshot { .. } | ReplicationRequest::RevisionTree { .. } => {}
        }
        Ok(())
    }
}

/// Responses a source sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplicationResponse {
    Snapshot(SnapshotHandle),
    Closed,
    Tree(RevisionTree),
    Ranges(RangeResponse),
    Documents(DocumentResponse),
    Error(ErrorFrame),
}

impl ReplicationResponse {
    /// Check if this response respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            ReplicationResponse::Ranges(page) => {
                let total: usize = page.ranges.iter().map(Vec::len).sum();
                if total > limits::MAX_REVISIONS_PER_PAGE {
                    return Err("too many revisions in page");
                }
            }
            ReplicationResponse::Documents(response) => {
                if response.documents.len() > limits::MAX_DOCUMENTS_PER_REQUEST {
                    return Err("too many documents");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Encode a message as CBOR.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| SyncError::InvalidMessage(format!("encode: {e}")))?;
    Ok(Bytes::from(buf))
}

/// Decode a CBOR message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::InvalidMessage(format!("decode: {e}")))
}
