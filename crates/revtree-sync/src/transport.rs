//! Transport abstraction for the replication protocol.
//!
//! The transport layer handles message serialization and delivery.
//! Implementations may use WebSockets, HTTP, or any other request/response
//! channel. [`RemoteSource`] turns any transport into a [`RevisionSource`];
//! [`serve_request`] is the matching server-side dispatch.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use revtree_core::{Document, ResumeCursor, RevisionId, RevisionRange, RevisionTree, SnapshotHandle};

use crate::error::{Result, SyncError};
use crate::messages::{
    DocumentRequest, DocumentResponse, RangeQuery, ReplicationRequest, ReplicationResponse,
    RevisionPage,
};
use crate::source::RevisionSource;

/// Request/response channel to a replication source.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a request and wait for its response.
    ///
    /// Errors reported by the peer arrive as [`ReplicationResponse::Error`];
    /// `Err` is reserved for delivery failures.
    async fn call(&self, request: ReplicationRequest) -> Result<ReplicationResponse>;
}

/// A [`RevisionSource`] on the far side of a transport.
pub struct RemoteSource<T> {
    transport: T,
}

impl<T: Transport> RemoteSource<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    async fn request(&self, request: ReplicationRequest) -> Result<ReplicationResponse> {
        request
            .validate_limits()
            .map_err(|e| SyncError::InvalidMessage(e.into()))?;
        let response = self.transport.call(request).await?;
        if let ReplicationResponse::Error(frame) = response {
            return Err(SyncError::from_frame(frame));
        }
        response
            .validate_limits()
            .map_err(|e| SyncError::InvalidMessage(e.into()))?;
        Ok(response)
    }
}

fn unexpected(expected: &str, got: &ReplicationResponse) -> SyncError {
    let kind = match got {
        ReplicationResponse::Snapshot(_) => "snapshot",
        ReplicationResponse::Closed => "closed",
        ReplicationResponse::Tree(_) => "tree",
        ReplicationResponse::Ranges(_) => "ranges",
        ReplicationResponse::Documents(_) => "documents",
        ReplicationResponse::Error(_) => "error",
    };
    SyncError::InvalidMessage(format!("expected {expected} response, got {kind}"))
}

#[async_trait]
impl<T: Transport> RevisionSource for RemoteSource<T> {
    async fn open_snapshot(&self, collection: &str, ttl: Duration) -> Result<SnapshotHandle> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let request = ReplicationRequest::OpenSnapshot {
            collection: collection.to_string(),
            ttl_ms,
        };
        match self.request(request).await? {
            ReplicationResponse::Snapshot(handle) if handle.collection == collection => Ok(handle),
            other => Err(unexpected("snapshot", &other)),
        }
    }

    async fn close_snapshot(&self, snapshot: &SnapshotHandle) -> Result<()> {
        let request = ReplicationRequest::CloseSnapshot {
            snapshot: snapshot.clone(),
        };
        match self.request(request).await? {
            ReplicationResponse::Closed => Ok(()),
            other => Err(unexpected("closed", &other)),
        }
    }

    async fn revision_tree(&self, snapshot: &SnapshotHandle) -> Result<RevisionTree> {
        let request = ReplicationRequest::RevisionTree {
            snapshot: snapshot.clone(),
        };
        match self.request(request).await? {
            ReplicationResponse::Tree(tree) => {
                tree.validate()
                    .map_err(|e| SyncError::InvalidMessage(format!("tree: {e}")))?;
                Ok(tree)
            }
            other => Err(unexpected("tree", &other)),
        }
    }

    async fn revisions_by_ranges(
        &self,
        snapshot: &SnapshotHandle,
        ranges: &[RevisionRange],
        resume: ResumeCursor,
    ) -> Result<RevisionPage> {
        let request = ReplicationRequest::Ranges {
            snapshot: snapshot.clone(),
            query: RangeQuery::new(ranges.to_vec(), resume),
        };
        match self.request(request).await? {
            ReplicationResponse::Ranges(response) => {
                if response.ranges.len() != ranges.len() {
                    return Err(SyncError::InvalidMessage(format!(
                        "{} ranges answered for {} asked",
                        response.ranges.len(),
                        ranges.len()
                    )));
                }
                Ok(response.into())
            }
            other => Err(unexpected("ranges", &other)),
        }
    }

    async fn revision_documents(
        &self,
        snapshot: &SnapshotHandle,
        revs: &[RevisionId],
    ) -> Result<Vec<Document>> {
        let request = ReplicationRequest::Documents {
            snapshot: snapshot.clone(),
            request: DocumentRequest {
                revisions: revs.to_vec(),
            },
        };
        match self.request(request).await? {
            ReplicationResponse::Documents(response) => Ok(response.documents),
            other => Err(unexpected("documents", &other)),
        }
    }
}

/// Answer one request from `source`. Failures become error frames.
pub async fn serve_request<R>(source: &R, request: ReplicationRequest) -> ReplicationResponse
where
    R: RevisionSource + ?Sized,
{
    match dispatch(source, request).await {
        Ok(response) => response,
        Err(e) => {
            if matches!(e, SyncError::StoreError(_) | SyncError::Internal(_)) {
                warn!(error = %e, "replication request failed");
            }
            ReplicationResponse::Error(e.to_frame())
        }
    }
}

async fn dispatch<R>(source: &R, request: ReplicationRequest) -> Result<ReplicationResponse>
where
    R: RevisionSource + ?Sized,
{
    request
        .validate_limits()
        .map_err(|e| SyncError::InvalidMessage(e.into()))?;
    Ok(match request {
        ReplicationRequest::OpenSnapshot { collection, ttl_ms } => {
            let ttl = Duration::from_millis(ttl_ms);
            ReplicationResponse::Snapshot(source.open_snapshot(&collection, ttl).await?)
        }
        ReplicationRequest::CloseSnapshot { snapshot } => {
            source.close_snapshot(&snapshot).await?;
            ReplicationResponse::Closed
        }
        ReplicationRequest::RevisionTree { snapshot } => {
            ReplicationResponse::Tree(source.revision_tree(&snapshot).await?)
        }
        ReplicationRequest::Ranges { snapshot, query } => {
            let page = source
                .revisions_by_ranges(&snapshot, &query.ranges, query.cursor())
                .await?;
            ReplicationResponse::Ranges(page.into())
        }
        ReplicationRequest::Documents { snapshot, request } => {
            let documents = source
                .revision_documents(&snapshot, &request.revisions)
                .await?;
            ReplicationResponse::Documents(DocumentResponse { documents })
        }
    })
}

/// A simple in-memory transport for testing.
///
/// Requests and responses cross a tokio channel as CBOR bytes, so everything
/// the wire codec would reject is rejected here too.
pub mod memory {
    use super::*;
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinHandle;

    use crate::messages::{decode, encode};

    type Envelope = (Bytes, oneshot::Sender<Bytes>);

    /// Client end of an in-memory link to a serving task.
    #[derive(Clone)]
    pub struct MemoryTransport {
        sender: mpsc::Sender<Envelope>,
    }

    impl MemoryTransport {
        /// Spawn a task answering requests from `source`.
        ///
        /// The task stops once every clone of the transport is dropped.
        pub fn serve<R>(source: R) -> (Self, JoinHandle<()>)
        where
            R: RevisionSource + 'static,
        {
            let (sender, mut receiver) = mpsc::channel::<Envelope>(64);
            let source = Arc::new(source);
            let handle = tokio::spawn(async move {
                while let Some((bytes, reply)) = receiver.recv().await {
                    let source = Arc::clone(&source);
                    tokio::spawn(async move {
                        let response = match decode::<ReplicationRequest>(&bytes) {
                            Ok(request) => serve_request(source.as_ref(), request).await,
                            Err(e) => ReplicationResponse::Error(e.to_frame()),
                        };
                        match encode(&response) {
                            Ok(bytes) => {
                                // the caller may have given up
                                let _ = reply.send(bytes);
                            }
                            Err(e) => warn!(error = %e, "failed to encode response"),
                        }
                    });
                }
            });
            (Self { sender }, handle)
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn call(&self, request: ReplicationRequest) -> Result<ReplicationResponse> {
            let bytes = encode(&request)?;
            let (reply, response) = oneshot::channel();
            self.sender
                .send((bytes, reply))
                .await
                .map_err(|_| SyncError::TransportError("server stopped".into()))?;
            let bytes = response
                .await
                .map_err(|_| SyncError::TransportError("no response".into()))?;
            decode(&bytes)
        }
    }
}
