//! Document: an opaque key/value record identified by its revision.
//!
//! A document never changes once written. An update produces a new document
//! with the same key and a fresh revision; the old revision simply stops
//! being live.

use ciborium::value::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::canonical::{canonical_value_bytes, document_digest};
use crate::digest::Digest;
use crate::error::{CoreError, Result};
use crate::types::RevisionId;

/// A document revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// User-visible key; unique among the live documents of a collection.
    pub key: String,
    /// Revision of this version of the document.
    pub rev: RevisionId,
    /// Structured content, always a CBOR map.
    pub body: Value,
}

impl Document {
    /// Create a document, rejecting non-map bodies and the reserved revisions.
    pub fn new(key: impl Into<String>, rev: RevisionId, body: Value) -> Result<Self> {
        let doc = Self {
            key: key.into(),
            rev,
            body,
        };
        doc.validate()?;
        Ok(doc)
    }

    /// Check a document that did not come through [`Document::new`], such as
    /// one decoded off the wire.
    pub fn validate(&self) -> Result<()> {
        if self.rev.is_zero() || self.rev == RevisionId::MAX {
            return Err(CoreError::InvalidDocument(format!(
                "revision {} is reserved",
                self.rev
            )));
        }
        ensure_map(&self.body)
    }

    /// Build a document from any serializable record.
    pub fn from_record<T: Serialize + ?Sized>(
        key: impl Into<String>,
        rev: RevisionId,
        record: &T,
    ) -> Result<Self> {
        Self::new(key, rev, body_from_record(record)?)
    }

    /// Decode the body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        self.body
            .deserialized()
            .map_err(|e| CoreError::DecodingError(e.to_string()))
    }

    /// Canonical CBOR encoding of the body.
    pub fn canonical_body(&self) -> Result<Vec<u8>> {
        canonical_value_bytes(&self.body)
    }

    /// Digest of this revision, as summarised in revision trees.
    pub fn digest(&self) -> Result<Digest> {
        document_digest(self.rev, &self.key, &self.body)
    }

    /// Look up a top-level text-keyed field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        match &self.body {
            Value::Map(entries) => entries
                .iter()
                .find(|(k, _)| matches!(k, Value::Text(t) if t == field))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Convert a serializable record into a document body.
pub fn body_from_record<T: Serialize + ?Sized>(record: &T) -> Result<Value> {
    let body = Value::serialized(record).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    ensure_map(&body)?;
    Ok(body)
}

/// Decode a body previously stored in canonical form.
pub fn body_from_canonical(bytes: &[u8]) -> Result<Value> {
    let body: Value =
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))?;
    ensure_map(&body)?;
    Ok(body)
}

fn ensure_map(body: &Value) -> Result<()> {
    match body {
        Value::Map(_) => Ok(()),
        _ => Err(CoreError::InvalidDocument("body must be a map".into())),
    }
}
