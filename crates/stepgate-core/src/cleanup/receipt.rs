//! Upload receipt written by the external publisher.
//!
//! Nothing in a receipt is trusted until a `ReceiptVerifier` accepts it.

use std::fs;
use std::path::Path;

use serde_json::Value;

use super::CleanupError;

/// Statuses that prove the final asset reached its destination.
pub const ACCEPTED_STATUSES: [&str; 2] = ["UPLOADED", "VERIFIED"];

#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    pub status: String,
    pub uploaded_at_utc: Option<String>,
    pub hmac_sha256: Option<String>,
    /// The full document, kept so the signature can be checked over fields
    /// this crate does not model.
    raw: Value,
}

impl UploadReceipt {
    pub fn from_value(raw: Value) -> Self {
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let uploaded_at_utc = raw
            .get("uploaded_at_utc")
            .and_then(Value::as_str)
            .map(str::to_string);
        let hmac_sha256 = raw
            .get("integrity")
            .and_then(|i| i.get("hmac_sha256"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            status,
            uploaded_at_utc,
            hmac_sha256,
            raw,
        }
    }

    /// `Ok(None)` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, CleanupError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CleanupError::Io {
                    op: "read receipt",
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let raw: Value = serde_json::from_slice(&bytes).map_err(|source| CleanupError::Json {
            what: "receipt",
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(Self::from_value(raw)))
    }

    /// Exact, case-sensitive match against `ACCEPTED_STATUSES`.
    pub fn status_accepted(&self) -> bool {
        ACCEPTED_STATUSES.contains(&self.status.as_str())
    }

    pub fn has_integrity_block(&self) -> bool {
        self.hmac_sha256
            .as_deref()
            .is_some_and(|sig| !sig.trim().is_empty())
    }

    pub fn uploaded_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let raw = self.uploaded_at_utc.as_deref()?;
        chrono::DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc))
    }

    /// Bytes covered by the signature: the receipt without its `integrity`
    /// member, serialized compactly. serde_json's map keeps keys sorted, so
    /// the encoding does not depend on the producer's key order.
    pub fn signed_payload(&self) -> Vec<u8> {
        let mut unsigned = self.raw.clone();
        if let Some(obj) = unsigned.as_object_mut() {
            obj.remove("integrity");
        }
        serde_json::to_vec(&unsigned).unwrap_or_default()
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}
