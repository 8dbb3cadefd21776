//! Receipt verification.
//!
//! Two implementations, chosen by configuration:
//! - `HmacReceiptVerifier`: HMAC-SHA256 over the receipt's signed payload.
//! - `StructuralReceiptVerifier`: only checks that an integrity block exists
//!   and the status is accepted. It proves nothing about who wrote the
//!   receipt and is a strictly weaker guarantee.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::warn;

use super::CleanupError;
use super::receipt::UploadReceipt;

type HmacSha256 = Hmac<Sha256>;

pub trait ReceiptVerifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn verify(&self, receipt: &UploadReceipt) -> bool;
}

pub struct HmacReceiptVerifier {
    key: Vec<u8>,
}

impl HmacReceiptVerifier {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(&self.key).ok()
    }

    /// Hex signature a publisher holding the same key would write into
    /// `integrity.hmac_sha256`.
    pub fn sign(&self, receipt: &UploadReceipt) -> String {
        let Some(mut mac) = self.mac() else {
            return String::new();
        };
        mac.update(&receipt.signed_payload());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl ReceiptVerifier for HmacReceiptVerifier {
    fn name(&self) -> &'static str {
        "hmac"
    }

    fn verify(&self, receipt: &UploadReceipt) -> bool {
        let Some(sig_hex) = receipt.hmac_sha256.as_deref() else {
            return false;
        };
        let Ok(sig) = hex::decode(sig_hex.trim()) else {
            return false;
        };
        let Some(mut mac) = self.mac() else {
            return false;
        };
        mac.update(&receipt.signed_payload());
        // constant-time
        mac.verify_slice(&sig).is_ok()
    }
}

/// Degraded verifier. Must be selected explicitly.
#[derive(Debug, Default)]
pub struct StructuralReceiptVerifier;

impl ReceiptVerifier for StructuralReceiptVerifier {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn verify(&self, receipt: &UploadReceipt) -> bool {
        warn!("receipt checked structurally only; signature NOT verified");
        receipt.has_integrity_block() && receipt.status_accepted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierKind {
    #[default]
    Hmac,
    Structural,
}

/// Build the configured verifier. `hmac` without a key is a configuration
/// error; there is no implicit fallback to `structural`.
pub fn build_verifier(
    kind: VerifierKind,
    hmac_key: Option<&str>,
) -> Result<Box<dyn ReceiptVerifier>, CleanupError> {
    match kind {
        VerifierKind::Hmac => {
            let key = hmac_key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| CleanupError::Config("hmac verifier selected but no key configured".to_string()))?;
            Ok(Box::new(HmacReceiptVerifier::new(key.as_bytes())))
        }
        VerifierKind::Structural => {
            warn!("structural receipt verifier selected: receipts are not cryptographically verified");
            Ok(Box::new(StructuralReceiptVerifier))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signed_receipt(verifier: &HmacReceiptVerifier, status: &str) -> UploadReceipt {
        let mut raw = json!({
            "status": status,
            "uploaded_at_utc": "2024-03-01T10:00:00Z",
            "video_id": "yt-1",
        });
        let sig = verifier.sign(&UploadReceipt::from_value(raw.clone()));
        raw["integrity"] = json!({ "hmac_sha256": sig });
        UploadReceipt::from_value(raw)
    }

    #[test]
    fn hmac_accepts_own_signature() {
        let verifier = HmacReceiptVerifier::new("secret");
        assert!(verifier.verify(&signed_receipt(&verifier, "UPLOADED")));
    }

    #[test]
    fn hmac_rejects_tampering_and_wrong_key() {
        let verifier = HmacReceiptVerifier::new("secret");
        let receipt = signed_receipt(&verifier, "UPLOADED");

        let mut tampered = receipt.raw().clone();
        tampered["video_id"] = json!("yt-2");
        assert!(!verifier.verify(&UploadReceipt::from_value(tampered)));

        assert!(!HmacReceiptVerifier::new("other").verify(&receipt));
    }

    #[test]
    fn hmac_rejects_missing_or_garbage_signature() {
        let verifier = HmacReceiptVerifier::new("secret");
        assert!(!verifier.verify(&UploadReceipt::from_value(json!({ "status": "UPLOADED" }))));
        assert!(!verifier.verify(&UploadReceipt::from_value(json!({
            "status": "UPLOADED",
            "integrity": { "hmac_sha256": "not-hex" }
        }))));
    }

    #[test]
    fn structural_only_checks_shape() {
        let forged = UploadReceipt::from_value(json!({
            "status": "VERIFIED",
            "integrity": { "hmac_sha256": "00" }
        }));
        assert!(StructuralReceiptVerifier.verify(&forged));
        assert!(!HmacReceiptVerifier::new("secret").verify(&forged));
    }

    #[test]
    fn hmac_without_key_is_a_config_error() {
        assert!(matches!(
            build_verifier(VerifierKind::Hmac, None),
            Err(CleanupError::Config(_))
        ));
        assert!(matches!(
            build_verifier(VerifierKind::Hmac, Some("")),
            Err(CleanupError::Config(_))
        ));
        assert_eq!(
            build_verifier(VerifierKind::Structural, None).unwrap().name(),
            "structural"
        );
        assert_eq!(build_verifier(VerifierKind::Hmac, Some("k")).unwrap().name(), "hmac");
    }
}
