use serde::Deserialize;
use stepgate_core::cleanup::VerifierKind;

/// Environment configuration, read from `STEPGATE_*` variables (and a
/// `.env` file if present).
#[derive(Debug, Default, Deserialize)]
pub struct CleanupEnv {
    /// `hmac` (default) or `structural`.
    #[serde(default)]
    pub receipt_verifier: VerifierKind,

    /// Shared secret for the HMAC verifier.
    #[serde(default)]
    pub receipt_hmac_key: Option<String>,
}

impl CleanupEnv {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::prefixed("STEPGATE_").from_iter(vars)
    }
}
