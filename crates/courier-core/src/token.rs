use std::fmt;

use uuid::Uuid;

use crate::error::CoreError;

/// Opaque per-call correlation key carried in the `request_id` attribute.
///
/// Tokens produced by [`CorrelationToken::generate`] are random 128-bit UUIDs,
/// so collisions across calls and across cooperating processes are negligible.
/// Tokens read off the wire are accepted verbatim as long as they are not
/// blank; peers are free to use their own formats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Generates a fresh token. Never fails and keeps no state.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accepts a token received from a peer.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidToken);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CorrelationToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
