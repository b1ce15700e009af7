//! Identifier newtypes.

use serde::{Deserialize, Serialize};

const MAX_PIPELINE_NAME_LEN: usize = 64;

// ---------------------------------------------------------------------------
// PipelineName
// ---------------------------------------------------------------------------

/// Name of a pipeline, also used as its working directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineName(String);

impl PipelineName {
    /// Create a pipeline name without validating it.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the name is usable as a directory name.
    ///
    /// # Errors
    ///
    /// Returns a human readable reason when the name is empty, too long or
    /// contains path components.
    pub fn validate(&self) -> Result<(), String> {
        let name = self.0.as_str();
        if name.trim().is_empty() {
            return Err("name must not be empty".into());
        }
        if name.chars().count() > MAX_PIPELINE_NAME_LEN {
            return Err(format!("name must be at most {MAX_PIPELINE_NAME_LEN} characters"));
        }
        if name.contains('/') || name.contains('\\') || name == "." || name.contains("..") {
            return Err("name must not contain path separators or '..'".into());
        }
        Ok(())
    }
}

impl std::fmt::Display for PipelineName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for PipelineName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// LoadId
// ---------------------------------------------------------------------------

/// Identifier of a load package: `<unix seconds>.<microseconds>`.
///
/// Ids minted from strictly increasing microsecond stamps sort the same way
/// lexically and chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoadId(String);

impl LoadId {
    /// Wrap an existing load id string (e.g. a package directory name).
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a load id from microseconds since the unix epoch.
    #[must_use]
    pub fn from_micros(micros: u64) -> Self {
        Self(format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000))
    }

    /// Microseconds since the epoch, if the id was minted by [`LoadId::from_micros`].
    #[must_use]
    pub fn as_micros(&self) -> Option<u64> {
        let (secs, micros) = self.0.split_once('.')?;
        let secs: u64 = secs.parse().ok()?;
        let micros: u64 = micros.parse().ok()?;
        secs.checked_mul(1_000_000)?.checked_add(micros)
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LoadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_name_validation() {
        assert!(PipelineName::new("chess_pipeline").validate().is_ok());
        assert!(PipelineName::new("").validate().is_err());
        assert!(PipelineName::new("  ").validate().is_err());
        assert!(PipelineName::new("a/b").validate().is_err());
        assert!(PipelineName::new("..").validate().is_err());
        assert!(PipelineName::new("x".repeat(65)).validate().is_err());
    }

    #[test]
    fn load_id_micros_roundtrip_and_order() {
        let a = LoadId::from_micros(1_700_000_000_000_001);
        let b = LoadId::from_micros(1_700_000_000_100_000);
        assert_eq!(a.as_str(), "1700000000.000001");
        assert_eq!(a.as_micros(), Some(1_700_000_000_000_001));
        assert!(a < b);
    }

    #[test]
    fn foreign_load_id_has_no_micros() {
        assert_eq!(LoadId::new("abc").as_micros(), None);
    }
}
