//! Pipeline state document.
//!
//! Three namespaces: `local` (never leaves the machine), per-source values and
//! per-resource values nested under their source. Only the synced part takes
//! part in the version hash, so local changes never bump the version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// State of one source: its own keys plus nested resource states.
///
/// `resources` is a reserved key inside a source namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    #[serde(flatten)]
    pub values: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, Map<String, Value>>,
}

/// Versioned pipeline state document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub version_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_schema_name: Option<String>,
    #[serde(default)]
    pub schema_names: Vec<String>,
    #[serde(default)]
    pub local: Map<String, Value>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceState>,
}

/// The part of [`PipelineState`] written to the destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncedState {
    pub version: u64,
    pub version_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_schema_name: Option<String>,
    #[serde(default)]
    pub schema_names: Vec<String>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceState>,
}

impl PipelineState {
    /// Hash over the synced namespaces only.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let doc = serde_json::json!({
            "default_schema_name": self.default_schema_name,
            "schema_names": self.schema_names,
            "sources": self.sources,
        });
        crate::sha256_hex(&serde_json::to_vec(&doc).unwrap_or_default())
    }

    /// Increment the version if the synced content changed since the last bump.
    pub fn bump_version(&mut self) -> bool {
        let hash = self.compute_hash();
        if hash == self.version_hash {
            return false;
        }
        self.version += 1;
        self.version_hash = hash;
        true
    }

    #[must_use]
    pub fn source(&self, name: &str) -> Option<&SourceState> {
        self.sources.get(name)
    }

    /// Source namespace, created on first access.
    pub fn source_mut(&mut self, name: &str) -> &mut SourceState {
        self.sources.entry(name.to_string()).or_default()
    }

    /// Resource namespace nested under its source, created on first access.
    pub fn resource_mut(&mut self, source: &str, resource: &str) -> &mut Map<String, Value> {
        self.source_mut(source)
            .resources
            .entry(resource.to_string())
            .or_default()
    }

    #[must_use]
    pub fn resource(&self, source: &str, resource: &str) -> Option<&Map<String, Value>> {
        self.sources.get(source)?.resources.get(resource)
    }

    /// Register a schema name; the first one becomes the default.
    pub fn add_schema_name(&mut self, name: &str) {
        if !self.schema_names.iter().any(|n| n == name) {
            self.schema_names.push(name.to_string());
        }
        if self.default_schema_name.is_none() {
            self.default_schema_name = Some(name.to_string());
        }
    }

    /// Copy of the synced namespaces.
    #[must_use]
    pub fn to_synced(&self) -> SyncedState {
        SyncedState {
            version: self.version,
            version_hash: self.version_hash.clone(),
            default_schema_name: self.default_schema_name.clone(),
            schema_names: self.schema_names.clone(),
            sources: self.sources.clone(),
        }
    }

    /// Replace the synced namespaces with `remote`, keeping `local`.
    pub fn adopt(&mut self, remote: SyncedState) {
        self.version = remote.version;
        self.version_hash = remote.version_hash;
        self.default_schema_name = remote.default_schema_name;
        self.schema_names = remote.schema_names;
        self.sources = remote.sources;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_changes_do_not_bump_version() {
        let mut state = PipelineState::default();
        state.bump_version();
        let v = state.version;

        state.local.insert("last_run".into(), json!("today"));
        assert!(!state.bump_version());
        assert_eq!(state.version, v);

        state
            .resource_mut("chess", "players")
            .insert("cursor".into(), json!(10));
        assert!(state.bump_version());
        assert_eq!(state.version, v + 1);
    }

    #[test]
    fn source_document_shape() {
        let mut state = PipelineState::default();
        state
            .source_mut("airtable")
            .values
            .insert("token_used".into(), json!(true));
        state
            .resource_mut("airtable", "🦚Peacock")
            .insert("🦚🦚🦚".into(), json!("🦚"));

        let doc = serde_json::to_value(&state).unwrap();
        assert_eq!(
            doc["sources"]["airtable"],
            json!({"token_used": true, "resources": {"🦚Peacock": {"🦚🦚🦚": "🦚"}}})
        );

        let back: PipelineState = serde_json::from_value(doc).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn adopt_keeps_local() {
        let mut local = PipelineState::default();
        local.local.insert("k".into(), json!(1));
        local.source_mut("old");

        let mut remote = PipelineState::default();
        remote.source_mut("new");
        remote.version = 7;

        local.adopt(remote.to_synced());
        assert_eq!(local.version, 7);
        assert!(local.source("new").is_some());
        assert!(local.source("old").is_none());
        assert_eq!(local.local["k"], json!(1));
    }

    #[test]
    fn first_schema_becomes_default() {
        let mut state = PipelineState::default();
        state.add_schema_name("a");
        state.add_schema_name("b");
        state.add_schema_name("a");
        assert_eq!(state.default_schema_name.as_deref(), Some("a"));
        assert_eq!(state.schema_names, vec!["a", "b"]);
    }
}
