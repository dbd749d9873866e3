//! The configuration boundary: a `PipelineManifest` produced by whatever
//! collaborator owns configuration parsing, and the `ConfigSource` trait
//! that abstracts over where it comes from.

use nlink_result::{NexusError, Result};
use serde::Deserialize;

fn default_max_iteration_count() -> u32 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComponentManifest {
    pub component_id: String,
    pub version: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub supports_reentrance: bool,
    pub max_passes: Option<u32>,
    /// Explicit single-pass dependency edges. Empty means "use the
    /// positional placeholder" (component *i* depends on *i-1*); any
    /// non-empty entry anywhere in the manifest switches the whole
    /// pipeline to building its graph from these instead.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionDirection {
    Forward,
    Backward,
    Bidirectional,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionManifest {
    pub src: String,
    pub dst: String,
    pub direction: ConnectionDirection,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "binary".to_string()
}

/// The tree of fields spec.md's configuration source must produce,
/// whatever its on-disk representation.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineManifest {
    pub pipeline_id: String,
    pub description: Option<String>,
    pub input_format: String,
    pub output_format: String,
    #[serde(default)]
    pub allow_partial_processing: bool,
    pub components: Vec<ComponentManifest>,
    #[serde(default)]
    pub connections: Vec<ConnectionManifest>,
    #[serde(default)]
    pub allow_cycles: bool,
    #[serde(default = "default_max_iteration_count")]
    pub max_iteration_count: u32,
}

impl PipelineManifest {
    /// Whether this manifest describes a multi-pass (cyclic-capable)
    /// pipeline: any declared connection, or `allow_cycles`, switches the
    /// engine from the positional single-pass graph to the typed
    /// reentrant one.
    pub fn is_multi_pass(&self) -> bool {
        self.allow_cycles || !self.connections.is_empty()
    }

    /// Rejects the structurally invalid cases the pipeline engine can't
    /// recover from: no components, or a duplicate `component_id`.
    pub fn validate(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(NexusError::InvalidParameter(
                "pipeline manifest declares no components".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for component in &self.components {
            if !seen.insert(component.component_id.as_str()) {
                return Err(NexusError::DuplicateComponent(
                    component.component_id.clone(),
                ));
            }
        }
        Ok(())
    }
}

/// Collaborator interface producing a `PipelineManifest`. Parsing the
/// on-disk representation is out of this crate's scope; this trait is
/// the boundary a host application's config loader must satisfy.
pub trait ConfigSource {
    fn load(&self) -> Result<PipelineManifest>;
}

/// Reference `ConfigSource`: a JSON document already in memory.
pub struct JsonConfigSource {
    document: String,
}

impl JsonConfigSource {
    pub fn from_str(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
        }
    }
}

impl ConfigSource for JsonConfigSource {
    fn load(&self) -> Result<PipelineManifest> {
        serde_json::from_str(&self.document).map_err(|e| NexusError::IoError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_single_pass_manifest() {
        let json = r#"{
            "pipeline_id": "p1",
            "input_format": "binary",
            "output_format": "binary",
            "components": [
                {"component_id": "A"},
                {"component_id": "B"}
            ]
        }"#;
        let manifest = JsonConfigSource::from_str(json).load().unwrap();
        assert_eq!(manifest.components.len(), 2);
        assert_eq!(manifest.max_iteration_count, 100);
        assert!(!manifest.is_multi_pass());
    }

    #[test]
    fn connections_switch_to_multi_pass() {
        let json = r#"{
            "pipeline_id": "p1",
            "input_format": "binary",
            "output_format": "binary",
            "components": [{"component_id": "P"}, {"component_id": "Q"}],
            "connections": [
                {"src": "P", "dst": "Q", "direction": "forward"},
                {"src": "Q", "dst": "P", "direction": "backward"}
            ]
        }"#;
        let manifest = JsonConfigSource::from_str(json).load().unwrap();
        assert!(manifest.is_multi_pass());
    }

    #[test]
    fn empty_components_fails_validation() {
        let manifest = PipelineManifest {
            pipeline_id: "p1".to_string(),
            description: None,
            input_format: "binary".to_string(),
            output_format: "binary".to_string(),
            allow_partial_processing: false,
            components: Vec::new(),
            connections: Vec::new(),
            allow_cycles: false,
            max_iteration_count: 100,
        };
        assert!(matches!(
            manifest.validate(),
            Err(NexusError::InvalidParameter(_))
        ));
    }

    #[test]
    fn duplicate_component_id_fails_validation() {
        let manifest = PipelineManifest {
            pipeline_id: "p1".to_string(),
            description: None,
            input_format: "binary".to_string(),
            output_format: "binary".to_string(),
            allow_partial_processing: false,
            components: vec![
                ComponentManifest {
                    component_id: "A".to_string(),
                    version: None,
                    optional: false,
                    supports_reentrance: false,
                    max_passes: None,
                    depends_on: Vec::new(),
                },
                ComponentManifest {
                    component_id: "A".to_string(),
                    version: None,
                    optional: false,
                    supports_reentrance: false,
                    max_passes: None,
                    depends_on: Vec::new(),
                },
            ],
            connections: Vec::new(),
            allow_cycles: false,
            max_iteration_count: 100,
        };
        assert!(matches!(
            manifest.validate(),
            Err(NexusError::DuplicateComponent(_))
        ));
    }
}
