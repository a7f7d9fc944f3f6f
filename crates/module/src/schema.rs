use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder used for entity fields missing from JSON input.
pub const UNKNOWN: &str = "unknown";

/// Tag stamped into [`ModuleMetadata::module_type`] for modules built from
/// exported memory entities.
pub const MEMORY_EXPORT: &str = "memory_export";

/// A named unit of knowledge handed to the packager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(default = "unknown")]
    pub name: String,
    #[serde(rename = "entityType", default = "unknown")]
    pub entity_type: String,
    #[serde(default)]
    pub observations: Vec<String>,
}

fn unknown() -> String {
    UNKNOWN.to_string()
}

impl Entity {
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        observations: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            observations: observations.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        EntityKind::from_tag(&self.entity_type)
    }
}

/// Entity type tags that carry meaning for skill inference.
///
/// | Kind             | Tag               | Skill emitted              |
/// |------------------|-------------------|----------------------------|
/// | `ActiveProject`  | `Active_Project`  | `project_<slugified name>` |
/// | `ToolReference`  | `Tool_Reference`  | `tool_<lowercased name>`   |
/// | `SystemProtocol` | `System_Protocol` | `protocol_<slugified name>`|
/// | `Other`          | anything else     | none                       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    ActiveProject,
    ToolReference,
    SystemProtocol,
    Other,
}

impl EntityKind {
    /// Tags match exactly; `active_project` is `Other`.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "Active_Project" => Self::ActiveProject,
            "Tool_Reference" => Self::ToolReference,
            "System_Protocol" => Self::SystemProtocol,
            _ => Self::Other,
        }
    }

    /// Skill tag this kind contributes for an entity called `name`.
    pub fn skill_for(self, name: &str) -> Option<String> {
        match self {
            Self::ActiveProject => Some(format!("project_{}", slugify(name))),
            Self::ToolReference => Some(format!("tool_{}", name.to_lowercase())),
            Self::SystemProtocol => Some(format!("protocol_{}", slugify(name))),
            Self::Other => None,
        }
    }
}

/// Lowercase with spaces replaced by underscores.
pub fn slugify(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub name: String,
    pub description: String,
    pub version: String,
    pub created: DateTime<Utc>,
    #[serde(rename = "type")]
    pub module_type: String,
    pub entity_count: usize,
    pub skills_provided: BTreeSet<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Heuristic only; never checked against the real archive size.
    #[serde(default)]
    pub size_estimate_mb: f64,
}

/// Contents of `sources.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesManifest {
    pub memory_entities: Vec<String>,
    pub export_timestamp: DateTime<Utc>,
    pub total_observations: usize,
}

/// Contents of `manifest.json`.  `install_steps` order is execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallManifest {
    pub install_steps: Vec<InstallStep>,
    /// Advisory; the installer never enforces these.
    #[serde(default)]
    pub requirements: BTreeMap<String, serde_json::Value>,
}

impl InstallManifest {
    /// The fixed three-step manifest every packaged module carries.
    pub fn standard() -> Self {
        let mut requirements = BTreeMap::new();
        requirements.insert(
            "vector_db".to_string(),
            serde_json::Value::from("supabase_or_qdrant"),
        );
        requirements.insert("min_memory_mb".to_string(), serde_json::Value::from(100));

        Self {
            install_steps: vec![
                InstallStep::LoadEmbeddings {
                    file: crate::archive::EMBEDDINGS_ENTRY.to_string(),
                },
                InstallStep::RegisterMetadata {
                    file: crate::archive::METADATA_ENTRY.to_string(),
                },
                InstallStep::VerifyIntegrity {
                    check: "hash".to_string(),
                },
            ],
            requirements,
        }
    }
}

/// One declared unit of install work.
///
/// Serialized as a flat JSON object discriminated by `action`.  Actions this
/// build does not know deserialize into [`InstallStep::Unrecognized`] so the
/// installer can apply its unknown-step policy instead of rejecting the
/// whole manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub enum InstallStep {
    LoadEmbeddings { file: String },
    RegisterMetadata { file: String },
    VerifyIntegrity { check: String },
    Unrecognized { action: String },
}

impl InstallStep {
    pub fn action(&self) -> &str {
        match self {
            Self::LoadEmbeddings { .. } => "load_embeddings",
            Self::RegisterMetadata { .. } => "register_metadata",
            Self::VerifyIntegrity { .. } => "verify_integrity",
            Self::Unrecognized { action } => action,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStep {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    check: Option<String>,
}

impl TryFrom<RawStep> for InstallStep {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let missing = |field: &str| format!("install step `{}` is missing `{field}`", raw.action);
        match raw.action.as_str() {
            "load_embeddings" => Ok(Self::LoadEmbeddings {
                file: raw.file.clone().ok_or_else(|| missing("file"))?,
            }),
            "register_metadata" => Ok(Self::RegisterMetadata {
                file: raw.file.clone().ok_or_else(|| missing("file"))?,
            }),
            "verify_integrity" => Ok(Self::VerifyIntegrity {
                check: raw.check.clone().ok_or_else(|| missing("check"))?,
            }),
            _ => Ok(Self::Unrecognized {
                action: raw.action.clone(),
            }),
        }
    }
}

impl From<InstallStep> for RawStep {
    fn from(step: InstallStep) -> Self {
        match step {
            InstallStep::LoadEmbeddings { file } => Self {
                action: "load_embeddings".to_string(),
                file: Some(file),
                check: None,
            },
            InstallStep::RegisterMetadata { file } => Self {
                action: "register_metadata".to_string(),
                file: Some(file),
                check: None,
            },
            InstallStep::VerifyIntegrity { check } => Self {
                action: "verify_integrity".to_string(),
                file: None,
                check: Some(check),
            },
            InstallStep::Unrecognized { action } => Self {
                action,
                file: None,
                check: None,
            },
        }
    }
}
