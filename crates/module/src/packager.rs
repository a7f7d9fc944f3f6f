use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};

use mkm_config::{PackagerConfig, scratch_root};

use crate::archive::{self, EMBEDDINGS_ENTRY, ENTRY_ORDER, MANIFEST_ENTRY, METADATA_ENTRY, SOURCES_ENTRY};
use crate::embeddings;
use crate::error::PackageError;
use crate::hasher;
use crate::schema::{Entity, InstallManifest, MEMORY_EXPORT, ModuleMetadata, SourcesManifest};

/// Assumed compression ratio behind [`estimate_size_mb`].
const COMPRESSION_RATIO: f64 = 10.0;

/// Builds module archives from entity lists.
///
/// Each [`Packager::create_module`] call stages its four entries in its own
/// scratch directory under `scratch_root`, publishes `<name>.<ext>` into
/// `output_dir` atomically, and removes the scratch directory on every exit
/// path.  Calls share no state, so independent modules can be packaged
/// concurrently.
#[derive(Debug, Clone)]
pub struct Packager {
    output_dir: PathBuf,
    scratch_root: PathBuf,
    module_version: String,
    extension: String,
}

impl Packager {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let defaults = PackagerConfig::default();
        Self {
            output_dir: output_dir.into(),
            scratch_root: scratch_root(&defaults.scratch_dir),
            module_version: defaults.module_version,
            extension: defaults.archive_extension,
        }
    }

    pub fn from_config(config: &PackagerConfig) -> Self {
        Self {
            output_dir: PathBuf::from(&config.output_dir),
            scratch_root: scratch_root(&config.scratch_dir),
            module_version: config.module_version.clone(),
            extension: config.archive_extension.clone(),
        }
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    pub fn with_module_version(mut self, version: impl Into<String>) -> Self {
        self.module_version = version.into();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn archive_path(&self, module_name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{module_name}.{}", self.extension))
    }

    /// Package `entities` into `<output_dir>/<module_name>.<ext>` and return
    /// the archive path.
    ///
    /// Fails without touching the destination when any entity has an empty
    /// name, the module name is not a bare file stem, or any serialization or
    /// filesystem step fails.
    pub fn create_module(
        &self,
        entities: &[Entity],
        module_name: &str,
        description: &str,
    ) -> Result<PathBuf, PackageError> {
        validate_module_name(module_name)?;
        validate_entities(entities)?;
        info!(module = %module_name, entities = entities.len(), "creating knowledge module");

        fs::create_dir_all(&self.scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("mkm-pack-{module_name}-"))
            .tempdir_in(&self.scratch_root)?;
        debug!(scratch = %scratch.path().display(), "staging module entries");

        let now = Utc::now();
        let metadata = ModuleMetadata {
            name: module_name.to_string(),
            description: description.to_string(),
            version: self.module_version.clone(),
            created: now,
            module_type: MEMORY_EXPORT.to_string(),
            entity_count: entities.len(),
            skills_provided: extract_skills(entities),
            prerequisites: Vec::new(),
            size_estimate_mb: estimate_size_mb(entities),
        };
        let payload = embeddings::encode(entities);
        let sources = SourcesManifest {
            memory_entities: entities.iter().map(|e| e.name.clone()).collect(),
            export_timestamp: now,
            total_observations: entities.iter().map(|e| e.observations.len()).sum(),
        };
        let manifest = InstallManifest::standard();

        let staging = scratch.path();
        fs::write(staging.join(METADATA_ENTRY), serde_json::to_vec_pretty(&metadata)?)?;
        fs::write(staging.join(EMBEDDINGS_ENTRY), payload.to_bytes()?)?;
        fs::write(staging.join(SOURCES_ENTRY), serde_json::to_vec_pretty(&sources)?)?;
        fs::write(staging.join(MANIFEST_ENTRY), serde_json::to_vec_pretty(&manifest)?)?;
        debug!(chunks = payload.chunk_count(), "entries staged");

        fs::create_dir_all(&self.output_dir)?;
        let archive_path = self.archive_path(module_name);
        archive::pack_dir(staging, &ENTRY_ORDER, &archive_path)?;

        let digest = hasher::digest_file(&archive_path)?;
        info!(
            module = %module_name,
            path = %archive_path.display(),
            hash = %hasher::short(&digest),
            skills = metadata.skills_provided.len(),
            "module created"
        );

        if let Err(err) = scratch.close() {
            warn!(module = %module_name, error = %err, "failed to remove packaging scratch directory");
        }

        Ok(archive_path)
    }
}

/// Skill tags inferred from entity kinds; duplicates collapse.
pub fn extract_skills(entities: &[Entity]) -> BTreeSet<String> {
    entities
        .iter()
        .filter_map(|entity| entity.kind().skill_for(&entity.name))
        .collect()
}

/// Rough compressed size in MB: total JSON character length of the entities,
/// assuming 10:1 compression, rounded to two decimals.  Advisory only.
pub fn estimate_size_mb(entities: &[Entity]) -> f64 {
    let total_chars: usize = entities
        .iter()
        .map(|entity| {
            serde_json::to_string(entity)
                .map(|json| json.chars().count())
                .unwrap_or(0)
        })
        .sum();
    let mb = total_chars as f64 / (1024.0 * 1024.0 * COMPRESSION_RATIO);
    (mb * 100.0).round() / 100.0
}

pub(crate) fn validate_module_name(module_name: &str) -> Result<(), PackageError> {
    match archive::plain_name(Path::new(module_name)) {
        Some(name) if name == module_name => Ok(()),
        _ => Err(PackageError::InvalidModuleName(module_name.to_string())),
    }
}

fn validate_entities(entities: &[Entity]) -> Result<(), PackageError> {
    for (index, entity) in entities.iter().enumerate() {
        if entity.name.is_empty() {
            return Err(PackageError::InvalidEntity {
                index,
                reason: "name is empty".to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingsPayload;
    use tempfile::TempDir;

    fn sample_entities() -> Vec<Entity> {
        vec![
            Entity::new(
                "Session_Breadcrumbs",
                "Activity_Log",
                ["[2025-06-20][Project started]", "[2025-06-21][System designed]"],
            ),
            Entity::new(
                "Matrix Knowledge System",
                "Active_Project",
                ["Downloadable knowledge modules", "Verified by content hash"],
            ),
            Entity::new("Sample", "Tool_Reference", ["x", "y"]),
            Entity::new("Boot Order", "System_Protocol", Vec::<String>::new()),
        ]
    }

    fn packager(dir: &TempDir) -> Packager {
        Packager::new(dir.path().join("out")).with_scratch_root(dir.path().join("scratch"))
    }

    fn read_json<T: serde::de::DeserializeOwned>(archive: &Path, entry: &str) -> T {
        let bytes = archive::read_entry(archive, entry).unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn scratch_is_empty(dir: &TempDir) -> bool {
        let scratch = dir.path().join("scratch");
        !scratch.exists() || fs::read_dir(scratch).unwrap().next().is_none()
    }

    #[test]
    fn skills_from_recognised_kinds_only() {
        let skills = extract_skills(&sample_entities());
        let expected: BTreeSet<String> = [
            "project_matrix_knowledge_system",
            "tool_sample",
            "protocol_boot_order",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(skills, expected);
    }

    #[test]
    fn duplicate_skills_collapse() {
        let skills = extract_skills(&[
            Entity::new("Git", "Tool_Reference", ["a"]),
            Entity::new("GIT", "Tool_Reference", ["b"]),
        ]);
        assert_eq!(skills.len(), 1);
        assert!(skills.contains("tool_git"));
    }

    #[test]
    fn size_estimate_is_small_and_rounded() {
        assert_eq!(estimate_size_mb(&[]), 0.0);
        assert_eq!(estimate_size_mb(&sample_entities()), 0.0);

        let big = Entity::new("Big", "Activity_Log", ["z".repeat(11 * 1024 * 1024)]);
        let estimate = estimate_size_mb(&[big]);
        assert!((estimate - 1.1).abs() < 1e-9, "{estimate}");
    }

    #[test]
    fn archive_holds_exactly_the_four_entries() {
        let dir = TempDir::new().unwrap();
        let path = packager(&dir)
            .create_module(&sample_entities(), "sample-context", "Sample context")
            .unwrap();
        assert_eq!(path, dir.path().join("out").join("sample-context.mkm"));

        let out = TempDir::new().unwrap();
        let names = archive::unpack_into(&path, out.path()).unwrap();
        assert_eq!(names, ENTRY_ORDER);
    }

    #[test]
    fn metadata_sources_and_manifest_contents() {
        let dir = TempDir::new().unwrap();
        let entities = sample_entities();
        let path = packager(&dir)
            .create_module(&entities, "sample-context", "Sample context")
            .unwrap();

        let metadata: ModuleMetadata = read_json(&path, METADATA_ENTRY);
        assert_eq!(metadata.name, "sample-context");
        assert_eq!(metadata.description, "Sample context");
        assert_eq!(metadata.version, "1.0.0");
        assert_eq!(metadata.module_type, "memory_export");
        assert_eq!(metadata.entity_count, 4);
        assert!(metadata.skills_provided.contains("tool_sample"));
        assert!(metadata.prerequisites.is_empty());

        let sources: SourcesManifest = read_json(&path, SOURCES_ENTRY);
        assert_eq!(sources.total_observations, 6);
        assert_eq!(sources.memory_entities[1], "Matrix Knowledge System");

        let manifest: InstallManifest = read_json(&path, MANIFEST_ENTRY);
        assert_eq!(manifest, InstallManifest::standard());

        let payload: EmbeddingsPayload = read_json(&path, EMBEDDINGS_ENTRY);
        assert_eq!(payload.chunk_count(), 6);
        assert_eq!(payload.entity_map["Boot Order"], "System_Protocol");
    }

    #[test]
    fn packaging_twice_is_idempotent_apart_from_timestamps() {
        let dir = TempDir::new().unwrap();
        let packager = packager(&dir);
        let entities = sample_entities();

        let first = packager.create_module(&entities, "twice", "d").unwrap();
        let first_payload: EmbeddingsPayload = read_json(&first, EMBEDDINGS_ENTRY);
        let mut first_meta: ModuleMetadata = read_json(&first, METADATA_ENTRY);

        let second = packager.create_module(&entities, "twice", "d").unwrap();
        let second_payload: EmbeddingsPayload = read_json(&second, EMBEDDINGS_ENTRY);
        let second_meta: ModuleMetadata = read_json(&second, METADATA_ENTRY);

        assert_eq!(first_payload, second_payload);
        first_meta.created = second_meta.created;
        assert_eq!(first_meta, second_meta);
    }

    #[test]
    fn scratch_removed_after_success() {
        let dir = TempDir::new().unwrap();
        packager(&dir)
            .create_module(&sample_entities(), "clean", "d")
            .unwrap();
        assert!(scratch_is_empty(&dir));
    }

    #[test]
    fn failed_publish_removes_scratch_and_leaves_no_archive() {
        let dir = TempDir::new().unwrap();
        // A regular file where the output directory should be.
        let blocked = dir.path().join("out");
        fs::write(&blocked, b"not a directory").unwrap();

        let result = packager(&dir).create_module(&sample_entities(), "blocked", "d");
        assert!(matches!(result, Err(PackageError::Io(_))));
        assert!(scratch_is_empty(&dir));
        assert!(!blocked.join("blocked.mkm").exists());
    }

    #[test]
    fn empty_entity_name_rejected_before_any_io() {
        let dir = TempDir::new().unwrap();
        let entities = vec![Entity::new("", "Tool_Reference", ["x"])];
        let result = packager(&dir).create_module(&entities, "bad", "d");
        assert!(matches!(
            result,
            Err(PackageError::InvalidEntity { index: 0, .. })
        ));
        assert!(!dir.path().join("scratch").exists());
    }

    #[test]
    fn module_names_must_be_bare() {
        for bad in ["", ".", "..", "a/b", "/abs"] {
            assert!(
                matches!(validate_module_name(bad), Err(PackageError::InvalidModuleName(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_module_name("jordan-context-sample").is_ok());
    }

    #[test]
    fn empty_entity_list_still_packages() {
        let dir = TempDir::new().unwrap();
        let path = packager(&dir).create_module(&[], "empty", "d").unwrap();
        let metadata: ModuleMetadata = read_json(&path, METADATA_ENTRY);
        assert_eq!(metadata.entity_count, 0);
        assert!(metadata.skills_provided.is_empty());
    }

    #[test]
    fn whitespace_entity_name_is_kept() {
        let dir = TempDir::new().unwrap();
        let entities = vec![Entity::new("  ", "Tool_Reference", ["x"])];
        let path = packager(&dir).create_module(&entities, "spaces", "d").unwrap();
        let payload = EmbeddingsPayload::from_slice(
            &archive::read_entry(&path, EMBEDDINGS_ENTRY).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(payload.entity_map["  "], "Tool_Reference");
    }

    #[test]
    fn output_dir_override_keeps_configured_extension() {
        let dir = TempDir::new().unwrap();
        let config = PackagerConfig {
            archive_extension: "kmod".to_string(),
            ..PackagerConfig::default()
        };
        let packager = Packager::from_config(&config)
            .with_output_dir(dir.path().join("elsewhere"))
            .with_scratch_root(dir.path().join("scratch"));
        let path = packager.create_module(&sample_entities(), "ext", "d").unwrap();
        assert_eq!(path, dir.path().join("elsewhere").join("ext.kmod"));
    }

    #[test]
    fn concurrent_packaging_of_one_name_publishes_a_whole_archive() {
        let dir = TempDir::new().unwrap();
        let observations: Vec<String> = (0..1_000).map(|i| format!("observation {i}")).collect();
        let entities = vec![Entity::new("Bulk", "Tool_Reference", observations)];

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let packager = packager(&dir);
                let entities = entities.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        packager.create_module(&entities, "same", "d").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let path = packager(&dir).archive_path("same");
        let payload = EmbeddingsPayload::from_slice(
            &archive::read_entry(&path, EMBEDDINGS_ENTRY).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(payload.chunk_count(), 1_000);
        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 1);
        assert!(scratch_is_empty(&dir));
    }
}
