use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::archive::{self, MANIFEST_ENTRY, METADATA_ENTRY, SOURCES_ENTRY};
use crate::error::InstallError;
use crate::hasher;
use crate::schema::{InstallManifest, ModuleMetadata, SourcesManifest};

/// Typed view of an archive's JSON entries, read without installing it.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSummary {
    pub digest: String,
    pub metadata: ModuleMetadata,
    pub sources: SourcesManifest,
    pub manifest: InstallManifest,
}

pub fn inspect(archive_path: &Path) -> Result<ModuleSummary, InstallError> {
    if !archive_path.is_file() {
        return Err(InstallError::NotFound(archive_path.display().to_string()));
    }
    Ok(ModuleSummary {
        digest: hasher::digest_file(archive_path)?,
        metadata: entry(archive_path, METADATA_ENTRY)?,
        sources: entry(archive_path, SOURCES_ENTRY)?,
        manifest: entry(archive_path, MANIFEST_ENTRY)?,
    })
}

fn entry<T: DeserializeOwned>(archive_path: &Path, name: &str) -> Result<T, InstallError> {
    let bytes = archive::read_entry(archive_path, name)?
        .ok_or_else(|| InstallError::MalformedArchive(format!("missing `{name}`")))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| InstallError::MalformedArchive(format!("`{name}`: {err}")))
}
