use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Unknown install-step policy ───────────────────────────────────────────────

/// Controls what the installer does with an install step whose `action` it
/// does not recognise.
///
/// | Policy | Behaviour                                                      |
/// |--------|----------------------------------------------------------------|
/// | `skip` | Log a warning, record the step as skipped, keep going.         |
/// | `fail` | Abort the install with an unsupported-step error.              |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownStepPolicy {
    #[default]
    Skip,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagerConfig {
    /// Directory the finished `<name>.<ext>` archive is published into.
    /// Overridden at runtime by `MKM_OUTPUT_DIR` when set.
    pub output_dir: String,
    /// Parent directory for per-operation scratch directories.  Empty means
    /// the system temp directory.
    pub scratch_dir: String,
    /// Version string stamped into every module's metadata.
    pub module_version: String,
    pub archive_extension: String,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            output_dir: ".".to_string(),
            scratch_dir: String::new(),
            module_version: "1.0.0".to_string(),
            archive_extension: "mkm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Directory searched for `<name>.<ext>` before any fetch is attempted.
    /// Overridden at runtime by `MKM_MODULES_DIR` when set.
    pub modules_dir: String,
    /// Parent directory for per-install extraction directories.  Empty means
    /// the system temp directory.
    pub scratch_dir: String,
    pub archive_extension: String,
    pub unknown_step_policy: UnknownStepPolicy,
    /// Upper bound on a single fetch through the transport collaborator.
    pub fetch_timeout_secs: u64,
    /// Reference digests keyed by module name.  A module listed here must hash
    /// to exactly this value; unlisted modules verify trivially.
    pub pinned_digests: BTreeMap<String, String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            modules_dir: ".".to_string(),
            scratch_dir: String::new(),
            archive_extension: "mkm".to_string(),
            unknown_step_policy: UnknownStepPolicy::Skip,
            fetch_timeout_secs: 30,
            pinned_digests: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub packager: PackagerConfig,
    pub installer: InstallerConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(dir) = env::var("MKM_MODULES_DIR") {
            if !dir.is_empty() {
                config.installer.modules_dir = dir;
            }
        }

        if let Ok(dir) = env::var("MKM_OUTPUT_DIR") {
            if !dir.is_empty() {
                config.packager.output_dir = dir;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

/// Resolve a configured scratch directory, falling back to the system temp
/// directory when the setting is empty.
pub fn scratch_root(configured: &str) -> PathBuf {
    if configured.trim().is_empty() {
        env::temp_dir()
    } else {
        PathBuf::from(configured)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
