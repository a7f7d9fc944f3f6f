use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use mkm_config::AppConfig;
use mkm_module::hasher;
use mkm_module::{Entity, InstallReport, Installer, ModuleRegistry, ModuleSummary, Packager, Verification};

pub(crate) fn run_pack(
    config: &AppConfig,
    entities_path: &Path,
    name: &str,
    description: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let entities = read_entities(entities_path)?;
    let mut packager = Packager::from_config(&config.packager);
    if let Some(output) = output {
        packager = packager.with_output_dir(output);
    }

    let path = packager.create_module(&entities, name, description)?;
    let digest = hasher::digest_file(&path)?;
    println!("module created: {}", path.display());
    println!("- entities: {}", entities.len());
    println!("- sha256:   {digest}");
    Ok(())
}

pub(crate) async fn run_install(config: &AppConfig, name: &str, path: Option<&Path>) -> Result<()> {
    let registry = Arc::new(ModuleRegistry::new());
    let installer = Installer::from_config(&config.installer, registry);

    let report = match path {
        Some(path) => installer.install_archive(path, name).await?,
        None => installer.install(name, None).await?,
    };
    print_report(&report);
    Ok(())
}

pub(crate) fn run_hash(path: &Path) -> Result<()> {
    let digest = hasher::digest_file(path)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    println!("{digest}  {}", path.display());
    Ok(())
}

pub(crate) fn run_inspect(path: &Path, json: bool) -> Result<()> {
    let summary = mkm_module::inspect(path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

/// Accepts a bare array of entities or an object with an `entities` array.
fn read_entities(path: &Path) -> Result<Vec<Entity>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read entities from {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    let list = match value {
        serde_json::Value::Object(mut object) => object
            .remove("entities")
            .unwrap_or(serde_json::Value::Array(Vec::new())),
        other => other,
    };
    serde_json::from_value(list).context("expected a JSON array of entities")
}

fn print_report(report: &InstallReport) {
    println!("module installed: {}", report.module_name);
    println!("- archive:  {}", report.archive_path.display());
    match &report.verification {
        Verification::Trivial { digest } => println!("- sha256:   {digest} (no reference digest)"),
        Verification::Reference { digest, .. } => println!("- sha256:   {digest} (matches pinned digest)"),
    }
    println!("- chunks:   {}", report.chunks_loaded);
    println!("- steps:    {}", report.executed_steps.join(", "));
    if !report.skipped_steps.is_empty() {
        println!("- skipped:  {}", report.skipped_steps.join(", "));
    }
    if !report.metadata.skills_provided.is_empty() {
        let skills: Vec<&str> = report.metadata.skills_provided.iter().map(String::as_str).collect();
        println!("- skills:   {}", skills.join(", "));
    }
}

fn print_summary(summary: &ModuleSummary) {
    let metadata = &summary.metadata;
    println!("── {} ─────────────────────────────────────", metadata.name);
    println!("  description: {}", metadata.description);
    println!("  version:     {}", metadata.version);
    println!("  created:     {}", metadata.created.to_rfc3339());
    println!("  type:        {}", metadata.module_type);
    println!("  entities:    {}", metadata.entity_count);
    println!("  size (est):  {:.2} MB", metadata.size_estimate_mb);
    println!("  sha256:      {}", summary.digest);

    println!();
    println!("── skills ───────────────────────────────────────────");
    if metadata.skills_provided.is_empty() {
        println!("  (none)");
    }
    for skill in &metadata.skills_provided {
        println!("  {skill}");
    }

    println!();
    println!("── sources ──────────────────────────────────────────");
    println!("  exported:     {}", summary.sources.export_timestamp.to_rfc3339());
    println!("  observations: {}", summary.sources.total_observations);
    for entity in &summary.sources.memory_entities {
        println!("  {entity}");
    }

    println!();
    println!("── install steps ────────────────────────────────────");
    for (index, step) in summary.manifest.install_steps.iter().enumerate() {
        println!("  {index}. {}", step.action());
    }
    for (key, value) in &summary.manifest.requirements {
        println!("  requires {key} = {value}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn reads_bare_array_and_wrapped_object() {
        let dir = TempDir::new().unwrap();
        let bare = dir.path().join("bare.json");
        fs::write(&bare, r#"[{"name": "Sample", "entityType": "Tool_Reference", "observations": ["x"]}]"#).unwrap();
        let wrapped = dir.path().join("wrapped.json");
        fs::write(&wrapped, r#"{"entities": [{"name": "Sample"}, {"entityType": "Active_Project"}]}"#).unwrap();

        assert_eq!(read_entities(&bare).unwrap()[0].observations, ["x"]);
        let entities = read_entities(&wrapped).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_type, "unknown");
        assert_eq!(entities[1].name, "unknown");
    }

    #[test]
    fn rejects_non_list_input() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#""just a string""#).unwrap();
        assert!(read_entities(&path).is_err());
    }

    #[tokio::test]
    async fn pack_then_install_from_config_dirs() {
        let dir = TempDir::new().unwrap();
        let entities = dir.path().join("entities.json");
        fs::write(&entities, r#"[{"name": "Sample", "entityType": "Tool_Reference", "observations": ["x", "y"]}]"#).unwrap();

        let mut config = AppConfig::default();
        config.packager.output_dir = dir.path().join("out").display().to_string();
        config.packager.scratch_dir = dir.path().join("scratch").display().to_string();
        config.installer.modules_dir = config.packager.output_dir.clone();
        config.installer.scratch_dir = config.packager.scratch_dir.clone();

        run_pack(&config, &entities, "sample", "Sample context", None).unwrap();
        run_install(&config, "sample", None).await.unwrap();
        run_inspect(&dir.path().join("out").join("sample.mkm"), true).unwrap();
    }

    #[tokio::test]
    async fn output_override_keeps_configured_extension() {
        let dir = TempDir::new().unwrap();
        let entities = dir.path().join("entities.json");
        fs::write(&entities, r#"[{"name": "Sample", "entityType": "Tool_Reference", "observations": ["x"]}]"#).unwrap();

        let mut config = AppConfig::default();
        config.packager.archive_extension = "kmod".to_string();
        config.packager.scratch_dir = dir.path().join("scratch").display().to_string();
        config.installer.archive_extension = "kmod".to_string();
        config.installer.modules_dir = dir.path().join("d").display().to_string();
        config.installer.scratch_dir = config.packager.scratch_dir.clone();

        run_pack(&config, &entities, "sample", "d", Some(dir.path().join("d"))).unwrap();
        assert!(dir.path().join("d").join("sample.kmod").is_file());
        assert!(!dir.path().join("d").join("sample.mkm").exists());
        run_install(&config, "sample", None).await.unwrap();
    }
}
