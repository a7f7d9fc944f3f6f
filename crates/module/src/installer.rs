use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use mkm_config::{InstallerConfig, UnknownStepPolicy, scratch_root};

use crate::archive::{self, ArchiveError, MANIFEST_ENTRY, METADATA_ENTRY};
use crate::embeddings::EmbeddingsPayload;
use crate::error::InstallError;
use crate::hasher;
use crate::registry::{InstalledModule, ModuleRegistry};
use crate::schema::{InstallManifest, InstallStep, ModuleMetadata};
use crate::sinks::{Fetcher, MetadataSink, PinnedDigest, TrustAll, VectorSink, Verifier};

/// Outcome of the pre-extraction trust gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// No reference digest was known for the module; the verifier accepted
    /// the computed digest on its own.
    Trivial { digest: String },
    /// The verifier accepted the digest against a reference digest.
    Reference { digest: String, expected: String },
}

impl Verification {
    pub fn digest(&self) -> &str {
        match self {
            Self::Trivial { digest } | Self::Reference { digest, .. } => digest,
        }
    }
}

/// Everything a successful install did, in order.
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub module_name: String,
    pub archive_path: PathBuf,
    pub verification: Verification,
    pub metadata: ModuleMetadata,
    pub chunks_loaded: usize,
    /// Actions that ran, in manifest order.
    pub executed_steps: Vec<String>,
    /// Unrecognized actions passed over under [`UnknownStepPolicy::Skip`].
    pub skipped_steps: Vec<String>,
}

/// Unpacks module archives and applies their install steps.
///
/// Every install runs in its own scratch directory (unique per call, so two
/// concurrent installs of the same module never share one), executes the
/// manifest's steps strictly in order, and releases the scratch directory
/// before returning on every path, including cancellation.  The registry is
/// only written after all steps have succeeded.
pub struct Installer {
    modules_dir: PathBuf,
    scratch_root: PathBuf,
    extension: String,
    registry: Arc<ModuleRegistry>,
    fetcher: Option<Arc<dyn Fetcher>>,
    vector_sink: Option<Arc<dyn VectorSink>>,
    metadata_sink: Option<Arc<dyn MetadataSink>>,
    verifier: Arc<dyn Verifier>,
    reference_digests: BTreeMap<String, String>,
    unknown_steps: UnknownStepPolicy,
    fetch_timeout: Duration,
}

impl Installer {
    pub fn new(modules_dir: impl Into<PathBuf>, registry: Arc<ModuleRegistry>) -> Self {
        let defaults = InstallerConfig::default();
        Self {
            modules_dir: modules_dir.into(),
            scratch_root: scratch_root(&defaults.scratch_dir),
            extension: defaults.archive_extension,
            registry,
            fetcher: None,
            vector_sink: None,
            metadata_sink: None,
            verifier: Arc::new(TrustAll),
            reference_digests: BTreeMap::new(),
            unknown_steps: defaults.unknown_step_policy,
            fetch_timeout: Duration::from_secs(defaults.fetch_timeout_secs),
        }
    }

    /// Pinned digests in the config switch the verifier to [`PinnedDigest`].
    pub fn from_config(config: &InstallerConfig, registry: Arc<ModuleRegistry>) -> Self {
        let verifier: Arc<dyn Verifier> = if config.pinned_digests.is_empty() {
            Arc::new(TrustAll)
        } else {
            Arc::new(PinnedDigest)
        };
        Self {
            modules_dir: PathBuf::from(&config.modules_dir),
            scratch_root: scratch_root(&config.scratch_dir),
            extension: config.archive_extension.clone(),
            registry,
            fetcher: None,
            vector_sink: None,
            metadata_sink: None,
            verifier,
            reference_digests: config.pinned_digests.clone(),
            unknown_steps: config.unknown_step_policy,
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
        }
    }

    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_vector_sink(mut self, sink: Arc<dyn VectorSink>) -> Self {
        self.vector_sink = Some(sink);
        self
    }

    pub fn with_metadata_sink(mut self, sink: Arc<dyn MetadataSink>) -> Self {
        self.metadata_sink = Some(sink);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_reference_digest(
        mut self,
        module_name: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        self.reference_digests
            .insert(module_name.into(), digest.into());
        self
    }

    pub fn with_unknown_step_policy(mut self, policy: UnknownStepPolicy) -> Self {
        self.unknown_steps = policy;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn list_installed(&self) -> BTreeMap<String, InstalledModule> {
        self.registry.list()
    }

    /// Install `<modules_dir>/<module_name>.<ext>`, fetching it from
    /// `source_url` first when no local archive exists.
    pub async fn install(
        &self,
        module_name: &str,
        source_url: Option<&str>,
    ) -> Result<InstallReport, InstallError> {
        self.run(module_name, source_url, &CancelSignal::default())
            .await
    }

    /// [`Installer::install`] that gives up with [`InstallError::Cancelled`]
    /// once `cancel` completes.  The in-flight install is signalled rather
    /// than dropped, so it stops at its next checkpoint and releases its
    /// scratch directory before this returns; no registry record is written.
    pub async fn install_until<C>(
        &self,
        module_name: &str,
        source_url: Option<&str>,
        cancel: C,
    ) -> Result<InstallReport, InstallError>
    where
        C: Future<Output = ()>,
    {
        let signal = CancelSignal::default();
        let run = self.run(module_name, source_url, &signal);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            () = cancel => {
                warn!(module = %module_name, "cancelling install");
                signal.fire();
                run.await
            }
        }
    }

    /// Verify, unpack, and apply the archive at `archive_path`, recording it
    /// as `module_name` on success.
    pub async fn install_archive(
        &self,
        archive_path: &Path,
        module_name: &str,
    ) -> Result<InstallReport, InstallError> {
        self.run_archive(archive_path, module_name, &CancelSignal::default())
            .await
    }

    async fn run(
        &self,
        module_name: &str,
        source_url: Option<&str>,
        signal: &CancelSignal,
    ) -> Result<InstallReport, InstallError> {
        info!(module = %module_name, "searching for knowledge module");
        let archive_path = self
            .resolve_archive(module_name, source_url, signal)
            .await?;
        self.run_archive(&archive_path, module_name, signal).await
    }

    async fn run_archive(
        &self,
        archive_path: &Path,
        module_name: &str,
        signal: &CancelSignal,
    ) -> Result<InstallReport, InstallError> {
        ensure_plain_name(module_name)?;
        if !archive_path.is_file() {
            warn!(module = %module_name, path = %archive_path.display(), "knowledge module not found");
            return Err(InstallError::NotFound(module_name.to_string()));
        }

        let path = archive_path.to_path_buf();
        let hashing = blocking(move || hasher::digest_file(&path));
        let digest = signal.guard(module_name, hashing).await??.map_err(InstallError::Io)?;
        let verification = self.verify(module_name, archive_path, digest)?;

        tokio::fs::create_dir_all(&self.scratch_root).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("mkm-install-{module_name}-"))
            .tempdir_in(&self.scratch_root)?;
        debug!(scratch = %scratch.path().display(), "extracting module");

        let result = self
            .apply(scratch.path(), archive_path, module_name, verification, signal)
            .await;

        if let Err(err) = scratch.close() {
            warn!(module = %module_name, error = %err, "failed to remove install scratch directory");
        }

        let report = match result {
            Ok(_) if signal.is_cancelled() => {
                warn!(module = %module_name, "install cancelled");
                return Err(InstallError::Cancelled(module_name.to_string()));
            }
            Ok(report) => report,
            Err(err) => {
                warn!(module = %module_name, error = %err, "install failed");
                return Err(err);
            }
        };

        self.registry.record(InstalledModule {
            module_name: module_name.to_string(),
            source_path: archive_path.to_path_buf(),
            installed_at: Utc::now(),
            digest: report.verification.digest().to_string(),
            skills_provided: report.metadata.skills_provided.clone(),
        });
        info!(
            module = %module_name,
            chunks = report.chunks_loaded,
            skipped = report.skipped_steps.len(),
            "module installed"
        );

        Ok(report)
    }

    async fn resolve_archive(
        &self,
        module_name: &str,
        source_url: Option<&str>,
        signal: &CancelSignal,
    ) -> Result<PathBuf, InstallError> {
        ensure_plain_name(module_name)?;

        let local = self
            .modules_dir
            .join(format!("{module_name}.{}", self.extension));
        if local.is_file() {
            return Ok(local);
        }

        let (Some(url), Some(fetcher)) = (source_url, &self.fetcher) else {
            warn!(module = %module_name, "knowledge module not found locally and no fetch source available");
            return Err(InstallError::NotFound(module_name.to_string()));
        };

        info!(module = %module_name, url = %url, "fetching module");
        let fetch = tokio::time::timeout(self.fetch_timeout, fetcher.fetch(url, module_name));
        match signal.guard(module_name, fetch).await? {
            Err(_) => Err(InstallError::FetchTimedOut {
                url: url.to_string(),
                timeout_secs: self.fetch_timeout.as_secs(),
            }),
            Ok(Err(source)) => Err(InstallError::FetchFailed {
                url: url.to_string(),
                source,
            }),
            Ok(Ok(path)) if path.is_file() => Ok(path),
            Ok(Ok(_)) => Err(InstallError::NotFound(module_name.to_string())),
        }
    }

    fn verify(
        &self,
        module_name: &str,
        archive_path: &Path,
        digest: String,
    ) -> Result<Verification, InstallError> {
        let expected = self.reference_digests.get(module_name);
        if !self.verifier.check(&digest, expected.map(String::as_str)) {
            warn!(module = %module_name, hash = %hasher::short(&digest), "module verification failed");
            return Err(InstallError::VerificationFailed {
                path: archive_path.to_path_buf(),
                digest,
            });
        }

        info!(module = %module_name, hash = %hasher::short(&digest), "module integrity verified");
        Ok(match expected {
            Some(expected) => Verification::Reference {
                digest,
                expected: expected.clone(),
            },
            None => Verification::Trivial { digest },
        })
    }

    async fn apply(
        &self,
        scratch: &Path,
        archive_path: &Path,
        module_name: &str,
        verification: Verification,
        signal: &CancelSignal,
    ) -> Result<InstallReport, InstallError> {
        // Extraction writes into `scratch`, so it is awaited to completion
        // rather than raced; it polls the cancel flag itself.
        let (archive, dir, flag) = (
            archive_path.to_path_buf(),
            scratch.to_path_buf(),
            Arc::clone(&signal.flag),
        );
        blocking(move || archive::unpack_into_until(&archive, &dir, &flag))
            .await?
            .map_err(|err| match err {
                ArchiveError::Interrupted => InstallError::Cancelled(module_name.to_string()),
                other => other.into(),
            })?;

        let manifest: InstallManifest = read_json_entry(scratch, MANIFEST_ENTRY).await?;
        let metadata: ModuleMetadata = read_json_entry(scratch, METADATA_ENTRY).await?;

        info!(
            module = %module_name,
            name = %metadata.name,
            description = %metadata.description,
            skills = %join_skills(&metadata.skills_provided),
            steps = manifest.install_steps.len(),
            "installing module"
        );

        let mut report = InstallReport {
            module_name: module_name.to_string(),
            archive_path: archive_path.to_path_buf(),
            verification,
            metadata,
            chunks_loaded: 0,
            executed_steps: Vec::new(),
            skipped_steps: Vec::new(),
        };

        for (index, step) in manifest.install_steps.iter().enumerate() {
            if signal.is_cancelled() {
                return Err(InstallError::Cancelled(module_name.to_string()));
            }

            let action = step.action();
            match step {
                InstallStep::LoadEmbeddings { file } => {
                    report.chunks_loaded += self
                        .load_embeddings(index, scratch, file, module_name, signal)
                        .await?;
                }
                InstallStep::RegisterMetadata { .. } => {
                    debug!(step = index, "registering module metadata");
                    if let Some(sink) = &self.metadata_sink {
                        signal
                            .guard(module_name, sink.register(&report.metadata))
                            .await?
                            .map_err(|err| InstallError::step(index, action, err))?;
                    }
                }
                InstallStep::VerifyIntegrity { check } => {
                    // The gate already ran before extraction; an install that
                    // reaches this step has passed it.
                    debug!(
                        step = index,
                        check = %check,
                        hash = %hasher::short(report.verification.digest()),
                        "integrity verified"
                    );
                }
                InstallStep::Unrecognized { action } => match self.unknown_steps {
                    UnknownStepPolicy::Skip => {
                        warn!(step = index, action = %action, "skipping unrecognized install step");
                        report.skipped_steps.push(action.clone());
                        continue;
                    }
                    UnknownStepPolicy::Fail => {
                        return Err(InstallError::UnsupportedStep {
                            index,
                            action: action.clone(),
                        });
                    }
                },
            }
            info!(step = index, action = %action, "install step complete");
            report.executed_steps.push(action.to_string());
        }

        Ok(report)
    }

    async fn load_embeddings(
        &self,
        index: usize,
        scratch: &Path,
        file: &str,
        module_name: &str,
        signal: &CancelSignal,
    ) -> Result<usize, InstallError> {
        const ACTION: &str = "load_embeddings";

        let Some(name) = archive::plain_name(Path::new(file)) else {
            return Err(InstallError::step(
                index,
                ACTION,
                anyhow!("embeddings entry `{file}` is not a bare file name"),
            ));
        };
        let bytes = tokio::fs::read(scratch.join(&name)).await.map_err(|err| {
            InstallError::step(
                index,
                ACTION,
                anyhow::Error::new(err).context(format!("reading `{name}`")),
            )
        })?;

        let decoding = blocking(move || -> anyhow::Result<EmbeddingsPayload> {
            let payload = EmbeddingsPayload::from_slice(&bytes)?;
            payload.validate()?;
            Ok(payload)
        });
        let payload = signal
            .guard(module_name, decoding)
            .await??
            .map_err(|err| InstallError::step(index, ACTION, err))?;

        info!(step = index, chunks = payload.chunk_count(), "loaded knowledge chunks");
        if let Some(sink) = &self.vector_sink {
            signal
                .guard(module_name, sink.ingest(&payload))
                .await?
                .map_err(|err| InstallError::step(index, ACTION, err))?;
        }

        Ok(payload.chunk_count())
    }
}

/// Cancellation shared between [`Installer::install_until`] and the install
/// it drives.  Blocking work polls `flag`; async waits race `cancelled()`.
#[derive(Debug, Default)]
struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Notify,
}

impl CancelSignal {
    fn fire(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            // Registered before the flag check so a concurrent `fire` is not missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    async fn guard<T>(
        &self,
        module_name: &str,
        work: impl Future<Output = T>,
    ) -> Result<T, InstallError> {
        tokio::select! {
            output = work => Ok(output),
            () = self.cancelled() => Err(InstallError::Cancelled(module_name.to_string())),
        }
    }
}

/// Run filesystem- or CPU-heavy work off the async executor.
async fn blocking<T, F>(task: F) -> Result<T, InstallError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|err| {
        InstallError::Io(io::Error::other(format!("install blocking task failed: {err}")))
    })
}

/// Module names resolve to `<name>.<ext>` inside one directory and seed
/// scratch-directory prefixes, so they must be a single path component.
fn ensure_plain_name(module_name: &str) -> Result<(), InstallError> {
    if archive::plain_name(Path::new(module_name)).as_deref() == Some(module_name) {
        Ok(())
    } else {
        Err(InstallError::NotFound(module_name.to_string()))
    }
}

async fn read_json_entry<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T, InstallError> {
    let bytes = match tokio::fs::read(dir.join(name)).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(InstallError::MalformedArchive(format!("missing `{name}`")));
        }
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|err| InstallError::MalformedArchive(format!("`{name}`: {err}")))
}

fn join_skills(skills: &BTreeSet<String>) -> String {
    skills.iter().cloned().collect::<Vec<_>>().join(", ")
}
