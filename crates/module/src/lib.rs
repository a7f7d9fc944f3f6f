pub mod archive;
pub mod embeddings;
pub mod error;
pub mod hasher;
pub mod inspect;
pub mod installer;
pub mod packager;
pub mod registry;
pub mod schema;
pub mod sinks;

pub use embeddings::{EmbeddingsPayload, KnowledgeChunk, PayloadError};
pub use error::{InstallError, PackageError};
pub use inspect::{ModuleSummary, inspect};
pub use installer::{InstallReport, Installer, Verification};
pub use packager::Packager;
pub use registry::{InstalledModule, ModuleRegistry};
pub use schema::{Entity, EntityKind, InstallManifest, InstallStep, ModuleMetadata, SourcesManifest};
pub use sinks::{Fetcher, MetadataSink, PinnedDigest, TrustAll, VectorSink, Verifier};
