use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::embeddings::EmbeddingsPayload;
use crate::schema::ModuleMetadata;

// ── Collaborators ────────────────────────────────────────────────────────────

/// Transport that turns a URL into a local archive path (HTTP, IPFS, S3, ...).
/// Only consulted when no local archive exists for the requested module.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, module_name: &str) -> Result<PathBuf>;
}

/// Receives decoded embeddings during the `load_embeddings` step.
#[async_trait]
pub trait VectorSink: Send + Sync {
    async fn ingest(&self, payload: &EmbeddingsPayload) -> Result<()>;
}

/// Receives module metadata during the `register_metadata` step.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn register(&self, metadata: &ModuleMetadata) -> Result<()>;
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Trust gate applied to an archive's digest before it is unpacked.
///
/// `expected` is the reference digest for the module when one is known.
pub trait Verifier: Send + Sync {
    fn check(&self, digest: &str, expected: Option<&str>) -> bool;
}

/// Accepts every archive.  The digest is still computed and logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustAll;

impl Verifier for TrustAll {
    fn check(&self, _digest: &str, _expected: Option<&str>) -> bool {
        true
    }
}

/// Requires an exact (case-insensitive) match whenever a reference digest is
/// available; passes trivially otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct PinnedDigest;

impl Verifier for PinnedDigest {
    fn check(&self, digest: &str, expected: Option<&str>) -> bool {
        match expected {
            Some(expected) => expected.trim().eq_ignore_ascii_case(digest),
            None => true,
        }
    }
}
