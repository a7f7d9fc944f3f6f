use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::Entity;

/// One observation lifted into an indexable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: u64,
    pub text: String,
    pub entity: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub chunk_id: u64,
    pub entity_name: String,
    pub entity_type: String,
    /// Unicode scalar count of the chunk text.
    pub char_count: usize,
}

/// Flat, bulk-indexable form of a list of entities.
///
/// `chunks` and `metadata` are parallel: same length, and
/// `chunks[i].id == metadata[i].chunk_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingsPayload {
    pub chunks: Vec<KnowledgeChunk>,
    pub metadata: Vec<ChunkMetadata>,
    pub entity_map: BTreeMap<String, String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload has {chunks} chunks but {metadata} metadata records")]
    LengthMismatch { chunks: usize, metadata: usize },
    #[error("metadata[{index}] refers to chunk {metadata_id} but chunk id is {chunk_id}")]
    IdMismatch {
        index: usize,
        chunk_id: u64,
        metadata_id: u64,
    },
    #[error("chunk at position {index} has id {id}; ids must run 0, 1, 2, ...")]
    OutOfSequence { index: usize, id: u64 },
}

/// Walk entities in order, then each entity's observations in order, emitting
/// one chunk and one metadata record per observation with ids counting up
/// from 0.  Every entity lands in `entity_map`, observations or not; a
/// repeated name keeps the last type seen.
pub fn encode(entities: &[Entity]) -> EmbeddingsPayload {
    let mut payload = EmbeddingsPayload::default();
    let mut next_id = 0u64;

    for entity in entities {
        for observation in &entity.observations {
            payload.chunks.push(KnowledgeChunk {
                id: next_id,
                text: observation.clone(),
                entity: entity.name.clone(),
                entity_type: entity.entity_type.clone(),
            });
            payload.metadata.push(ChunkMetadata {
                chunk_id: next_id,
                entity_name: entity.name.clone(),
                entity_type: entity.entity_type.clone(),
                char_count: observation.chars().count(),
            });
            next_id += 1;
        }
        payload
            .entity_map
            .insert(entity.name.clone(), entity.entity_type.clone());
    }

    payload
}

impl EmbeddingsPayload {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.chunks.len() != self.metadata.len() {
            return Err(PayloadError::LengthMismatch {
                chunks: self.chunks.len(),
                metadata: self.metadata.len(),
            });
        }

        for (index, (chunk, meta)) in self.chunks.iter().zip(&self.metadata).enumerate() {
            if chunk.id != index as u64 {
                return Err(PayloadError::OutOfSequence {
                    index,
                    id: chunk.id,
                });
            }
            if meta.chunk_id != chunk.id {
                return Err(PayloadError::IdMismatch {
                    index,
                    chunk_id: chunk.id,
                    metadata_id: meta.chunk_id,
                });
            }
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
