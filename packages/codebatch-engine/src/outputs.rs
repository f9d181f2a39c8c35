//! Output index I/O and large-payload chunking
//!
//! A shard's `outputs.index.jsonl` is its complete semantic truth. It is
//! only ever written as a whole replacement (tmp + fsync + rename), never
//! appended after commit. Payload bytes above the chunk threshold are split
//! into CAS chunks behind a manifest object; readers reassemble
//! transparently.

use std::path::Path;

use serde::{Deserialize, Serialize};

use codebatch_store::{fsio, ObjectHash, ObjectStore};

use crate::errors::{EngineError, Result};
use crate::records::{OutputRecord, RecordKind, OUTPUT_SCHEMA_NAME};

pub const CHUNKS_SCHEMA_NAME: &str = "codebatch.chunks";
pub const CHUNKS_SCHEMA_VERSION: u32 = 1;
pub const CHUNKS_FORMAT: &str = "chunks/v1";

/// Default split point: payloads strictly larger than this are chunked.
pub const DEFAULT_CHUNK_THRESHOLD: usize = 1 << 20;
/// Default size of each chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Chunking knobs, resolved from task config or defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPolicy {
    pub threshold: usize,
    pub chunk_size: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CHUNK_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// CAS object describing a logically larger blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub schema_name: String,
    pub schema_version: u32,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub chunks: Vec<ObjectHash>,
    pub total_bytes: u64,
}

/// Store a payload, chunking when it exceeds the policy threshold.
///
/// Returns the object to reference from the record and the effective
/// `format` (the caller's format, or `chunks/v1` when a manifest was
/// emitted).
pub fn store_payload(
    cas: &ObjectStore,
    kind: RecordKind,
    format: Option<&str>,
    bytes: &[u8],
    policy: ChunkPolicy,
) -> Result<(ObjectHash, Option<String>)> {
    if bytes.len() <= policy.threshold {
        let object = cas.put(bytes)?;
        return Ok((object, format.map(String::from)));
    }

    let chunk_size = policy.chunk_size.max(1);
    let mut chunks = Vec::with_capacity(bytes.len().div_ceil(chunk_size));
    for chunk in bytes.chunks(chunk_size) {
        chunks.push(cas.put(chunk)?);
    }
    let manifest = ChunkManifest {
        schema_name: CHUNKS_SCHEMA_NAME.to_string(),
        schema_version: CHUNKS_SCHEMA_VERSION,
        kind,
        format: format.map(String::from),
        chunks,
        total_bytes: bytes.len() as u64,
    };
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let object = cas.put(&manifest_bytes)?;
    Ok((object, Some(CHUNKS_FORMAT.to_string())))
}

/// Read a payload back, reassembling a chunk manifest when the referenced
/// object is one.
pub fn load_payload(cas: &ObjectStore, object: &ObjectHash) -> Result<Vec<u8>> {
    let bytes = cas.get(object)?;
    let manifest: ChunkManifest = match serde_json::from_slice(&bytes) {
        Ok(m) => m,
        Err(_) => return Ok(bytes),
    };
    if manifest.schema_name != CHUNKS_SCHEMA_NAME {
        return Ok(bytes);
    }

    let mut assembled = Vec::with_capacity(manifest.total_bytes as usize);
    for chunk in &manifest.chunks {
        assembled.extend_from_slice(&cas.get(chunk)?);
    }
    if assembled.len() as u64 != manifest.total_bytes {
        return Err(EngineError::schema(format!(
            "chunk manifest {} total_bytes {} but chunks sum to {}",
            object,
            manifest.total_bytes,
            assembled.len()
        )));
    }
    Ok(assembled)
}

/// Replace a shard's outputs index atomically.
pub fn write_outputs_index(path: &Path, records: &[OutputRecord]) -> Result<()> {
    Ok(fsio::write_jsonl_atomic(path, records)?)
}

/// Read a shard's outputs index. A missing file yields no records.
pub fn read_outputs_index(path: &Path) -> Result<Vec<OutputRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let records: Vec<OutputRecord> = fsio::read_jsonl(path)?;
    for record in &records {
        if record.schema_name != OUTPUT_SCHEMA_NAME {
            return Err(EngineError::schema(format!(
                "unexpected record schema {:?} in {}",
                record.schema_name,
                path.display()
            )));
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn cas() -> (TempDir, ObjectStore) {
        let dir = TempDir::new().unwrap();
        let cas = ObjectStore::open(dir.path()).unwrap();
        (dir, cas)
    }

    fn tiny_policy() -> ChunkPolicy {
        ChunkPolicy {
            threshold: 8,
            chunk_size: 4,
        }
    }

    #[test]
    fn test_payload_at_threshold_does_not_chunk() {
        let (_dir, cas) = cas();
        let bytes = [7u8; 8];
        let (object, format) =
            store_payload(&cas, RecordKind::Ast, Some("json"), &bytes, tiny_policy()).unwrap();
        assert_eq!(format.as_deref(), Some("json"));
        assert_eq!(cas.get(&object).unwrap(), bytes);
    }

    #[test]
    fn test_payload_over_threshold_chunks() {
        let (_dir, cas) = cas();
        let bytes: Vec<u8> = (0..9).collect();
        let (object, format) =
            store_payload(&cas, RecordKind::Ast, Some("json"), &bytes, tiny_policy()).unwrap();
        assert_eq!(format.as_deref(), Some(CHUNKS_FORMAT));

        let manifest: ChunkManifest =
            serde_json::from_slice(&cas.get(&object).unwrap()).unwrap();
        assert_eq!(manifest.chunks.len(), 3);
        assert_eq!(manifest.total_bytes, 9);

        assert_eq!(load_payload(&cas, &object).unwrap(), bytes);
    }

    #[test]
    fn test_load_payload_passthrough_for_plain_object() {
        let (_dir, cas) = cas();
        let object = cas.put(b"not a manifest").unwrap();
        assert_eq!(load_payload(&cas, &object).unwrap(), b"not a manifest");
    }

    #[test]
    fn test_load_payload_passthrough_for_foreign_json() {
        let (_dir, cas) = cas();
        // valid JSON, but not our chunk schema
        let object = cas.put(b"{\"schema_name\":\"something.else\"}").unwrap();
        assert_eq!(
            load_payload(&cas, &object).unwrap(),
            b"{\"schema_name\":\"something.else\"}"
        );
    }

    proptest! {
        #[test]
        fn prop_chunk_roundtrip(len in 0usize..200) {
            let (_dir, cas) = cas();
            let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let (object, _format) =
                store_payload(&cas, RecordKind::Ast, None, &bytes, tiny_policy()).unwrap();
            prop_assert_eq!(load_payload(&cas, &object).unwrap(), bytes);
        }
    }
}
