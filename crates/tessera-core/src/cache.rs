//! Program cache: sub-models and their compiled blobs in one buffer
//!
//! ```text
//! count: u64
//! repeated count times:
//!   backend_tag:    i32
//!   subgraph:       u64 length + bincode(Graph)
//!   owns_subgraph:  u8
//!   input_indices:  u64 count + i32 each
//!   output_indices: u64 count + i32 each
//!   backend_cache:  u64 length + bytes
//! ```
//!
//! Integers are little-endian. Tensor indices keep the signed form of
//! [`TensorIndex::encode`].

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tessera_ir::{Graph, OperandType};

use crate::error::{Error, Result};
use crate::partition::{BackendKind, GraphArena, SubModel, TensorIndex};

/// Cache handed to [`crate::Program::build`]. An empty buffer asks for a
/// fresh build, which fills it in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub buffer: Vec<u8>,
    pub input_types: Vec<OperandType>,
    pub output_types: Vec<OperandType>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.input_types.clear();
        self.output_types.clear();
    }

    /// Persist the whole cache, declared types included.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        fs::write(path.as_ref(), bytes)?;
        tracing::debug!(path = %path.as_ref().display(), bytes = self.buffer.len(), "cache_written");
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let cache: Cache = bincode::deserialize(&bytes)?;
        tracing::debug!(path = %path.as_ref().display(), bytes = cache.buffer.len(), "cache_read");
        Ok(cache)
    }
}

/// Encoder and decoder for the sub-model table.
pub struct ProgramCache;

impl ProgramCache {
    /// Encode `sub_models` with the parallel `sub_caches` blobs.
    pub fn serialize(sub_models: &[SubModel], sub_caches: &[Vec<u8>], arena: &GraphArena) -> Result<Vec<u8>> {
        if sub_models.len() != sub_caches.len() {
            return Err(Error::corrupt_cache(format!(
                "{} sub-models but {} backend caches",
                sub_models.len(),
                sub_caches.len()
            )));
        }
        let mut writer = Writer::default();
        writer.u64(sub_models.len() as u64);
        for (sub_model, blob) in sub_models.iter().zip(sub_caches) {
            writer.i32(sub_model.backend.tag());
            writer.bytes(&arena.get(sub_model.graph)?.to_bytes()?);
            writer.u8(u8::from(sub_model.owns_subgraph));
            writer.indices(&sub_model.inputs);
            writer.indices(&sub_model.outputs);
            writer.bytes(blob);
        }
        Ok(writer.buf)
    }

    /// Decode a buffer produced by [`ProgramCache::serialize`]. Sub-graphs
    /// are placed in `arena`; the whole buffer must be consumed.
    pub fn deserialize(bytes: &[u8], arena: &mut GraphArena) -> Result<(Vec<SubModel>, Vec<Vec<u8>>)> {
        let mut reader = Reader { bytes, pos: 0 };
        let count = reader.u64()?;
        // Every entry takes at least 37 bytes, which bounds a corrupt count.
        if count > (bytes.len() / 37) as u64 {
            return Err(Error::corrupt_cache(format!("{count} sub-models cannot fit in {} bytes", bytes.len())));
        }
        let mut sub_models = Vec::with_capacity(count as usize);
        let mut sub_caches = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let backend = BackendKind::from_tag(reader.i32()?)?;
            let graph = Graph::from_bytes(reader.bytes()?)
                .map_err(|err| Error::corrupt_cache(format!("sub-graph does not decode: {err}")))?;
            let owns_subgraph = match reader.u8()? {
                0 => false,
                1 => true,
                other => return Err(Error::corrupt_cache(format!("ownership flag {other}"))),
            };
            let inputs = reader.indices()?;
            let outputs = reader.indices()?;
            let blob = reader.bytes()?.to_vec();
            if inputs.len() != graph.input_operands().len() || outputs.len() != graph.output_operands().len() {
                return Err(Error::corrupt_cache("tensor index tables do not match the sub-graph contract"));
            }
            sub_models.push(SubModel {
                backend,
                graph: arena.insert_owned(graph),
                owns_subgraph,
                inputs,
                outputs,
                from_cache: true,
            });
            sub_caches.push(blob);
        }
        if reader.pos != bytes.len() {
            return Err(Error::corrupt_cache(format!(
                "{} trailing bytes after {count} sub-models",
                bytes.len() - reader.pos
            )));
        }
        Ok((sub_models, sub_caches))
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    fn indices(&mut self, indices: &[TensorIndex]) {
        self.u64(indices.len() as u64);
        for index in indices {
            self.i32(index.encode());
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                Error::corrupt_cache(format!(
                    "needed {len} bytes at offset {}, {} remain",
                    self.pos,
                    self.bytes.len() - self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize> {
        usize::try_from(self.u64()?).map_err(|_| Error::corrupt_cache("length does not fit in memory"))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.len()?;
        self.take(len)
    }

    fn indices(&mut self) -> Result<Vec<TensorIndex>> {
        let count = self.len()?;
        let raw = self.take(count.checked_mul(4).ok_or_else(|| Error::corrupt_cache("index count overflows"))?)?;
        Ok(raw
            .chunks_exact(4)
            .map(|chunk| TensorIndex::decode(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_ir::OperationType;

    use crate::partition::{GraphPartitioner, SupportTables};

    fn partitioned(arena: &mut GraphArena) -> Vec<SubModel> {
        let mut graph = Graph::new();
        let x = graph.add_input(OperandType::float32([3]));
        let t = graph.add_operand(OperandType::float32([3]));
        let y = graph.add_operand(OperandType::float32([3]));
        graph.add_operation(OperationType::Identity, [x], [t]).unwrap();
        graph.add_operation(OperationType::Relu, [t], [y]).unwrap();
        graph.mark_output(y).unwrap();
        GraphPartitioner::new(SupportTables {
            gpu: Vec::new(),
            host: vec![OperationType::Identity],
        })
        .partition(&Arc::new(graph), arena)
        .unwrap()
    }

    #[test]
    fn decoded_table_matches_the_encoded_one() {
        let mut arena = GraphArena::new();
        let sub_models = partitioned(&mut arena);
        let blobs = vec![Vec::new(), vec![7, 8, 9]];
        let bytes = ProgramCache::serialize(&sub_models, &blobs, &arena).unwrap();

        let mut decoded_arena = GraphArena::new();
        let (decoded, decoded_blobs) = ProgramCache::deserialize(&bytes, &mut decoded_arena).unwrap();
        assert_eq!(decoded_blobs, blobs);
        for (original, decoded) in sub_models.iter().zip(&decoded) {
            assert_eq!(original.backend, decoded.backend);
            assert_eq!(original.inputs, decoded.inputs);
            assert_eq!(original.outputs, decoded.outputs);
            assert!(decoded.from_cache);
            assert!(decoded_arena.owns(decoded.graph));
            assert_eq!(
                **arena.get(original.graph).unwrap(),
                **decoded_arena.get(decoded.graph).unwrap()
            );
        }
    }

    #[test]
    fn leftover_and_short_buffers_are_corrupt() {
        let mut arena = GraphArena::new();
        let sub_models = partitioned(&mut arena);
        let bytes = ProgramCache::serialize(&sub_models, &[Vec::new(), Vec::new()], &arena).unwrap();

        let mut longer = bytes.clone();
        longer.push(0);
        let err = ProgramCache::deserialize(&longer, &mut GraphArena::new()).unwrap_err();
        assert!(matches!(err, Error::CorruptCache(_)));

        let err = ProgramCache::deserialize(&bytes[..bytes.len() - 1], &mut GraphArena::new()).unwrap_err();
        assert!(matches!(err, Error::CorruptCache(_)));
    }

    #[test]
    fn unknown_backend_tag_is_rejected() {
        let mut bytes = 1u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.resize(64, 0);
        let err = ProgramCache::deserialize(&bytes, &mut GraphArena::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedBackend(7)));
    }

    #[test]
    fn cache_file_keeps_declared_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("program.cache");
        let cache = Cache {
            buffer: vec![1, 2, 3],
            input_types: vec![OperandType::float32([1, 3])],
            output_types: vec![OperandType::float32([1, 3])],
        };
        cache.write_to_file(&path).unwrap();
        assert_eq!(Cache::read_from_file(&path).unwrap(), cache);
    }
}
