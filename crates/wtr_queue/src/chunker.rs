//! Restricting a run to one chunk of the full test set, so that several machines can share it.
//!
//! Chunking happens before grouping: a chunker decides which tests this machine runs at all,
//! and a [GroupPolicy](crate::GroupPolicy) then decides how those tests are grouped.

use serde_derive::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::hash::bucket_of;
use crate::test_spec::{Test, TestsByType};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChunkType {
    /// Run everything.
    #[default]
    None,
    /// Assign each test to a chunk by the hash of its id.
    Hash,
    /// Assign each test to a chunk by the hash of its directory, so a directory is never split.
    DirHash {
        /// How many leading directories to hash. `None` hashes the full directory path.
        #[serde(default)]
        depth: Option<usize>,
    },
}

/// Selects the tests of chunk `this_chunk` (counting from 1) out of `total_chunks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunker {
    chunk_type: ChunkType,
    chunk_minus_one: usize,
    total_chunks: usize,
}

impl Chunker {
    pub fn new(
        chunk_type: ChunkType,
        this_chunk: usize,
        total_chunks: usize,
    ) -> Result<Self, QueueError> {
        if !(1..=total_chunks).contains(&this_chunk) {
            return Err(QueueError::ChunkOutOfRange {
                this_chunk,
                total_chunks,
            });
        }
        if chunk_type == ChunkType::None && total_chunks != 1 {
            return Err(QueueError::UnchunkedWithMultipleChunks(total_chunks));
        }
        Ok(Self {
            chunk_type,
            chunk_minus_one: this_chunk - 1,
            total_chunks,
        })
    }

    pub fn unchunked() -> Self {
        Self {
            chunk_type: ChunkType::None,
            chunk_minus_one: 0,
            total_chunks: 1,
        }
    }

    pub fn test_matches(&self, test: &Test) -> bool {
        match &self.chunk_type {
            ChunkType::None => true,
            ChunkType::Hash => {
                bucket_of(test.id.as_str(), self.total_chunks) == self.chunk_minus_one
            }
            ChunkType::DirHash { depth } => {
                let dirs = test.url_dirs();
                let depth = depth.unwrap_or(dirs.len()).min(dirs.len());
                let dir = dirs[..depth].join("/");
                bucket_of(&dir, self.total_chunks) == self.chunk_minus_one
            }
        }
    }

    /// Keeps only the tests in this chunk, preserving order. Buckets left empty are dropped.
    pub fn filter(&self, tests: TestsByType) -> TestsByType {
        if self.chunk_type == ChunkType::None {
            return tests;
        }
        tests
            .into_iter()
            .filter_map(|(key, tests)| {
                let tests: Vec<_> = tests
                    .into_iter()
                    .filter(|test| self.test_matches(test))
                    .collect();
                (!tests.is_empty()).then_some((key, tests))
            })
            .collect()
    }
}
