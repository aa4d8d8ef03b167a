use std::path::PathBuf;

use thiserror::Error;

use crate::test_spec::TestId;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("test {0} is not assigned to any group in the group file")]
    UngroupedTest(TestId),
    #[error("an unchunked run must have exactly one chunk, but {0} were requested")]
    UnchunkedWithMultipleChunks(usize),
    #[error("chunk {this_chunk} does not exist in a run of {total_chunks} chunks")]
    ChunkOutOfRange {
        this_chunk: usize,
        total_chunks: usize,
    },
    #[error("failed to read group file {}", path.display())]
    GroupFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse group file {}", path.display())]
    GroupFileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
