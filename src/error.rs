use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("failed to create output directory: {1:?}")]
    CreateOutputDir(#[source] std::io::Error, PathBuf),

    #[error("failed to create tensor file: {1:?}")]
    CreateTensorFile(#[source] std::io::Error, PathBuf),

    #[error("failed to write tensor file: {1:?}")]
    WriteTensor(#[source] std::io::Error, PathBuf),

    #[error("cannot export tensor with an empty name")]
    EmptyTensorName,

    /// Unreachable after `as_standard_layout`, kept so the slice access stays fallible.
    #[error("failed to get contiguous slice of tensor for {0:?}")]
    GetContiguousSlice(PathBuf),

    #[error("failed to read checkpoint: {1:?}")]
    ReadCheckpoint(#[source] std::io::Error, PathBuf),

    #[error("checkpoint is {0} bytes, too short to hold a header length")]
    TruncatedHeaderLength(usize),

    #[error("header length {0} exceeds checkpoint size {1}")]
    HeaderLengthOutOfBounds(u64, usize),

    #[error("failed to parse checkpoint header")]
    ParseHeader(#[source] serde_json::Error),

    #[error("unsupported dtype {1:?} for tensor {0}")]
    UnsupportedDtype(String, String),

    #[error("data offsets [{1}, {2}) of tensor {0} are out of bounds for {3} data bytes")]
    DataOffsetsOutOfBounds(String, usize, usize, usize),

    #[error("tensor {0} has {1} data bytes, expected {2} for its shape and dtype")]
    DataLengthMismatch(String, usize, usize),

    #[error("shape {1:?} of tensor {0} overflows usize")]
    ShapeOverflow(String, Vec<usize>),

    #[error("failed to construct array for tensor {1}")]
    ConstructArray(#[source] ndarray::ShapeError, String),

    #[error("no parameters found under submodule {0:?}")]
    EmptySubmodule(String),
}
