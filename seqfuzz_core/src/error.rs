use std::path::PathBuf;
use thiserror::Error;

/// Returned by any cooperative operation whose [`CancelToken`](crate::process::CancelToken)
/// was triggered. The partial result of the interrupted operation has no meaning
/// and is always discarded.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation was cancelled")]
pub struct Cancelled;

/// Errors raised while validating or reading a fuzz library file.
#[derive(Error, Debug)]
pub enum LibraryError {
    /// The path does not exist or is not a regular file.
    #[error("Library file {0:?} does not exist or is not a file")]
    NotAFile(PathBuf),

    /// The file exists but contains no bytes at all.
    #[error("Library file {0:?} is empty")]
    Empty(PathBuf),

    /// A line (1-based) carries no fuzz value.
    #[error("Library file {path:?} has an empty line at line {line}")]
    EmptyLine { path: PathBuf, line: usize },

    /// An I/O error occurred while reading the library.
    #[error("Library I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err.to_string())
    }
}

/// Errors raised while configuring an [`InjectedStructure`](crate::structure::InjectedStructure).
#[derive(Error, Debug)]
pub enum StructureError {
    /// The block index does not exist.
    #[error("Block index {0} is out of range")]
    BlockOutOfRange(usize),

    /// Injection settings only apply to variable blocks.
    #[error("Block {0} is a fixed block and cannot carry injection settings")]
    NotVariable(usize),

    /// A block was created from an empty set of observed instances.
    #[error("A block needs at least one observed instance")]
    NoInstances,

    /// The library attached to a block failed validation.
    #[error("Invalid library: {0}")]
    Library(#[from] LibraryError),

    /// The structure could not be (de)serialized.
    #[error("Structure serialization error: {0}")]
    Serialization(String),

    /// An I/O error occurred while loading or saving a structure.
    #[error("Structure I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StructureError {
    fn from(err: std::io::Error) -> Self {
        StructureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StructureError {
    fn from(err: serde_json::Error) -> Self {
        StructureError::Serialization(format!("JSON operation error: {}", err))
    }
}

/// Errors raised while writing or persisting recordings.
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Recording I/O error: {0}")]
    Io(String),

    #[error("Recording index serialization error: {0}")]
    Serialization(String),

    #[error("Output path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),
}

impl From<std::io::Error> for RecordingError {
    fn from(err: std::io::Error) -> Self {
        RecordingError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RecordingError {
    fn from(err: serde_json::Error) -> Self {
        RecordingError::Serialization(err.to_string())
    }
}

/// Errors raised while loading captured messages.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture path {0:?} does not exist")]
    NotFound(PathBuf),

    #[error("Capture I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}
