pub mod align;
pub mod capture;
pub mod clean;
pub mod cluster;
pub mod config;
pub mod error;
pub mod fuzz;
pub mod generator;
pub mod learn;
pub mod library;
pub mod ngram;
pub mod process;
pub mod recording;
pub mod rng;
pub mod sequence;
pub mod structure;
pub mod transmit;

pub use capture::{Capture, load_captures};
pub use config::SeqfuzzConfig;
pub use error::{CaptureError, Cancelled, LibraryError, RecordingError, StructureError};
pub use fuzz::{FuzzReport, FuzzSettings, FuzzingLoop, RecordingPolicy, spawn_fuzzing};
pub use generator::MessageGenerator;
pub use learn::{LearnSettings, StructureLearner, spawn_learning};
pub use library::Library;
pub use process::{
    CancelToken, ProcessEvent, ProcessHandle, ProcessOutcome, ProcessState, Progress,
    ProgressReporter,
};
pub use recording::{Recording, RecordingKind, Recordings};
pub use rng::SharedRng;
pub use sequence::ByteOrGap;
pub use structure::{
    DataSource, InjectedBlock, InjectedStructure, InjectionMethod, ProtocolBlock,
    ProtocolStructure,
};
pub use transmit::{TargetAddress, TcpTransmitter, TransmitOutcome, Transmitter};
