//! Requests, responses and crashes captured during a fuzzing run.
//!
//! Each recording is written to its own temporary file the moment it is made,
//! so a run that is cancelled or fails keeps everything recorded so far.
//! [`Recordings::persist`] later moves the files into an output directory
//! next to a JSON index.

use crate::error::RecordingError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingKind {
    Request,
    Response,
    Crash,
}

impl RecordingKind {
    fn as_str(&self) -> &'static str {
        match self {
            RecordingKind::Request => "request",
            RecordingKind::Response => "response",
            RecordingKind::Crash => "crash",
        }
    }
}

#[derive(Debug)]
pub struct Recording {
    kind: RecordingKind,
    timestamp: SystemTime,
    len: usize,
    file: NamedTempFile,
}

impl Recording {
    pub fn kind(&self) -> RecordingKind {
        self.kind
    }

    pub fn is_crash(&self) -> bool {
        self.kind == RecordingKind::Crash
    }

    /// When the exchange happened. For crashes this is the first failed
    /// attempt, not the moment the crash was declared.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn read_data(&self) -> Result<Vec<u8>, RecordingError> {
        Ok(fs::read(self.file.path())?)
    }
}

/// Entry of the `recordings.json` index written by [`Recordings::persist`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingIndexEntry {
    pub file: String,
    pub kind: RecordingKind,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub len: usize,
}

/// Time-ordered recordings of one run.
#[derive(Debug, Default)]
pub struct Recordings {
    staging_dir: Option<PathBuf>,
    entries: Vec<Recording>,
}

impl Recordings {
    pub const INDEX_FILENAME: &'static str = "recordings.json";

    /// Stages recording files in the system temp directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages recording files in `dir`, which must exist. Staging on the same
    /// filesystem as the output directory lets `persist` rename instead of
    /// copy.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: Some(dir.into()),
            entries: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        kind: RecordingKind,
        data: &[u8],
        timestamp: SystemTime,
    ) -> Result<(), RecordingError> {
        let mut file = match &self.staging_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        file.write_all(data)?;
        file.flush()?;
        self.entries.push(Recording {
            kind,
            timestamp,
            len: data.len(),
            file,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Recording> {
        self.entries.iter()
    }

    pub fn crash_count(&self) -> usize {
        self.entries.iter().filter(|r| r.is_crash()).count()
    }

    /// Moves every recording into `out_dir` as `NNNNNN-kind.bin` and writes
    /// the index. Returns the index entries in recording order.
    pub fn persist(self, out_dir: &Path) -> Result<Vec<RecordingIndexEntry>, RecordingError> {
        if out_dir.exists() && !out_dir.is_dir() {
            return Err(RecordingError::NotADirectory(out_dir.to_path_buf()));
        }
        fs::create_dir_all(out_dir).map_err(|e| {
            RecordingError::Io(format!("Failed to create output dir {:?}: {}", out_dir, e))
        })?;

        let mut index = Vec::with_capacity(self.entries.len());
        for (i, recording) in self.entries.into_iter().enumerate() {
            let name = format!("{:06}-{}.bin", i, recording.kind.as_str());
            let destination = out_dir.join(&name);
            if let Err(e) = recording.file.persist(&destination) {
                // Renaming fails across filesystems; fall back to copying.
                fs::copy(e.file.path(), &destination).map_err(|e| {
                    RecordingError::Io(format!("Failed to write {:?}: {}", destination, e))
                })?;
            }
            index.push(RecordingIndexEntry {
                file: name,
                kind: recording.kind,
                timestamp_ms: recording
                    .timestamp
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
                len: recording.len,
            });
        }

        let index_path = out_dir.join(Self::INDEX_FILENAME);
        let writer = BufWriter::new(File::create(&index_path).map_err(|e| {
            RecordingError::Io(format!("Failed to create index {:?}: {}", index_path, e))
        })?);
        serde_json::to_writer_pretty(writer, &index)?;
        log::info!("Persisted {} recordings to {:?}", index.len(), out_dir);
        Ok(index)
    }
}

impl<'a> IntoIterator for &'a Recordings {
    type Item = &'a Recording;
    type IntoIter = std::slice::Iter<'a, Recording>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn records_are_written_immediately() {
        let mut recordings = Recordings::new();
        let now = SystemTime::now();
        recordings.record(RecordingKind::Request, b"GET /", now).unwrap();
        recordings.record(RecordingKind::Crash, b"\x00\xff", now).unwrap();

        assert_eq!(recordings.len(), 2);
        assert_eq!(recordings.crash_count(), 1);
        let crash = recordings.iter().nth(1).unwrap();
        assert!(crash.is_crash());
        assert_eq!(crash.read_data().unwrap(), b"\x00\xff");
        assert!(crash.path().exists());
    }

    #[test]
    fn persist_moves_files_and_writes_index() {
        let staging = tempdir().unwrap();
        let out = tempdir().unwrap();
        let out_dir = out.path().join("run");
        let start = UNIX_EPOCH + Duration::from_millis(1_000);

        let mut recordings = Recordings::in_dir(staging.path());
        recordings.record(RecordingKind::Request, b"req", start).unwrap();
        recordings
            .record(RecordingKind::Response, b"resp", start + Duration::from_millis(5))
            .unwrap();
        let staged: Vec<PathBuf> = recordings.iter().map(|r| r.path().to_path_buf()).collect();

        let index = recordings.persist(&out_dir).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].file, "000000-request.bin");
        assert_eq!(index[1].kind, RecordingKind::Response);
        assert_eq!(index[1].timestamp_ms, 1_005);
        assert_eq!(fs::read(out_dir.join("000001-response.bin")).unwrap(), b"resp");
        assert!(staged.iter().all(|p| !p.exists()));

        let written: Vec<RecordingIndexEntry> = serde_json::from_str(
            &fs::read_to_string(out_dir.join(Recordings::INDEX_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(written, index);
    }

    #[test]
    fn persist_rejects_file_as_output() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("not_a_dir");
        fs::write(&file_path, b"x").unwrap();
        let result = Recordings::new().persist(&file_path);
        assert!(matches!(result, Err(RecordingError::NotADirectory(_))));
    }
}
