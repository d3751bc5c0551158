//! Fuzz libraries: plain files holding one fuzz value per line.
//!
//! A line is injected as its raw bytes, without the line terminator (`\n`, or
//! `\r\n`). A trailing terminator at the end of the file does not start
//! another line.

use crate::error::LibraryError;
use rand::Rng;
use rand_core::RngCore;
use std::fs;
use std::path::{Path, PathBuf};

fn split_lines(content: &[u8]) -> Vec<&[u8]> {
    let body = content.strip_suffix(b"\n").unwrap_or(content);
    body.split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect()
}

fn read_checked(path: &Path) -> Result<Vec<u8>, LibraryError> {
    if !path.is_file() {
        return Err(LibraryError::NotAFile(path.to_path_buf()));
    }
    let content = fs::read(path)
        .map_err(|e| LibraryError::Io(format!("Failed to read library {:?}: {}", path, e)))?;
    if content.is_empty() {
        return Err(LibraryError::Empty(path.to_path_buf()));
    }
    if let Some(index) = split_lines(&content).iter().position(|line| line.is_empty()) {
        return Err(LibraryError::EmptyLine {
            path: path.to_path_buf(),
            line: index + 1,
        });
    }
    Ok(content)
}

/// Checks that `path` is a usable library and returns its line count.
pub fn validate(path: &Path) -> Result<usize, LibraryError> {
    read_checked(path).map(|content| split_lines(&content).len())
}

/// A validated library held in memory.
#[derive(Debug, Clone)]
pub struct Library {
    path: PathBuf,
    lines: Vec<Vec<u8>>,
}

impl Library {
    pub fn load(path: &Path) -> Result<Self, LibraryError> {
        let content = read_checked(path)?;
        let lines = split_lines(&content)
            .into_iter()
            .map(<[u8]>::to_vec)
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never zero for a loaded library.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn line(&self, index: usize) -> Option<&[u8]> {
        self.lines.get(index).map(Vec::as_slice)
    }

    pub fn random_line<R: RngCore>(&self, rng: &mut R) -> &[u8] {
        &self.lines[rng.random_range(0..self.lines.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use tempfile::tempdir;

    #[test]
    fn line_count_ignores_final_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lib.txt");
        fs::write(&path, b"AAAA\nBB\r\n%s%s%s\n").unwrap();
        assert_eq!(validate(&path).unwrap(), 3);

        let library = Library::load(&path).unwrap();
        assert_eq!(library.line(0), Some(&b"AAAA"[..]));
        assert_eq!(library.line(1), Some(&b"BB"[..]));
        assert_eq!(library.line(2), Some(&b"%s%s%s"[..]));
        assert_eq!(library.line(3), None);
    }

    #[test]
    fn rejects_missing_empty_and_blank_lines() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            validate(&dir.path().join("missing")),
            Err(LibraryError::NotAFile(_))
        ));
        assert!(matches!(validate(dir.path()), Err(LibraryError::NotAFile(_))));

        let empty = dir.path().join("empty.txt");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(validate(&empty), Err(LibraryError::Empty(_))));

        let blank = dir.path().join("blank.txt");
        fs::write(&blank, b"one\n\nthree\n").unwrap();
        match validate(&blank) {
            Err(LibraryError::EmptyLine { line, .. }) => assert_eq!(line, 2),
            other => panic!("Expected EmptyLine, got {other:?}"),
        }
    }

    #[test]
    fn random_line_stays_in_library() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lib.txt");
        fs::write(&path, b"x\ny\nz").unwrap();
        let library = Library::load(&path).unwrap();
        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        for _ in 0..50 {
            let line = library.random_line(&mut rng);
            assert!([&b"x"[..], b"y", b"z"].contains(&line));
        }
    }
}
