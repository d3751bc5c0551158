//! Loading captured protocol messages from disk.

use crate::error::CaptureError;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// One captured message and the file it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// Reads every capture named by `paths`.
///
/// A path may be a file or a directory, whose regular files are read (without
/// descending into subdirectories; hidden files are skipped). Empty files are
/// dropped, as are files whose content has the same MD5 digest as one already
/// loaded. The result is sorted by path so learning is reproducible.
pub fn load_captures(paths: &[PathBuf]) -> Result<Vec<Capture>, CaptureError> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
        } else if path.is_dir() {
            for entry in fs::read_dir(path).map_err(|e| {
                CaptureError::Io(format!("Failed to read capture directory {:?}: {}", path, e))
            })? {
                let entry_path = entry?.path();
                let hidden = entry_path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
                if entry_path.is_file() && !hidden {
                    files.push(entry_path);
                }
            }
        } else {
            return Err(CaptureError::NotFound(path.clone()));
        }
    }
    files.sort();
    files.dedup();

    let mut seen = HashSet::new();
    let mut captures = Vec::with_capacity(files.len());
    for path in files {
        let data = read_capture(&path)?;
        if data.is_empty() {
            log::debug!("Skipping empty capture {:?}", path);
            continue;
        }
        if !seen.insert(md5::compute(&data).0) {
            log::debug!("Skipping duplicate capture {:?}", path);
            continue;
        }
        captures.push(Capture { path, data });
    }
    log::info!("Loaded {} distinct captures", captures.len());
    Ok(captures)
}

fn read_capture(path: &Path) -> Result<Vec<u8>, CaptureError> {
    fs::read(path)
        .map_err(|e| CaptureError::Io(format!("Failed to read capture file {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_files_and_directories_sorted() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("more");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("b.bin"), b"second").unwrap();
        fs::write(nested.join("a.bin"), b"first").unwrap();
        fs::write(nested.join(".hidden"), b"ignored").unwrap();
        let single = dir.path().join("z.bin");
        fs::write(&single, b"third").unwrap();

        let captures = load_captures(&[single.clone(), nested.clone()]).unwrap();
        let data: Vec<&[u8]> = captures.iter().map(|c| c.data.as_slice()).collect();
        assert_eq!(data, vec![&b"first"[..], b"second", b"third"]);
        assert_eq!(captures[0].path, nested.join("a.bin"));
    }

    #[test]
    fn empty_and_duplicate_files_are_dropped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("1.bin"), b"HELLO").unwrap();
        fs::write(dir.path().join("2.bin"), b"HELLO").unwrap();
        fs::write(dir.path().join("3.bin"), b"").unwrap();
        fs::write(dir.path().join("4.bin"), b"WORLD").unwrap();

        let captures = load_captures(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(captures.len(), 2);
        assert_eq!(captures[0].path, dir.path().join("1.bin"));
        assert_eq!(captures[1].data, b"WORLD");
    }

    #[test]
    fn missing_path_is_an_error() {
        let dir = tempdir().unwrap();
        let result = load_captures(&[dir.path().join("nope")]);
        assert!(matches!(result, Err(CaptureError::NotFound(_))));
    }
}
