//! Structure learning: merge captured messages pairwise until one consensus
//! sequence is left, then cut it into fixed and variable blocks.

use crate::align::align;
use crate::clean::clean;
use crate::cluster::SequencePool;
use crate::error::Cancelled;
use crate::process::{CancelToken, ProcessHandle, ProcessOutcome, ProgressReporter};
use crate::sequence::{ByteOrGap, gap_count, render, to_sequence};
use crate::structure::{ProtocolBlock, ProtocolStructure};

pub const DEFAULT_NGRAM_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnSettings {
    pub ngram_size: usize,
    /// Upper bound on the workers filling the distance table.
    pub threads: usize,
}

impl Default for LearnSettings {
    fn default() -> Self {
        Self {
            ngram_size: DEFAULT_NGRAM_SIZE,
            threads: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StructureLearner {
    settings: LearnSettings,
}

impl StructureLearner {
    pub fn new(settings: LearnSettings) -> Self {
        Self { settings }
    }

    /// Learns a structure from raw captures. Empty captures are ignored.
    ///
    /// Reports `(merges_done, merges_total)` through `reporter` after every
    /// merge.
    pub fn learn(
        &self,
        captures: &[Vec<u8>],
        cancel: &CancelToken,
        reporter: &ProgressReporter,
    ) -> Result<ProtocolStructure, Cancelled> {
        let mut pool = SequencePool::new(self.settings.ngram_size, self.settings.threads);
        for capture in captures.iter().filter(|c| !c.is_empty()) {
            pool.push(to_sequence(capture));
        }
        if pool.is_empty() {
            log::warn!("No non-empty captures to learn from");
            return Ok(ProtocolStructure::new());
        }

        let total = (pool.len() - 1) as u64;
        log::info!("Learning from {} captures", pool.len());
        reporter.progress(0, Some(total));

        let mut done = 0;
        while let Some((lower, higher)) = pool.select_pair() {
            cancel.check()?;
            let (Some(a), Some(b)) = (pool.get(lower), pool.get(higher)) else {
                break;
            };
            let merged = clean(&align(&a.items, &b.items, cancel)?);
            log::debug!(
                "Merged {} and {} into {} ({} gaps)",
                lower,
                higher,
                render(&merged),
                gap_count(&merged)
            );
            pool.replace_pair(lower, higher, merged);
            done += 1;
            reporter.progress(done, Some(total));
        }

        let consensus = pool.into_single().unwrap_or_default();
        let mut blocks = segment(&consensus);
        refine_variable_lengths(&mut blocks, captures);
        let structure = ProtocolStructure::from_blocks(blocks);
        log::info!("Learned structure with {} blocks", structure.len());
        Ok(structure)
    }
}

/// Runs [`StructureLearner::learn`] on a background thread.
pub fn spawn_learning(
    captures: Vec<Vec<u8>>,
    settings: LearnSettings,
) -> std::io::Result<ProcessHandle<ProtocolStructure>> {
    ProcessHandle::spawn("seqfuzz-learn", move |cancel, reporter| {
        match StructureLearner::new(settings).learn(&captures, cancel, reporter) {
            Ok(structure) => ProcessOutcome::Finished(structure),
            Err(Cancelled) => ProcessOutcome::Cancelled(None),
        }
    })
}

/// Splits a consensus sequence into maximal runs. Byte runs become `Fixed`,
/// gap runs become `Variable` with both lengths set to the run width.
pub fn segment(sequence: &[ByteOrGap]) -> Vec<ProtocolBlock> {
    sequence
        .chunk_by(|a, b| a.is_some() == b.is_some())
        .map(|run| {
            if run[0].is_some() {
                ProtocolBlock::Fixed {
                    bytes: run.iter().flatten().copied().collect(),
                }
            } else {
                ProtocolBlock::Variable {
                    min_length: run.len(),
                    max_length: run.len(),
                }
            }
        })
        .collect()
}

/// Narrows variable lengths to the widths actually observed in the captures.
/// Blocks keep their run width when no capture could be matched.
fn refine_variable_lengths(blocks: &mut [ProtocolBlock], captures: &[Vec<u8>]) {
    let observed: Vec<Vec<usize>> = captures
        .iter()
        .filter(|c| !c.is_empty())
        .filter_map(|capture| variable_widths(blocks, capture))
        .collect();
    if observed.is_empty() {
        return;
    }

    let variables = blocks.iter_mut().filter_map(|block| match block {
        ProtocolBlock::Variable {
            min_length,
            max_length,
        } => Some((min_length, max_length)),
        ProtocolBlock::Fixed { .. } => None,
    });
    for (k, (min_length, max_length)) in variables.enumerate() {
        let widths = observed.iter().map(|w| w[k]);
        if let (Some(lo), Some(hi)) = (widths.clone().min(), widths.max()) {
            *min_length = lo;
            *max_length = hi;
        }
    }
}

/// Locates the fixed blocks in `capture` from left to right and returns the
/// width every variable block takes in it, or `None` if they don't fit.
fn variable_widths(blocks: &[ProtocolBlock], capture: &[u8]) -> Option<Vec<usize>> {
    let mut widths = Vec::new();
    let mut pos = 0;
    let mut open: Option<usize> = None;

    for (i, block) in blocks.iter().enumerate() {
        let bytes = match block {
            ProtocolBlock::Variable { .. } => {
                open = Some(pos);
                continue;
            }
            ProtocolBlock::Fixed { bytes } => bytes.as_slice(),
        };
        let rest = capture.get(pos..)?;
        let at = match open {
            // The last block has to end the message.
            Some(_) if i + 1 == blocks.len() => rest
                .ends_with(bytes)
                .then(|| pos + rest.len() - bytes.len())?,
            Some(_) => pos + rest.windows(bytes.len()).position(|w| w == bytes)?,
            None => rest.starts_with(bytes).then_some(pos)?,
        };
        if let Some(start) = open.take() {
            widths.push(at - start);
        }
        pos = at + bytes.len();
    }

    match open {
        Some(start) => widths.push(capture.len() - start),
        None if pos != capture.len() => return None,
        None => {}
    }
    Some(widths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessEvent, ProcessState};

    fn learn(captures: &[&[u8]]) -> ProtocolStructure {
        let captures: Vec<Vec<u8>> = captures.iter().map(|c| c.to_vec()).collect();
        StructureLearner::default()
            .learn(&captures, &CancelToken::new(), &ProgressReporter::detached())
            .expect("not cancelled")
    }

    #[test]
    fn digits_and_letters_share_only_the_newline() {
        let structure = learn(&[b"0123456789\n", b"abcdefgh\n"]);
        assert_eq!(
            structure.blocks(),
            &[
                ProtocolBlock::Variable {
                    min_length: 8,
                    max_length: 10
                },
                ProtocolBlock::Fixed {
                    bytes: b"\n".to_vec()
                },
            ]
        );
    }

    #[test]
    fn request_lines_keep_method_and_version() {
        let structure = learn(&[
            b"GET /index.html HTTP/1.1\r\n",
            b"GET /a.html HTTP/1.1\r\n",
            b"GET /about.html HTTP/1.1\r\n",
        ]);
        let blocks = structure.blocks();
        assert_eq!(
            blocks.first(),
            Some(&ProtocolBlock::Fixed {
                bytes: b"GET /".to_vec()
            })
        );
        assert_eq!(
            blocks.last(),
            Some(&ProtocolBlock::Fixed {
                bytes: b".html HTTP/1.1\r\n".to_vec()
            })
        );
        assert!(blocks.iter().any(ProtocolBlock::is_variable));
    }

    #[test]
    fn identical_captures_give_one_fixed_block() {
        let structure = learn(&[b"PING\r\n", b"PING\r\n"]);
        assert_eq!(
            structure.blocks(),
            &[ProtocolBlock::Fixed {
                bytes: b"PING\r\n".to_vec()
            }]
        );
    }

    #[test]
    fn no_usable_captures_give_empty_structure() {
        assert!(learn(&[]).is_empty());
        assert!(learn(&[b"", b""]).is_empty());
    }

    #[test]
    fn segment_produces_maximal_runs() {
        let seq = vec![None, None, Some(b'a'), Some(b'b'), None, Some(b'c')];
        assert_eq!(
            segment(&seq),
            vec![
                ProtocolBlock::Variable {
                    min_length: 2,
                    max_length: 2
                },
                ProtocolBlock::Fixed {
                    bytes: b"ab".to_vec()
                },
                ProtocolBlock::Variable {
                    min_length: 1,
                    max_length: 1
                },
                ProtocolBlock::Fixed {
                    bytes: b"c".to_vec()
                },
            ]
        );
        assert!(segment(&[]).is_empty());
    }

    #[test]
    fn widths_follow_fixed_anchors() {
        let blocks = segment(&[Some(b'<'), None, None, Some(b'>'), None]);
        assert_eq!(variable_widths(&blocks, b"<abcd>xy"), Some(vec![4, 2]));
        assert_eq!(variable_widths(&blocks, b"<>"), Some(vec![0, 0]));
        assert_eq!(variable_widths(&blocks, b"abcd>"), None);
    }

    #[test]
    fn cancelled_learning_returns_err() {
        let token = CancelToken::new();
        token.cancel();
        let captures = vec![b"abc".to_vec(), b"abd".to_vec()];
        let result =
            StructureLearner::default().learn(&captures, &token, &ProgressReporter::detached());
        assert_eq!(result, Err(Cancelled));
    }

    #[test]
    fn cancelling_between_merges_discards_the_run() {
        let captures: Vec<Vec<u8>> = (0..60usize)
            .map(|i| {
                (0..512usize)
                    .map(|j| ((i * 31 + j * 17 + j * j * (i + 1)) % 251) as u8)
                    .collect()
            })
            .collect();
        let mut handle = spawn_learning(captures, LearnSettings::default()).unwrap();
        loop {
            match handle.recv_event(std::time::Duration::from_secs(30)) {
                Some(ProcessEvent::Progress(progress)) if progress.done >= 1 => {
                    handle.cancel();
                    break;
                }
                Some(_) => {}
                None => panic!("learning ended before the first merge"),
            }
        }
        assert!(matches!(handle.join(), ProcessOutcome::Cancelled(None)));
    }

    #[test]
    fn background_learning_reports_merges() {
        let captures = vec![b"A=1\n".to_vec(), b"A=22\n".to_vec(), b"A=333\n".to_vec()];
        let mut handle = spawn_learning(captures, LearnSettings::default()).unwrap();
        while handle.recv_event(std::time::Duration::from_secs(5)).is_some() {}
        assert_eq!(handle.state(), ProcessState::Finished);
        assert_eq!(handle.progress().done, 2);
        assert_eq!(handle.progress().total, Some(2));
        match handle.join() {
            ProcessOutcome::Finished(structure) => assert!(!structure.is_empty()),
            other => panic!("Expected Finished, got {other:?}"),
        }
    }
}
