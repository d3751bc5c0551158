//! Pool of sequences awaiting merge, and the closest-pair selection that
//! drives the merge order.
//!
//! Sequences live in an arena ([`SequencePool`]) and are referred to by opaque
//! [`SequenceId`]s. Pairwise distances are kept in a separate symmetric table
//! keyed by id pair, so merging a pair only has to drop the rows of the two ids.

use crate::ngram::{NGramSet, dice_distance, ngrams};
use crate::sequence::ByteOrGap;
use std::collections::HashMap;
use std::thread;

/// Below this many missing pairs the distance table is filled inline.
const PARALLEL_PAIR_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(u64);

/// A captured or merged message taking part in learning.
#[derive(Debug, Clone)]
pub struct LearnSequence {
    pub id: SequenceId,
    pub items: Vec<ByteOrGap>,
    pub ngrams: NGramSet,
}

fn pair_key(a: SequenceId, b: SequenceId) -> (SequenceId, SequenceId) {
    if a <= b { (a, b) } else { (b, a) }
}

#[derive(Debug)]
pub struct SequencePool {
    sequences: Vec<LearnSequence>,
    distances: HashMap<(SequenceId, SequenceId), f64>,
    next_id: u64,
    ngram_size: usize,
    threads: usize,
}

impl SequencePool {
    /// `threads` bounds the workers used to fill the distance table.
    pub fn new(ngram_size: usize, threads: usize) -> Self {
        Self {
            sequences: Vec::new(),
            distances: HashMap::new(),
            next_id: 0,
            ngram_size: ngram_size.max(1),
            threads: threads.max(1),
        }
    }

    /// Adds a sequence, computing its n-grams eagerly.
    pub fn push(&mut self, items: Vec<ByteOrGap>) -> SequenceId {
        let id = SequenceId(self.next_id);
        self.next_id += 1;
        let ngrams = ngrams(&items, self.ngram_size);
        self.sequences.push(LearnSequence { id, items, ngrams });
        id
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LearnSequence> {
        self.sequences.get(index)
    }

    /// Number of cached pairwise distances.
    pub fn cached_distances(&self) -> usize {
        self.distances.len()
    }

    /// Dice distance between the sequences at two pool positions.
    pub fn distance(&mut self, i: usize, j: usize) -> f64 {
        let key = pair_key(self.sequences[i].id, self.sequences[j].id);
        if let Some(d) = self.distances.get(&key) {
            return *d;
        }
        let d = dice_distance(&self.sequences[i].ngrams, &self.sequences[j].ngrams);
        self.distances.insert(key, d);
        d
    }

    fn fill_distances(&mut self) {
        let count = self.sequences.len();
        let missing: Vec<(usize, usize)> = (0..count)
            .flat_map(|i| (i + 1..count).map(move |j| (i, j)))
            .filter(|&(i, j)| {
                !self
                    .distances
                    .contains_key(&pair_key(self.sequences[i].id, self.sequences[j].id))
            })
            .collect();
        if missing.is_empty() {
            return;
        }

        let sequences = &self.sequences;
        let compute = |pairs: &[(usize, usize)]| -> Vec<((SequenceId, SequenceId), f64)> {
            pairs
                .iter()
                .map(|&(i, j)| {
                    (
                        pair_key(sequences[i].id, sequences[j].id),
                        dice_distance(&sequences[i].ngrams, &sequences[j].ngrams),
                    )
                })
                .collect()
        };

        let computed = if self.threads > 1 && missing.len() >= PARALLEL_PAIR_THRESHOLD {
            let chunk = missing.len().div_ceil(self.threads);
            thread::scope(|scope| {
                let workers: Vec<_> = missing
                    .chunks(chunk)
                    .map(|pairs| scope.spawn(move || compute(pairs)))
                    .collect();
                workers
                    .into_iter()
                    .flat_map(|worker| match worker.join() {
                        Ok(results) => results,
                        Err(panic) => std::panic::resume_unwind(panic),
                    })
                    .collect::<Vec<_>>()
            })
        } else {
            compute(&missing)
        };

        log::debug!("Computed {} pairwise distances", computed.len());
        self.distances.extend(computed);
    }

    /// Picks the next pair to merge as `(lower, higher)` pool positions.
    ///
    /// Each raw distance is corrected by both sequences' average distance to
    /// the rest of the pool, where the average divides by `count - 2`. The
    /// smallest corrected distance wins and ties go to the first pair in
    /// row-major order. Returns `None` with fewer than two sequences.
    pub fn select_pair(&mut self) -> Option<(usize, usize)> {
        let count = self.sequences.len();
        if count < 2 {
            return None;
        }
        if count == 2 {
            return Some((0, 1));
        }

        self.fill_distances();
        let mut matrix = vec![vec![0.0f64; count]; count];
        for i in 0..count {
            for j in i + 1..count {
                let d = self.distance(i, j);
                matrix[i][j] = d;
                matrix[j][i] = d;
            }
        }

        let denominator = (count - 2) as f64;
        let averages: Vec<f64> = (0..count)
            .map(|i| {
                let sum: f64 = (0..count).filter(|&j| j != i).map(|j| matrix[i][j]).sum();
                sum / denominator
            })
            .collect();

        let mut best = f64::MAX;
        let mut pair = (0, 1);
        for i in 0..count {
            for j in 0..count {
                let adjusted = if i == j {
                    f64::MAX
                } else {
                    matrix[i][j] - averages[i] - averages[j]
                };
                if adjusted < best {
                    best = adjusted;
                    pair = (i, j);
                }
            }
        }
        Some((pair.0.min(pair.1), pair.0.max(pair.1)))
    }

    /// Replaces the sequences at `lower` and `higher` by `merged`, which takes
    /// the `lower` slot. Distance entries of both old ids are dropped.
    pub fn replace_pair(
        &mut self,
        lower: usize,
        higher: usize,
        merged: Vec<ByteOrGap>,
    ) -> SequenceId {
        debug_assert!(lower < higher && higher < self.sequences.len());
        let stale = [self.sequences[lower].id, self.sequences[higher].id];
        self.distances
            .retain(|(a, b), _| !stale.contains(a) && !stale.contains(b));

        let id = SequenceId(self.next_id);
        self.next_id += 1;
        let ngrams = ngrams(&merged, self.ngram_size);
        self.sequences.remove(higher);
        self.sequences[lower] = LearnSequence {
            id,
            items: merged,
            ngrams,
        };
        id
    }

    /// Takes the remaining sequence once the pool has been merged down to one.
    pub fn into_single(mut self) -> Option<Vec<ByteOrGap>> {
        if self.sequences.len() == 1 {
            self.sequences.pop().map(|s| s.items)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::to_sequence;

    fn pool_of(samples: &[&[u8]], threads: usize) -> SequencePool {
        let mut pool = SequencePool::new(3, threads);
        for sample in samples {
            pool.push(to_sequence(sample));
        }
        pool
    }

    #[test]
    fn worked_example_selects_bbc_and_bbcc() {
        let mut pool = pool_of(&[b"abc", b"aabbc", b"bbc", b"ab", b"bbcc"], 1);
        assert_eq!(pool.select_pair(), Some((2, 4)));
    }

    #[test]
    fn selection_is_deterministic() {
        let mut pool = pool_of(&[b"abc", b"aabbc", b"bbc", b"ab", b"bbcc"], 1);
        let first = pool.select_pair();
        for _ in 0..5 {
            assert_eq!(pool.select_pair(), first);
        }
    }

    #[test]
    fn two_or_fewer_sequences() {
        let mut pool = pool_of(&[b"x"], 1);
        assert_eq!(pool.select_pair(), None);
        pool.push(to_sequence(b"completely different"));
        assert_eq!(pool.select_pair(), Some((0, 1)));
    }

    #[test]
    fn replace_pair_drops_stale_distances() {
        let mut pool = pool_of(&[b"abc", b"aabbc", b"bbc", b"ab", b"bbcc"], 1);
        pool.select_pair();
        assert_eq!(pool.cached_distances(), 10);

        let merged = to_sequence(b"bbc");
        let new_id = pool.replace_pair(2, 4, merged.clone());
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.get(2).map(|s| s.id), Some(new_id));
        assert_eq!(pool.get(2).map(|s| s.items.clone()), Some(merged));
        // Only pairs among the three untouched sequences remain.
        assert_eq!(pool.cached_distances(), 3);
    }

    #[test]
    fn threaded_fill_matches_inline_fill() {
        let samples: Vec<Vec<u8>> = (0..20u8)
            .map(|i| format!("MSG {:02} payload={}", i, (i as u32) * 7919).into_bytes())
            .collect();
        let refs: Vec<&[u8]> = samples.iter().map(|s| s.as_slice()).collect();
        let mut inline = pool_of(&refs, 1);
        let mut threaded = pool_of(&refs, 4);
        assert_eq!(inline.select_pair(), threaded.select_pair());
        assert_eq!(threaded.cached_distances(), 20 * 19 / 2);
    }
}
