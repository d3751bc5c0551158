use crate::sequence::ByteOrGap;

/// Neighbours on each side taken into account when scoring a position.
pub const WINDOW_RADIUS: usize = 3;
/// A fixed position whose neighbourhood scores above this becomes a gap.
pub const GAP_THRESHOLD: i32 = 0;

/// Turns isolated fixed bytes sitting in mostly-gap neighbourhoods back into
/// gaps, repeating until nothing changes.
///
/// Gaps score `+1`. A fixed byte scores `-1`, minus one more per fixed
/// immediate neighbour. Positions closer than `WINDOW_RADIUS + 1` to either end
/// are never touched.
pub fn clean(sequence: &[ByteOrGap]) -> Vec<ByteOrGap> {
    let mut cleaned = sequence.to_vec();
    let len = cleaned.len();
    let margin = WINDOW_RADIUS + 1;
    if len < 2 * margin {
        return cleaned;
    }

    let mut scores = vec![0i32; len];
    loop {
        for (i, score) in scores.iter_mut().enumerate() {
            *score = position_score(&cleaned, i);
        }

        let mut changed = false;
        for i in margin..len - margin {
            if cleaned[i].is_none() {
                continue;
            }
            let window: i32 = scores[i - WINDOW_RADIUS..=i + WINDOW_RADIUS].iter().sum();
            if window - scores[i] > GAP_THRESHOLD {
                cleaned[i] = None;
                changed = true;
            }
        }
        if !changed {
            return cleaned;
        }
    }
}

fn position_score(sequence: &[ByteOrGap], i: usize) -> i32 {
    if sequence[i].is_none() {
        return 1;
    }
    let left = i > 0 && sequence[i - 1].is_some();
    let right = i + 1 < sequence.len() && sequence[i + 1].is_some();
    -1 - i32::from(left) - i32::from(right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::to_sequence;
    use rand::Rng;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn short_sequences_are_untouched() {
        let seq = vec![None, Some(1), None, None, None, None, None];
        assert_eq!(clean(&seq), seq);
    }

    #[test]
    fn isolated_byte_in_gap_run_is_removed() {
        let mut seq = vec![None; 11];
        seq[5] = Some(b'x');
        assert_eq!(clean(&seq), vec![None; 11]);
    }

    #[test]
    fn solid_fixed_runs_survive() {
        let seq = to_sequence(b"HELLO WORLD");
        assert_eq!(clean(&seq), seq);
    }

    #[test]
    fn isolated_byte_near_the_edge_is_kept() {
        let mut seq = vec![None; 11];
        seq[2] = Some(b'x');
        seq[8] = Some(b'y');
        assert_eq!(clean(&seq), seq);
    }

    #[test]
    fn clean_is_idempotent() {
        let mut rng = ChaCha8Rng::from_seed([5; 32]);
        for _ in 0..200 {
            let len = rng.random_range(0..40);
            let seq: Vec<ByteOrGap> = (0..len)
                .map(|_| {
                    if rng.random_bool(0.5) {
                        None
                    } else {
                        Some(rng.random())
                    }
                })
                .collect();
            let once = clean(&seq);
            assert_eq!(once.len(), seq.len());
            assert_eq!(clean(&once), once);
        }
    }
}
