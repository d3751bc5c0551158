//! Linear-space global alignment (Hirschberg) of two gapped sequences.
//!
//! The result is a single merged sequence: positions where both inputs agree
//! keep their byte, every other position becomes a gap. The merged width is
//! always `max(|a|, |b|)`.

use crate::error::Cancelled;
use crate::process::CancelToken;
use crate::sequence::ByteOrGap;
use std::iter;

/// Cost of inserting or deleting one position.
pub const GAP_PENALTY: u32 = 2;
pub const EQUAL_WEIGHT: u32 = 0;
/// Two different digits, or two different letters (case-insensitive).
pub const CLASS_MISMATCH_WEIGHT: u32 = 1;
pub const HARD_MISMATCH_WEIGHT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Digit,
    Letter,
}

fn char_class(b: u8) -> Option<CharClass> {
    if b.is_ascii_digit() {
        Some(CharClass::Digit)
    } else if b.is_ascii_alphabetic() {
        Some(CharClass::Letter)
    } else {
        None
    }
}

/// Substitution weight between two positions.
pub fn weight(a: ByteOrGap, b: ByteOrGap) -> u32 {
    if a == b {
        return EQUAL_WEIGHT;
    }
    match (a, b) {
        (Some(x), Some(y)) => match (char_class(x), char_class(y)) {
            (Some(cx), Some(cy)) if cx == cy => CLASS_MISMATCH_WEIGHT,
            _ => HARD_MISMATCH_WEIGHT,
        },
        _ => HARD_MISMATCH_WEIGHT,
    }
}

/// Aligns `a` with `b` and returns the merged sequence.
///
/// On cancellation the partial work is dropped and `Err(Cancelled)` returned.
pub fn align(
    a: &[ByteOrGap],
    b: &[ByteOrGap],
    cancel: &CancelToken,
) -> Result<Vec<ByteOrGap>, Cancelled> {
    let mut merged = Vec::with_capacity(a.len().max(b.len()));
    hirschberg(a, b, cancel, &mut merged)?;
    Ok(merged)
}

fn hirschberg(
    a: &[ByteOrGap],
    b: &[ByteOrGap],
    cancel: &CancelToken,
    out: &mut Vec<ByteOrGap>,
) -> Result<(), Cancelled> {
    cancel.check()?;
    let (m, n) = (a.len(), b.len());

    if n == 0 {
        out.extend(iter::repeat_n(None, m));
        return Ok(());
    }
    if m == 0 {
        out.extend(iter::repeat_n(None, n));
        return Ok(());
    }
    if m == 1 {
        place_single(a[0], b, out);
        return Ok(());
    }
    if n == 1 {
        place_single(b[0], a, out);
        return Ok(());
    }

    let mid = m / 2;
    let forward = last_row_costs(&a[..mid], b, cancel)?;
    let a_tail: Vec<ByteOrGap> = a[mid..].iter().rev().copied().collect();
    let b_rev: Vec<ByteOrGap> = b.iter().rev().copied().collect();
    let backward = last_row_costs(&a_tail, &b_rev, cancel)?;

    let (lo, hi) = split_bounds(m, n, mid);
    let mut split = lo;
    let mut best = u32::MAX;
    for k in lo..=hi {
        let cost = forward[k] + backward[n - k];
        if cost < best {
            best = cost;
            split = k;
        }
    }

    hirschberg(&a[..mid], &b[..split], cancel, out)?;
    hirschberg(&a[mid..], &b[split..], cancel, out)
}

/// Split columns that keep `max(mid, k) + max(m - mid, n - k) == max(m, n)`.
fn split_bounds(m: usize, n: usize, mid: usize) -> (usize, usize) {
    if m >= n {
        ((n + mid).saturating_sub(m), mid.min(n))
    } else {
        (mid, n - m + mid)
    }
}

/// Aligns one position against `long`: it lands on the last exact match,
/// everything else is a gap.
fn place_single(item: ByteOrGap, long: &[ByteOrGap], out: &mut Vec<ByteOrGap>) {
    let hit = item.and_then(|_| long.iter().rposition(|other| *other == item));
    out.extend((0..long.len()).map(|j| if Some(j) == hit { item } else { None }));
}

/// Edit costs of `a` against every prefix of `b`, keeping only two rows.
fn last_row_costs(
    a: &[ByteOrGap],
    b: &[ByteOrGap],
    cancel: &CancelToken,
) -> Result<Vec<u32>, Cancelled> {
    let n = b.len();
    let mut prev: Vec<u32> = (0..=n as u32).map(|j| j * GAP_PENALTY).collect();
    let mut cur = vec![0u32; n + 1];

    for &x in a {
        cancel.check()?;
        cur[0] = prev[0] + GAP_PENALTY;
        for j in 1..=n {
            let substitute = prev[j - 1] + weight(x, b[j - 1]);
            let delete = prev[j] + GAP_PENALTY;
            let insert = cur[j - 1] + GAP_PENALTY;
            cur[j] = substitute.min(delete).min(insert);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    Ok(prev)
}
