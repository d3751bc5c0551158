use crate::sequence::ByteOrGap;
use std::collections::HashSet;

/// One position inside an n-gram window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Token {
    /// The window reaches past either end of the sequence.
    OutOfRange,
    /// An unlearned position.
    Gap,
    Byte(u8),
}

impl From<ByteOrGap> for Token {
    fn from(value: ByteOrGap) -> Self {
        match value {
            Some(b) => Token::Byte(b),
            None => Token::Gap,
        }
    }
}

pub type NGram = Box<[Token]>;
pub type NGramSet = HashSet<NGram>;

/// Builds the set of width-`n` fragments of `sequence`.
///
/// Windows start at `-(n - 1)` and end at `len - 1`, so every byte appears in
/// `n` fragments including its context at both ends of the message.
pub fn ngrams(sequence: &[ByteOrGap], n: usize) -> NGramSet {
    let n = n.max(1);
    let len = sequence.len() as isize;
    let first = -(n as isize - 1);

    (first..len)
        .map(|start| {
            (start..start + n as isize)
                .map(|pos| {
                    if pos < 0 || pos >= len {
                        Token::OutOfRange
                    } else {
                        Token::from(sequence[pos as usize])
                    }
                })
                .collect::<NGram>()
        })
        .collect()
}

/// Dice distance `1 - 2|X ∩ Y| / (|X| + |Y|)` between two fragment sets.
pub fn dice_distance(x: &NGramSet, y: &NGramSet) -> f64 {
    let total = x.len() + y.len();
    if total == 0 {
        return 0.0;
    }
    let (small, large) = if x.len() <= y.len() { (x, y) } else { (y, x) };
    let shared = small.iter().filter(|gram| large.contains(*gram)).count();
    1.0 - (2.0 * shared as f64) / total as f64
}
