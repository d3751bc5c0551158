/// A learned byte (`Some`) or a variable, unlearned position (`None`).
pub type ByteOrGap = Option<u8>;

pub fn to_sequence(bytes: &[u8]) -> Vec<ByteOrGap> {
    bytes.iter().copied().map(Some).collect()
}

/// Printable rendering used in logs: gaps become `?`, non-printable bytes
/// become `.`.
pub fn render(sequence: &[ByteOrGap]) -> String {
    sequence
        .iter()
        .map(|item| match item {
            None => '?',
            Some(b) if b.is_ascii_graphic() || *b == b' ' => *b as char,
            Some(_) => '.',
        })
        .collect()
}

pub fn gap_count(sequence: &[ByteOrGap]) -> usize {
    sequence.iter().filter(|item| item.is_none()).count()
}
