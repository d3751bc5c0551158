//! Produces fuzzed messages from an [`InjectedStructure`].
//!
//! The generator is a resumable state machine: each call to
//! [`MessageGenerator::next_message`] yields one message, or `None` once a
//! finite configuration has run out of library lines.

use crate::error::LibraryError;
use crate::library::Library;
use crate::structure::{InjectedStructure, InjectionMethod, ProtocolBlock};
use rand::Rng;
use rand_core::RngCore;

#[derive(Debug, Clone)]
struct VariableSlot {
    max_length: usize,
    library: Option<Library>,
}

#[derive(Debug, Clone)]
enum Segment {
    Fixed(Vec<u8>),
    /// Index into the variable slots.
    Variable(usize),
}

#[derive(Debug, Clone)]
pub struct MessageGenerator {
    segments: Vec<Segment>,
    variables: Vec<VariableSlot>,
    method: InjectionMethod,
    finite: bool,
    /// Variable slot whose library is being walked (finite `Separate` only).
    current_block: usize,
    current_line: usize,
}

impl MessageGenerator {
    /// Loads every attached library into memory.
    pub fn new(structure: &InjectedStructure) -> Result<Self, LibraryError> {
        let mut segments = Vec::with_capacity(structure.blocks().len());
        let mut variables = Vec::new();
        for block in structure.blocks() {
            match block.block() {
                ProtocolBlock::Fixed { bytes } => segments.push(Segment::Fixed(bytes.clone())),
                ProtocolBlock::Variable { max_length, .. } => {
                    let library = match block.library() {
                        Some(library) => Some(Library::load(&library.path)?),
                        None => None,
                    };
                    segments.push(Segment::Variable(variables.len()));
                    variables.push(VariableSlot {
                        max_length: *max_length,
                        library,
                    });
                }
            }
        }
        let finite = !variables.is_empty() && variables.iter().all(|v| v.library.is_some());
        Ok(Self {
            segments,
            variables,
            method: structure.method(),
            finite,
            current_block: 0,
            current_line: 0,
        })
    }

    pub fn is_finite(&self) -> bool {
        self.finite
    }

    /// Messages still to come from a finite generator, `None` when unbounded.
    pub fn remaining(&self) -> Option<u64> {
        if !self.finite {
            return None;
        }
        let lines = |slot: &VariableSlot| slot.library.as_ref().map_or(0, Library::len);
        let remaining = match self.method {
            InjectionMethod::Simultaneous => {
                lines(&self.variables[0]).saturating_sub(self.current_line)
            }
            InjectionMethod::Separate => self
                .variables
                .iter()
                .enumerate()
                .skip(self.current_block)
                .map(|(k, slot)| {
                    if k == self.current_block {
                        lines(slot).saturating_sub(self.current_line)
                    } else {
                        lines(slot)
                    }
                })
                .sum(),
        };
        Some(remaining as u64)
    }

    pub fn next_message<R: RngCore>(&mut self, rng: &mut R) -> Option<Vec<u8>> {
        let values = match (self.method, self.finite) {
            (InjectionMethod::Simultaneous, false) => {
                let max = self.variables.iter().map(|v| v.max_length).max().unwrap_or(0);
                let value = random_bytes(rng, max);
                vec![value; self.variables.len()]
            }
            (InjectionMethod::Simultaneous, true) => {
                let line = self.variables[0]
                    .library
                    .as_ref()?
                    .line(self.current_line)?
                    .to_vec();
                self.current_line += 1;
                vec![line; self.variables.len()]
            }
            (InjectionMethod::Separate, false) => self
                .variables
                .iter()
                .map(|slot| match &slot.library {
                    Some(library) => library.random_line(rng).to_vec(),
                    None => random_bytes(rng, slot.max_length),
                })
                .collect(),
            (InjectionMethod::Separate, true) => {
                let line = self.advance_separate()?;
                let current = self.current_block;
                self.variables
                    .iter()
                    .enumerate()
                    .map(|(k, slot)| {
                        if k == current {
                            line.clone()
                        } else {
                            slot.library
                                .as_ref()
                                .map(|library| library.random_line(rng).to_vec())
                                .unwrap_or_default()
                        }
                    })
                    .collect()
            }
        };
        Some(self.assemble(&values))
    }

    /// Takes the next line of the current block, moving on to the following
    /// block once the current one is used up.
    fn advance_separate(&mut self) -> Option<Vec<u8>> {
        loop {
            let library = self.variables.get(self.current_block)?.library.as_ref()?;
            if let Some(line) = library.line(self.current_line) {
                self.current_line += 1;
                return Some(line.to_vec());
            }
            self.current_block += 1;
            self.current_line = 0;
        }
    }

    fn assemble(&self, values: &[Vec<u8>]) -> Vec<u8> {
        let mut message = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Fixed(bytes) => message.extend_from_slice(bytes),
                Segment::Variable(k) => message.extend_from_slice(&values[*k]),
            }
        }
        message
    }

    /// Iterates over messages drawing randomness from `rng`.
    pub fn messages<R: RngCore>(self, rng: R) -> Messages<R> {
        Messages {
            generator: self,
            rng,
        }
    }
}

fn random_bytes<R: RngCore>(rng: &mut R, max_length: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; rng.random_range(0..=max_length)];
    rng.fill_bytes(&mut buffer);
    buffer
}

/// Iterator adapter returned by [`MessageGenerator::messages`].
#[derive(Debug)]
pub struct Messages<R> {
    generator: MessageGenerator,
    rng: R,
}

impl<R: RngCore> Iterator for Messages<R> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.generator.next_message(&mut self.rng)
    }
}
