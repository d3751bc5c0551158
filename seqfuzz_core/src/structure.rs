//! Learned protocol structures and their fuzzing configuration.
//!
//! A [`ProtocolStructure`] is the plain result of learning: an ordered list of
//! fixed and variable blocks. An [`InjectedStructure`] decorates the same
//! blocks with the data source each variable block is fuzzed from and the
//! structure-wide [`InjectionMethod`].

use crate::error::StructureError;
use crate::library;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// One region of a protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProtocolBlock {
    /// Identical in every observed message.
    Fixed { bytes: Vec<u8> },
    /// Differs between messages; observed widths lie in `min_length..=max_length`.
    Variable { min_length: usize, max_length: usize },
}

impl ProtocolBlock {
    /// Classifies a block from the contents observed for it: `Fixed` when all
    /// instances agree, `Variable` spanning their lengths otherwise.
    pub fn from_instances(instances: &[Vec<u8>]) -> Result<Self, StructureError> {
        let first = instances.first().ok_or(StructureError::NoInstances)?;
        let distinct: HashSet<&[u8]> = instances.iter().map(Vec::as_slice).collect();
        if distinct.len() == 1 {
            return Ok(ProtocolBlock::Fixed {
                bytes: first.clone(),
            });
        }
        let lengths = instances.iter().map(Vec::len);
        Ok(ProtocolBlock::Variable {
            min_length: lengths.clone().min().unwrap_or(0),
            max_length: lengths.max().unwrap_or(0),
        })
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, ProtocolBlock::Variable { .. })
    }
}

/// Ordered blocks of a learned protocol.
///
/// Adjacent blocks never share a classification: building through
/// [`ProtocolStructure::from_blocks`] or [`ProtocolStructure::push`] folds
/// neighbouring fixed blocks into one and sums neighbouring variable ones.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtocolStructure {
    blocks: Vec<ProtocolBlock>,
}

impl ProtocolStructure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blocks<I: IntoIterator<Item = ProtocolBlock>>(blocks: I) -> Self {
        let mut structure = Self::new();
        for block in blocks {
            structure.push(block);
        }
        structure
    }

    pub fn push(&mut self, block: ProtocolBlock) {
        if let Some(block) = fold_into(self.blocks.last_mut(), block) {
            self.blocks.push(block);
        }
    }

    pub fn blocks(&self) -> &[ProtocolBlock] {
        &self.blocks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ProtocolBlock> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn save_json(&self, path: &Path) -> Result<(), StructureError> {
        let file = File::create(path).map_err(|e| {
            StructureError::Io(format!("Failed to create structure file {:?}: {}", path, e))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self, StructureError> {
        let file = File::open(path).map_err(|e| {
            StructureError::Io(format!("Failed to open structure file {:?}: {}", path, e))
        })?;
        let loaded: Self = serde_json::from_reader(BufReader::new(file))?;
        // Re-normalise in case the file was edited by hand.
        Ok(Self::from_blocks(loaded.blocks))
    }
}

/// Folds `block` into `last` when both have the same classification. Returns
/// the block when it still has to be appended; empty fixed blocks vanish.
fn fold_into(last: Option<&mut ProtocolBlock>, block: ProtocolBlock) -> Option<ProtocolBlock> {
    match (last, block) {
        (Some(ProtocolBlock::Fixed { bytes }), ProtocolBlock::Fixed { bytes: more }) => {
            bytes.extend(more);
            None
        }
        (
            Some(ProtocolBlock::Variable {
                min_length,
                max_length,
            }),
            ProtocolBlock::Variable {
                min_length: more_min,
                max_length: more_max,
            },
        ) => {
            *min_length += more_min;
            *max_length += more_max;
            None
        }
        (_, ProtocolBlock::Fixed { bytes }) if bytes.is_empty() => None,
        (_, block) => Some(block),
    }
}

impl<'a> IntoIterator for &'a ProtocolStructure {
    type Item = &'a ProtocolBlock;
    type IntoIter = std::slice::Iter<'a, ProtocolBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}

/// Where the fuzz values of a variable block come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSource {
    #[default]
    Random,
    LibraryFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionMethod {
    /// Every variable block carries the same value in a message.
    Simultaneous,
    /// Variable blocks are fuzzed independently of each other.
    #[default]
    Separate,
}

/// A validated library attached to a variable block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRef {
    pub path: PathBuf,
    pub line_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedBlock {
    block: ProtocolBlock,
    source: DataSource,
    library: Option<LibraryRef>,
}

impl InjectedBlock {
    fn new(block: ProtocolBlock) -> Self {
        Self {
            block,
            source: DataSource::Random,
            library: None,
        }
    }

    pub fn block(&self) -> &ProtocolBlock {
        &self.block
    }

    pub fn is_variable(&self) -> bool {
        self.block.is_variable()
    }

    /// Always `Random` for fixed blocks.
    pub fn source(&self) -> DataSource {
        self.source
    }

    pub fn library(&self) -> Option<&LibraryRef> {
        self.library.as_ref()
    }

    fn set_source(&mut self, source: DataSource) {
        self.source = source;
        self.library = None;
    }

    fn set_library(&mut self, library: LibraryRef) {
        self.source = DataSource::LibraryFile;
        self.library = Some(library);
    }
}

/// A protocol structure together with how each variable block is fuzzed.
///
/// Cloning is deep, so a running fuzzer can own its copy while the caller
/// keeps editing the original.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectedStructure {
    blocks: Vec<InjectedBlock>,
    method: InjectionMethod,
}

impl InjectedStructure {
    pub fn from_structure(structure: &ProtocolStructure) -> Self {
        Self {
            blocks: structure.iter().cloned().map(InjectedBlock::new).collect(),
            method: InjectionMethod::default(),
        }
    }

    /// Appends a block classified from its observed instances and returns the
    /// index of the block now holding it. Content classified like the last
    /// block is merged into it; empty fixed content adds nothing and yields
    /// `None`.
    pub fn add_block(&mut self, instances: &[Vec<u8>]) -> Result<Option<usize>, StructureError> {
        let block = ProtocolBlock::from_instances(instances)?;
        let empty = matches!(&block, ProtocolBlock::Fixed { bytes } if bytes.is_empty());
        let last = self.blocks.last_mut().map(|b| &mut b.block);
        let Some(block) = fold_into(last, block) else {
            return Ok(if empty { None } else { self.blocks.len().checked_sub(1) });
        };
        self.blocks.push(InjectedBlock::new(block));
        let index = self.blocks.len() - 1;
        if self.method == InjectionMethod::Simultaneous && self.blocks[index].is_variable() {
            self.propagate_first_variable();
        }
        Ok(Some(index))
    }

    pub fn blocks(&self) -> &[InjectedBlock] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&InjectedBlock> {
        self.blocks.get(index)
    }

    /// Indices of the variable blocks, in message order.
    pub fn variable_indices(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_variable())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn variable_blocks(&self) -> impl Iterator<Item = &InjectedBlock> {
        self.blocks.iter().filter(|b| b.is_variable())
    }

    pub fn method(&self) -> InjectionMethod {
        self.method
    }

    pub fn set_method(&mut self, method: InjectionMethod) {
        self.method = method;
        if method == InjectionMethod::Simultaneous {
            self.propagate_first_variable();
        }
    }

    fn variable_mut(&mut self, index: usize) -> Result<&mut InjectedBlock, StructureError> {
        let block = self
            .blocks
            .get_mut(index)
            .ok_or(StructureError::BlockOutOfRange(index))?;
        if !block.is_variable() {
            return Err(StructureError::NotVariable(index));
        }
        Ok(block)
    }

    /// Switches a variable block's data source. Any attached library is
    /// dropped; use [`InjectedStructure::set_library`] to attach one.
    pub fn set_source(&mut self, index: usize, source: DataSource) -> Result<(), StructureError> {
        self.variable_mut(index)?.set_source(source);
        if self.method == InjectionMethod::Simultaneous {
            self.propagate_from(index);
        }
        Ok(())
    }

    /// Validates `path` and makes it the data source of a variable block.
    /// Returns the library's line count.
    pub fn set_library(&mut self, index: usize, path: &Path) -> Result<usize, StructureError> {
        self.variable_mut(index)?;
        let line_count = library::validate(path)?;
        self.variable_mut(index)?.set_library(LibraryRef {
            path: path.to_path_buf(),
            line_count,
        });
        if self.method == InjectionMethod::Simultaneous {
            self.propagate_from(index);
        }
        Ok(line_count)
    }

    fn propagate_first_variable(&mut self) {
        if let Some(first) = self.blocks.iter().position(InjectedBlock::is_variable) {
            self.propagate_from(first);
        }
    }

    fn propagate_from(&mut self, index: usize) {
        let source = self.blocks[index].source;
        let library = self.blocks[index].library.clone();
        for block in self.blocks.iter_mut().filter(|b| b.is_variable()) {
            block.source = source;
            block.library = library.clone();
        }
    }

    /// True iff there is at least one variable block and every variable block
    /// reads from a library.
    pub fn is_finite(&self) -> bool {
        let mut variables = self.variable_blocks().peekable();
        variables.peek().is_some() && variables.all(|b| b.library.is_some())
    }

    /// Number of messages a finite structure yields, `None` when unbounded.
    pub fn message_count(&self) -> Option<u64> {
        if !self.is_finite() {
            return None;
        }
        let mut counts = self
            .variable_blocks()
            .filter_map(|b| b.library.as_ref().map(|l| l.line_count as u64));
        match self.method {
            InjectionMethod::Separate => Some(counts.sum()),
            InjectionMethod::Simultaneous => counts.next(),
        }
    }

    /// The learned blocks without injection settings.
    pub fn structure(&self) -> ProtocolStructure {
        ProtocolStructure::from_blocks(self.blocks.iter().map(|b| b.block.clone()))
    }
}
