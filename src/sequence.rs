/// Row storage sequences.
///
/// A Sequence is the positional store behind a dataset. Two implementations:
/// - ArraySequence: contiguous Vec, O(1) access, O(N) insert/delete
/// - TieredVectorSequence: sqrt decomposition, O(log √N) access,
///   O(√N) delete
///
/// Which one a dataset uses is chosen with a [`StorageHint`].
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

pub trait Sequence<T>: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Option<&T>;

    fn get_mut(&mut self, index: usize) -> Option<&mut T>;

    /// Replaces the value at `index`, returning the previous one.
    fn replace(&mut self, index: usize, value: T) -> Result<T>;

    /// Removes and returns the value at `index`, shifting subsequent elements down.
    fn delete(&mut self, index: usize) -> Result<T>;

    fn append(&mut self, value: T);

    fn clear(&mut self);

    fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_>;

    fn extend_from(&mut self, values: Vec<T>) {
        for value in values {
            self.append(value);
        }
    }
}

/// Storage hint for choosing the row sequence implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageHint {
    /// Contiguous storage; best when rows are mostly loaded and read.
    #[default]
    FastReads,

    /// Tiered storage; best when rows are added and removed in the middle
    /// (partial refresh removals, local edits).
    FastUpdates,
}

/// Creates an empty sequence for the given hint.
pub fn new_sequence<T: Debug + Send + 'static>(hint: StorageHint) -> Box<dyn Sequence<T>> {
    match hint {
        StorageHint::FastReads => Box::new(ArraySequence::new()),
        StorageHint::FastUpdates => Box::new(TieredVectorSequence::new()),
    }
}

fn out_of_range(index: usize, len: usize) -> Error {
    Error::IndexOutOfRange { index, len }
}

#[derive(Debug, Clone)]
pub struct ArraySequence<T> {
    data: Vec<T>,
}

impl<T> ArraySequence<T> {
    pub fn new() -> Self {
        ArraySequence { data: Vec::new() }
    }
}

impl<T> Default for ArraySequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug + Send> Sequence<T> for ArraySequence<T> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn get(&self, index: usize) -> Option<&T> {
        self.data.get(index)
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.data.get_mut(index)
    }

    fn replace(&mut self, index: usize, value: T) -> Result<T> {
        let len = self.data.len();
        let slot = self.data.get_mut(index).ok_or_else(|| out_of_range(index, len))?;
        Ok(std::mem::replace(slot, value))
    }

    fn delete(&mut self, index: usize) -> Result<T> {
        if index >= self.data.len() {
            return Err(out_of_range(index, self.data.len()));
        }
        Ok(self.data.remove(index))
    }

    fn append(&mut self, value: T) {
        self.data.push(value);
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        Box::new(self.data.iter())
    }

    fn extend_from(&mut self, values: Vec<T>) {
        self.data.extend(values);
    }
}

/// Tiered vector using sqrt decomposition.
///
/// `blocks` hold roughly √N elements each and `block_starts[i]` is the global
/// index of the first element of block i, so lookups are a binary search over
/// block starts. Blocks split above 2·√N elements and merge below √N/4.
#[derive(Debug, Clone)]
pub struct TieredVectorSequence<T> {
    blocks: Vec<Vec<T>>,
    block_starts: Vec<usize>,
    size: usize,
}

impl<T> TieredVectorSequence<T> {
    const MIN_BLOCK_SIZE: usize = 16;
    const MAX_BLOCK_SIZE: usize = 4096;

    pub fn new() -> Self {
        TieredVectorSequence {
            blocks: Vec::new(),
            block_starts: Vec::new(),
            size: 0,
        }
    }

    fn ideal_block_size(&self) -> usize {
        if self.size == 0 {
            return Self::MIN_BLOCK_SIZE;
        }
        ((self.size as f64).sqrt() as usize).clamp(Self::MIN_BLOCK_SIZE, Self::MAX_BLOCK_SIZE)
    }

    /// Returns (block index, offset within block).
    fn locate(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.size {
            return None;
        }
        let block = match self.block_starts.binary_search(&index) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        Some((block, index - self.block_starts[block]))
    }

    /// One element left block `after`; later blocks start one earlier.
    fn shift_block_starts(&mut self, after: usize) {
        for start in self.block_starts.iter_mut().skip(after + 1) {
            *start -= 1;
        }
    }

    fn maybe_split(&mut self, block: usize) {
        let threshold = 2 * self.ideal_block_size();
        if self.blocks[block].len() <= threshold {
            return;
        }
        let mid = self.blocks[block].len() / 2;
        let tail = self.blocks[block].split_off(mid);
        let tail_start = self.block_starts[block] + mid;
        self.blocks.insert(block + 1, tail);
        self.block_starts.insert(block + 1, tail_start);
    }

    fn maybe_merge(&mut self, block: usize) {
        if self.blocks[block].is_empty() {
            self.blocks.remove(block);
            self.block_starts.remove(block);
            return;
        }
        if self.blocks.len() <= 1 {
            return;
        }
        let ideal = self.ideal_block_size();
        if self.blocks[block].len() >= ideal / 4 {
            return;
        }

        let has_next = block + 1 < self.blocks.len();
        let prefer_next = has_next
            && (block == 0 || self.blocks[block + 1].len() <= self.blocks[block - 1].len());

        if prefer_next && self.blocks[block].len() + self.blocks[block + 1].len() <= 2 * ideal {
            let next = self.blocks.remove(block + 1);
            self.block_starts.remove(block + 1);
            self.blocks[block].extend(next);
        } else if block > 0
            && self.blocks[block - 1].len() + self.blocks[block].len() <= 2 * ideal
        {
            let current = self.blocks.remove(block);
            self.block_starts.remove(block);
            self.blocks[block - 1].extend(current);
        }
    }
}

impl<T> Default for TieredVectorSequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug + Send> Sequence<T> for TieredVectorSequence<T> {
    fn len(&self) -> usize {
        self.size
    }

    fn get(&self, index: usize) -> Option<&T> {
        self.locate(index)
            .map(|(block, offset)| &self.blocks[block][offset])
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        let (block, offset) = self.locate(index)?;
        Some(&mut self.blocks[block][offset])
    }

    fn replace(&mut self, index: usize, value: T) -> Result<T> {
        let size = self.size;
        let slot = self.get_mut(index).ok_or_else(|| out_of_range(index, size))?;
        Ok(std::mem::replace(slot, value))
    }

    fn delete(&mut self, index: usize) -> Result<T> {
        let (block, offset) = self
            .locate(index)
            .ok_or_else(|| out_of_range(index, self.size))?;
        let value = self.blocks[block].remove(offset);
        self.size -= 1;
        self.shift_block_starts(block);
        self.maybe_merge(block);
        Ok(value)
    }

    fn append(&mut self, value: T) {
        if self.blocks.is_empty() {
            self.blocks.push(Vec::new());
            self.block_starts.push(0);
        }
        let last = self.blocks.len() - 1;
        self.blocks[last].push(value);
        self.size += 1;
        self.maybe_split(last);
    }

    fn clear(&mut self) {
        self.blocks.clear();
        self.block_starts.clear();
        self.size = 0;
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        Box::new(self.blocks.iter().flatten())
    }
}
