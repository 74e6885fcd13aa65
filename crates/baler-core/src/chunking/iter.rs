use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// A lazy, restartable cursor over an ordered domain that can jump back to a
/// previously recorded position.
///
/// After [`rewind`](Self::rewind) the cursor sits on the first item (if any).
/// A position identifies the item the cursor is on. `seek(p)` puts the cursor
/// back on the item whose position is `p`, so `seek(p); advance()` continues
/// with exactly the item that followed `p` in the original run.
pub trait SeekableIterator {
    type Key: Clone + Debug;
    type Item;
    type Position: Clone + Debug + PartialEq + Serialize + DeserializeOwned;

    /// Reset to the first item.
    fn rewind(&mut self) -> Result<()>;

    /// `false` once the sequence is exhausted.
    fn is_valid(&self) -> bool;

    fn current(&self) -> Option<&Self::Item>;

    fn key(&self) -> Option<Self::Key>;

    /// Move to the next item.
    fn advance(&mut self) -> Result<()>;

    /// Persistable position of the current item; `None` when not valid.
    fn position(&self) -> Option<Self::Position>;

    /// Reposition onto the item at `position`.
    ///
    /// Returns `Ok(false)` when the position is stale or invalid (e.g. the
    /// file it references is gone). That is recoverable for the caller, who
    /// must treat it as a failed chunk rather than silently restarting.
    fn seek(&mut self, position: &Self::Position) -> Result<bool>;

    /// Completion estimate in percent; `None` when undefined.
    fn progress_percent(&self) -> Option<f64> {
        None
    }

    /// Release held resources (open handles) without losing the position.
    fn stop_iteration(&mut self) {}
}

/// Iterator over an in-memory list. Key and position are the item index.
#[derive(Debug, Clone)]
pub struct VecIterator<T> {
    items: Vec<T>,
    index: usize,
}

impl<T> VecIterator<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, index: 0 }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> SeekableIterator for VecIterator<T> {
    type Key = usize;
    type Item = T;
    type Position = usize;

    fn rewind(&mut self) -> Result<()> {
        self.index = 0;
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.index < self.items.len()
    }

    fn current(&self) -> Option<&T> {
        self.items.get(self.index)
    }

    fn key(&self) -> Option<usize> {
        self.is_valid().then_some(self.index)
    }

    fn advance(&mut self) -> Result<()> {
        if self.index < self.items.len() {
            self.index += 1;
        }
        Ok(())
    }

    fn position(&self) -> Option<usize> {
        self.key()
    }

    fn seek(&mut self, position: &usize) -> Result<bool> {
        if *position >= self.items.len() {
            return Ok(false);
        }
        self.index = *position;
        Ok(true)
    }

    fn progress_percent(&self) -> Option<f64> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.index.min(self.items.len()) as f64 * 100.0 / self.items.len() as f64)
    }
}

/// Fixed-size byte ranges over a total length. Position is the range's start
/// offset. Used by transfers and by the installer's segment hashing.
#[derive(Debug, Clone)]
pub struct ByteRangeIterator {
    total: u64,
    chunk: u64,
    offset: u64,
    current: Option<(u64, u64)>,
}

impl ByteRangeIterator {
    pub fn new(total: u64, chunk: u64) -> Self {
        let mut it = Self {
            total,
            chunk: chunk.max(1),
            offset: 0,
            current: None,
        };
        it.refresh();
        it
    }

    fn refresh(&mut self) {
        self.current = (self.offset < self.total)
            .then(|| (self.offset, self.chunk.min(self.total - self.offset)));
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

impl SeekableIterator for ByteRangeIterator {
    type Key = u64;
    /// `(offset, length)`
    type Item = (u64, u64);
    type Position = u64;

    fn rewind(&mut self) -> Result<()> {
        self.offset = 0;
        self.refresh();
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn current(&self) -> Option<&(u64, u64)> {
        self.current.as_ref()
    }

    fn key(&self) -> Option<u64> {
        self.current.map(|(offset, _)| offset)
    }

    fn advance(&mut self) -> Result<()> {
        if let Some((offset, len)) = self.current {
            self.offset = offset + len;
            self.refresh();
        }
        Ok(())
    }

    fn position(&self) -> Option<u64> {
        self.key()
    }

    fn seek(&mut self, position: &u64) -> Result<bool> {
        if *position >= self.total || *position % self.chunk != 0 {
            return Ok(false);
        }
        self.offset = *position;
        self.refresh();
        Ok(true)
    }

    fn progress_percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let done = self.current.map(|(o, _)| o).unwrap_or(self.total);
        Some(done as f64 * 100.0 / self.total as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collect the keys yielded after seeking to `p` and advancing once.
    fn resume_keys<I: SeekableIterator>(it: &mut I, p: &I::Position) -> Vec<I::Key> {
        assert!(it.seek(p).unwrap());
        it.advance().unwrap();
        let mut out = Vec::new();
        while it.is_valid() {
            out.push(it.key().unwrap());
            it.advance().unwrap();
        }
        out
    }

    #[test]
    fn vec_iterator_resumes_after_every_position() {
        let mut it = VecIterator::new(vec!['a', 'b', 'c', 'd']);
        for p in 0..4 {
            let expected: Vec<usize> = (p + 1..4).collect();
            assert_eq!(resume_keys(&mut it, &p), expected);
        }
        assert!(!it.seek(&4).unwrap());
    }

    #[test]
    fn byte_ranges_cover_total_exactly() {
        let mut it = ByteRangeIterator::new(10, 4);
        let mut ranges = Vec::new();
        while let Some(r) = it.current().copied() {
            ranges.push(r);
            it.advance().unwrap();
        }
        assert_eq!(ranges, vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(resume_keys(&mut it, &4), vec![8]);
        assert!(!it.seek(&5).unwrap());
        assert!(!it.seek(&12).unwrap());
    }

    #[test]
    fn progress_is_monotonic() {
        let mut it = ByteRangeIterator::new(100, 30);
        let mut last = -1.0;
        while it.is_valid() {
            let p = it.progress_percent().unwrap();
            assert!(p >= last);
            last = p;
            it.advance().unwrap();
        }
        assert_eq!(it.progress_percent(), Some(100.0));
        assert_eq!(ByteRangeIterator::new(0, 1).progress_percent(), None);
    }
}
