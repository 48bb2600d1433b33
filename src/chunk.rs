//! Chunk: the half-open slot range passed between modules.

use std::fmt;
use std::ops::Range;

/// A half-open range of slot indices `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Chunk {
    begin: u32,
    end: u32,
}

impl Chunk {
    /// Create a chunk. `begin` must not exceed `end`.
    pub fn new(begin: u32, end: u32) -> Self {
        debug_assert!(begin <= end, "chunk begin {} past end {}", begin, end);
        Self { begin, end }
    }

    /// Chunk of `len` slots starting at `begin`.
    pub fn with_len(begin: u32, len: u32) -> Self {
        Self::new(begin, begin + len)
    }

    pub fn begin(&self) -> u32 {
        self.begin
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Slot indices covered by this chunk.
    pub fn range(&self) -> Range<u32> {
        self.begin..self.end
    }

    /// Split into consecutive pieces of at most `size` slots, in ascending order.
    pub fn split(&self, size: u32) -> Splits {
        Splits {
            next: self.begin,
            end: self.end,
            size: size.max(1),
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.begin, self.end)
    }
}

/// Iterator produced by [`Chunk::split`].
#[derive(Debug, Clone)]
pub struct Splits {
    next: u32,
    end: u32,
    size: u32,
}

impl Iterator for Splits {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next >= self.end {
            return None;
        }
        let end = self.end.min(self.next.saturating_add(self.size));
        let piece = Chunk::new(self.next, end);
        self.next = end;
        Some(piece)
    }
}
