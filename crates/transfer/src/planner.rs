use crate::TransferError;

/// One contiguous byte range `[start, end)` of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkDescriptor {
    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Splits an object of `total_size` bytes into `chunk_size` pieces.
///
/// The plan is a pure function of its two inputs. Every call to
/// [`iter`](Self::iter) starts a fresh pass, so a plan can be replayed
/// after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkPlan {
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::ZeroChunkSize);
        }
        let count = total_size.div_ceil(chunk_size);
        let total_chunks =
            u32::try_from(count).map_err(|_| TransferError::TooManyChunks(count))?;
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `⌈total_size / chunk_size⌉`; zero for an empty object.
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Descriptor for `index`, or `None` past the end.
    pub fn descriptor(&self, index: u32) -> Option<ChunkDescriptor> {
        if index >= self.total_chunks {
            return None;
        }
        let start = u64::from(index) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        Some(ChunkDescriptor { index, start, end })
    }

    /// Planned byte length of `index`, or `None` past the end.
    pub fn expected_len(&self, index: u32) -> Option<u64> {
        self.descriptor(index).map(|d| d.len())
    }

    /// Lazily yields descriptors in index order.
    pub fn iter(&self) -> ChunkIter {
        ChunkIter {
            plan: *self,
            next: 0,
        }
    }
}

impl IntoIterator for &ChunkPlan {
    type Item = ChunkDescriptor;
    type IntoIter = ChunkIter;

    fn into_iter(self) -> ChunkIter {
        self.iter()
    }
}

/// Iterator over the descriptors of a [`ChunkPlan`].
#[derive(Debug, Clone)]
pub struct ChunkIter {
    plan: ChunkPlan,
    next: u32,
}

impl Iterator for ChunkIter {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<ChunkDescriptor> {
        let desc = self.plan.descriptor(self.next)?;
        self.next += 1;
        Some(desc)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.plan.total_chunks - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ChunkIter {}
