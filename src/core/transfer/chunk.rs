//! Received-chunk bookkeeping.

/// Number of chunks a file of `size` bytes splits into.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// Bit set of received chunk indices.
///
/// The total may be unknown when a sender omits `totalSize`; the set then
/// grows with the highest index seen.
#[derive(Debug, Clone, Default)]
pub struct ChunkBitmap {
    total_chunks: Option<u32>,
    bits: Vec<u64>,
    received: u32,
}

impl ChunkBitmap {
    pub fn new(total_chunks: Option<u32>) -> Self {
        let words = total_chunks.map_or(0, |t| (t as usize).div_ceil(64));
        Self {
            total_chunks,
            bits: vec![0u64; words],
            received: 0,
        }
    }

    pub fn total_chunks(&self) -> Option<u32> {
        self.total_chunks
    }

    /// Fix the total once it becomes known; indices past it are dropped.
    pub fn set_total(&mut self, total: u32) {
        self.bits.resize((total as usize).div_ceil(64), 0);
        if total % 64 != 0
            && let Some(last) = self.bits.last_mut()
        {
            *last &= (1u64 << (total % 64)) - 1;
        }
        self.received = self.bits.iter().map(|w| w.count_ones()).sum();
        self.total_chunks = Some(total);
    }

    /// Mark `index` received. Returns `false` for duplicates and for indices
    /// past a known total.
    pub fn set(&mut self, index: u32) -> bool {
        if self.total_chunks.is_some_and(|t| index >= t) {
            return false;
        }
        let word = (index / 64) as usize;
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        let mask = 1u64 << (index % 64);
        if self.bits[word] & mask != 0 {
            return false;
        }
        self.bits[word] |= mask;
        self.received += 1;
        true
    }

    pub fn is_set(&self, index: u32) -> bool {
        if self.total_chunks.is_some_and(|t| index >= t) {
            return false;
        }
        self.bits
            .get((index / 64) as usize)
            .is_some_and(|w| (w >> (index % 64)) & 1 == 1)
    }

    pub fn received_count(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks.is_some_and(|t| self.received == t)
    }

    /// Length of the run of received chunks starting at 0: where an in-order
    /// sender should resume.
    pub fn contiguous_prefix(&self) -> u32 {
        let mut n = 0u32;
        for word in &self.bits {
            if *word == u64::MAX {
                n += 64;
            } else {
                n += word.trailing_ones();
                break;
            }
        }
        match self.total_chunks {
            Some(t) => n.min(t),
            None => n,
        }
    }

    /// Lowest missing index below the known total (or below the highest index
    /// seen when the total is unknown).
    pub fn first_missing(&self) -> Option<u32> {
        let bound = self.total_chunks.unwrap_or(self.bits.len() as u32 * 64);
        let candidate = self.contiguous_prefix();
        (candidate < bound && (self.total_chunks.is_some() || self.received > candidate)).then_some(candidate)
    }
}
