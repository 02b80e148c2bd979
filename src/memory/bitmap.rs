//! Fixed-capacity occupancy bitmap for the chunks of one small bin.
//!
//! Bit `i` set means chunk `i` is handed out. Queries take an explicit
//! `max_size` (the bin's live chunk count) and never report an index at or
//! beyond it, even if the bitmap's capacity is larger.

/// Number of chunks one bitmap can track.
pub(crate) const BITMAP_CAPACITY: usize = 1024;

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = BITMAP_CAPACITY / WORD_BITS;

#[repr(C)]
pub(crate) struct Bitmap {
    words: [u64; WORDS],
}

impl Bitmap {
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    #[inline]
    fn locate(index: usize) -> (usize, u64) {
        assert!(
            index < BITMAP_CAPACITY,
            "bitmap index {index} out of capacity {BITMAP_CAPACITY}"
        );
        (index / WORD_BITS, 1u64 << (index % WORD_BITS))
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        let (word, mask) = Self::locate(index);
        self.words[word] & mask != 0
    }

    /// Mark chunk `index` occupied. Setting a set bit is a no-op.
    #[inline]
    pub fn set(&mut self, index: usize) {
        let (word, mask) = Self::locate(index);
        self.words[word] |= mask;
    }

    /// Mark chunk `index` free. Clearing a clear bit is a no-op.
    #[inline]
    pub fn clear(&mut self, index: usize) {
        let (word, mask) = Self::locate(index);
        self.words[word] &= !mask;
    }

    /// Lowest free index in `[0, max_size)`.
    #[inline]
    pub fn first_free(&self, max_size: usize) -> Option<usize> {
        self.scan(max_size, true)
    }

    /// Lowest occupied index in `[0, max_size)`.
    #[inline]
    pub fn first_occupied(&self, max_size: usize) -> Option<usize> {
        self.scan(max_size, false)
    }

    /// Number of occupied chunks in `[0, max_size)`.
    pub fn count_occupied(&self, max_size: usize) -> usize {
        let max_size = Self::clamp(max_size);
        let full_words = max_size / WORD_BITS;
        let mut count: usize = self.words[..full_words]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum();
        let tail_bits = max_size % WORD_BITS;
        if tail_bits != 0 {
            let tail_mask = (1u64 << tail_bits) - 1;
            count += (self.words[full_words] & tail_mask).count_ones() as usize;
        }
        count
    }

    #[inline]
    fn clamp(max_size: usize) -> usize {
        debug_assert!(
            max_size <= BITMAP_CAPACITY,
            "max_size {max_size} exceeds bitmap capacity {BITMAP_CAPACITY}"
        );
        max_size.min(BITMAP_CAPACITY)
    }

    /// Word-at-a-time scan shared by both queries: a free search inverts each
    /// word so that both reduce to find-first-set.
    #[inline]
    fn scan(&self, max_size: usize, want_free: bool) -> Option<usize> {
        let max_size = Self::clamp(max_size);
        let word_count = max_size.div_ceil(WORD_BITS);
        for (w, &raw) in self.words[..word_count].iter().enumerate() {
            let word = if want_free { !raw } else { raw };
            if word != 0 {
                let index = w * WORD_BITS + word.trailing_zeros() as usize;
                return (index < max_size).then_some(index);
            }
        }
        None
    }
}
