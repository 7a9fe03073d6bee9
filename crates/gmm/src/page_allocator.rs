//! Bitmap page allocator.
//!
//! Tracks which pages of the guest space are in use, one bit per page. The allocator
//! only does bookkeeping: committing memory and recording tags is the caller's job.

/// How [`PageAllocator::allocate_from`] picks between candidate runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// The lowest run at or after the start page that is large enough.
    First,
    /// The smallest run at or after the start page that is large enough.
    Best,
    /// Only the run beginning exactly at the start page.
    Exact,
}

/// A fixed-size bitmap of pages. A set bit marks a used page.
#[derive(Debug, Clone)]
pub struct PageAllocator {
    words: Vec<u64>,
    len: usize,
}

const WORD_BITS: usize = u64::BITS as usize;

impl PageAllocator {
    /// Creates an allocator over `len` pages, all free.
    pub fn new(len: usize) -> Self {
        let mut words = vec![0u64; len.div_ceil(WORD_BITS)];

        // Bits past the end are permanently used so word-level scans never hand them out.
        let tail = len % WORD_BITS;
        if tail != 0
            && let Some(last) = words.last_mut()
        {
            *last = !0u64 << tail;
        }

        Self { words, len }
    }

    /// Number of pages tracked.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_free(&self, page: usize) -> bool {
        page < self.len && self.words[page / WORD_BITS] & (1 << (page % WORD_BITS)) == 0
    }

    /// Finds a run of `count` free pages starting the search at `start`, marks it used and
    /// returns its first page. The search does not wrap around to pages below `start`.
    pub fn allocate_from(&mut self, start: usize, count: usize, fit: Fit) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let first_fit = match fit {
            Fit::Exact => return self.allocate_at(start, count).then_some(start),
            Fit::First => true,
            Fit::Best => false,
        };

        let mut best: Option<(usize, usize)> = None;
        let mut cursor = start;
        while let Some((run_start, run_len)) = self.next_free_run(cursor) {
            if run_len >= count && best.is_none_or(|(_, len)| run_len < len) {
                best = Some((run_start, run_len));
                if first_fit || run_len == count {
                    break;
                }
            }
            cursor = run_start + run_len;
        }

        let (page, _) = best?;
        self.fill(page, count, true);
        Some(page)
    }

    /// Marks exactly `[page, page + count)` used. Fails if any page in the range is
    /// already used or past the end.
    pub fn allocate_at(&mut self, page: usize, count: usize) -> bool {
        let Some(end) = page.checked_add(count) else {
            return false;
        };
        if count == 0 || end > self.len || self.free_slot_count(page, end) != count {
            return false;
        }
        self.fill(page, count, true);
        true
    }

    /// Returns `[page, page + count)` to the free pool. Pages past the end are ignored.
    pub fn free(&mut self, page: usize, count: usize) {
        if page >= self.len {
            return;
        }
        let count = count.min(self.len - page);
        self.fill(page, count, false);
    }

    /// Counts the free pages in `[first, last)`.
    pub fn free_slot_count(&self, first: usize, last: usize) -> usize {
        let last = last.min(self.len);
        if first >= last {
            return 0;
        }
        let used: usize = Self::spans(first, last - first)
            .map(|(index, mask)| (self.words[index] & mask).count_ones() as usize)
            .sum();
        (last - first) - used
    }

    /// Number of pages currently marked used.
    pub fn used_count(&self) -> usize {
        self.len - self.free_slot_count(0, self.len)
    }

    /// Returns the next maximal free run at or after `from`.
    fn next_free_run(&self, from: usize) -> Option<(usize, usize)> {
        let mut page = from;

        while page < self.len {
            let word = self.words[page / WORD_BITS];
            let bit = page % WORD_BITS;
            if bit == 0 && word == !0 {
                page += WORD_BITS;
            } else if word & (1 << bit) != 0 {
                page += 1;
            } else {
                break;
            }
        }
        if page >= self.len {
            return None;
        }

        let start = page;
        while page < self.len {
            let word = self.words[page / WORD_BITS];
            let bit = page % WORD_BITS;
            if bit == 0 && word == 0 {
                page += WORD_BITS;
            } else if word & (1 << bit) == 0 {
                page += 1;
            } else {
                break;
            }
        }

        Some((start, page.min(self.len) - start))
    }

    fn fill(&mut self, page: usize, count: usize, used: bool) {
        for (index, mask) in Self::spans(page, count) {
            if used {
                self.words[index] |= mask;
            } else {
                self.words[index] &= !mask;
            }
        }
    }

    /// Splits a page range into `(word index, bit mask)` pairs.
    fn spans(page: usize, count: usize) -> impl Iterator<Item = (usize, u64)> {
        let end = page + count;
        let mut cursor = page;
        core::iter::from_fn(move || {
            if cursor >= end {
                return None;
            }
            let index = cursor / WORD_BITS;
            let bit = cursor % WORD_BITS;
            let bits = (WORD_BITS - bit).min(end - cursor);
            let mask = if bits == WORD_BITS {
                !0
            } else {
                ((1u64 << bits) - 1) << bit
            };
            cursor += bits;
            Some((index, mask))
        })
    }
}
