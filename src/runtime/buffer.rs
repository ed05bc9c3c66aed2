//! Page pool and reference-counted page chains.
//!
//! Frames are assembled from fixed-size pages taken from a shared free list.
//! A freshly allocated `PageChain` is uniquely owned and writable; once it is
//! filled it is frozen into a `Message`, which is immutable and cheap to clone.
//! Every clone is one more holder of the same pages. When the last holder is
//! dropped the pages go back to the pool's free list.
//!
//! ## Sharing
//!
//! A single `Message` is handed to every session that receives a frame. The
//! sessions hold clones of the same `Arc`, so fanning a frame out to N
//! sessions never copies the payload.

use std::fmt;
use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Page = Box<[u8]>;

/// Error returned when the pool cannot satisfy an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Growing the pool would exceed its page cap.
    Exhausted {
        /// Pages needed for the request.
        requested: usize,
        /// Pages the pool could still hand out.
        available: usize,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted {
                requested,
                available,
            } => write!(
                f,
                "page pool exhausted: {} pages requested, {} available",
                requested, available
            ),
        }
    }
}

impl std::error::Error for PoolError {}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub page_size: usize,
    pub total_pages: usize,
    pub free_pages: usize,
}

impl PoolStats {
    /// Pages currently held by live chains.
    pub fn pages_in_use(&self) -> usize {
        self.total_pages - self.free_pages
    }
}

struct PoolShared {
    page_size: usize,
    /// 0 means the pool may grow without bound.
    max_pages: usize,
    free: Mutex<Vec<Page>>,
    total_pages: AtomicUsize,
}

impl PoolShared {
    fn reclaim(&self, pages: &mut Vec<Page>) {
        if pages.is_empty() {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        free.append(pages);
    }
}

/// Shared pool of fixed-size pages.
///
/// Cloning the pool yields another handle to the same free list.
#[derive(Clone)]
pub struct PagePool {
    shared: Arc<PoolShared>,
}

impl PagePool {
    /// Create a new page pool.
    ///
    /// # Arguments
    /// * `page_size` - Size of each page in bytes (must be non-zero)
    /// * `min_pages` - Number of pages to pre-allocate
    /// * `max_pages` - Upper bound on pages ever allocated, 0 for unbounded
    pub fn new(page_size: usize, min_pages: usize, max_pages: usize) -> Self {
        assert!(page_size > 0, "page_size must be non-zero");

        let min_pages = if max_pages > 0 {
            min_pages.min(max_pages)
        } else {
            min_pages
        };

        let free: Vec<Page> = (0..min_pages)
            .map(|_| vec![0u8; page_size].into_boxed_slice())
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                page_size,
                max_pages,
                free: Mutex::new(free),
                total_pages: AtomicUsize::new(min_pages),
            }),
        }
    }

    /// Allocate a chain with room for exactly `size` bytes.
    ///
    /// Takes pages from the free list first and grows the pool for the rest.
    /// Fails without side effects if the page cap would be exceeded.
    pub fn allocate(&self, size: usize) -> Result<PageChain, PoolError> {
        let page_size = self.shared.page_size;
        let needed = size.div_ceil(page_size);

        let mut pages = Vec::with_capacity(needed);
        {
            let mut free = self
                .shared
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            let reused = needed.min(free.len());
            let split_at = free.len() - reused;
            pages.extend(free.drain(split_at..));

            let missing = needed - reused;
            if missing > 0 {
                let total = self.shared.total_pages.load(Ordering::Relaxed);
                let max = self.shared.max_pages;
                if max > 0 && total + missing > max {
                    let available = reused + max.saturating_sub(total);
                    free.append(&mut pages);
                    return Err(PoolError::Exhausted {
                        requested: needed,
                        available,
                    });
                }
                self.shared.total_pages.fetch_add(missing, Ordering::Relaxed);
            }
        }

        while pages.len() < needed {
            pages.push(vec![0u8; page_size].into_boxed_slice());
        }

        Ok(PageChain {
            inner: ChainInner {
                pages,
                len: size,
                pool: Arc::clone(&self.shared),
            },
        })
    }

    /// Size of each page.
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    pub fn stats(&self) -> PoolStats {
        let free_pages = self
            .shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        PoolStats {
            page_size: self.shared.page_size,
            total_pages: self.shared.total_pages.load(Ordering::Relaxed),
            free_pages,
        }
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pages of one logical message plus the pool they return to.
struct ChainInner {
    pages: Vec<Page>,
    len: usize,
    pool: Arc<PoolShared>,
}

impl ChainInner {
    fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let page_size = self.pool.page_size;
        let mut remaining = self.len;
        self.pages.iter().map(move |page| {
            let chunk_len = remaining.min(page_size);
            remaining -= chunk_len;
            &page[..chunk_len]
        })
    }
}

impl Drop for ChainInner {
    fn drop(&mut self) {
        self.pool.reclaim(&mut self.pages);
    }
}

/// A uniquely owned, writable page chain.
///
/// Freeze it into a `Message` before sharing.
pub struct PageChain {
    inner: ChainInner,
}

impl PageChain {
    /// Logical length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Number of pages backing the chain.
    pub fn page_count(&self) -> usize {
        self.inner.pages.len()
    }

    /// Mutable views of each page, trimmed to the chain's logical length.
    pub fn chunks_mut(&mut self) -> impl Iterator<Item = &mut [u8]> + '_ {
        let page_size = self.inner.pool.page_size;
        let mut remaining = self.inner.len;
        self.inner.pages.iter_mut().map(move |page| {
            let chunk_len = remaining.min(page_size);
            remaining -= chunk_len;
            &mut page[..chunk_len]
        })
    }

    /// Set every byte of the chain to `value`.
    pub fn fill(&mut self, value: u8) {
        for chunk in self.chunks_mut() {
            chunk.fill(value);
        }
    }

    /// Make the chain immutable and shareable.
    pub fn freeze(self) -> Message {
        Message {
            inner: Arc::new(self.inner),
        }
    }
}

impl fmt::Debug for PageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageChain")
            .field("len", &self.inner.len)
            .field("pages", &self.inner.pages.len())
            .finish()
    }
}

/// An immutable, shared page chain.
///
/// `clone()` adds a holder, dropping a clone releases it.
#[derive(Clone)]
pub struct Message {
    inner: Arc<ChainInner>,
}

impl Message {
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Page-sized slices of the payload, in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.inner.chunks()
    }

    /// Number of live holders of this message.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Append `IoSlice` views of the payload starting at byte `offset`.
    ///
    /// Stops once `out` holds `limit` slices. Returns the number appended.
    pub fn io_slices_into<'a>(
        &'a self,
        offset: usize,
        out: &mut Vec<IoSlice<'a>>,
        limit: usize,
    ) -> usize {
        let mut skip = offset;
        let mut appended = 0;

        for chunk in self.inner.chunks() {
            if out.len() >= limit {
                break;
            }
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            out.push(IoSlice::new(&chunk[skip..]));
            appended += 1;
            skip = 0;
        }

        appended
    }

    /// Copy the payload into a contiguous `Vec`.
    #[cfg(test)]
    pub(crate) fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.inner.len);
        for chunk in self.inner.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("len", &self.inner.len)
            .field("pages", &self.inner.pages.len())
            .field("holders", &self.holders())
            .finish()
    }
}
