//! Synthetic frame production.
//!
//! Every frame is `frame_size` bytes of a single fill value. The fill value
//! advances by one per frame and wraps from 255 to 0, which makes successive
//! frames distinguishable on the wire without any header.

use crate::runtime::{Message, PagePool, PoolError};

#[derive(Debug)]
pub struct FrameProducer {
    pool: PagePool,
    frame_size: usize,
    fill: u8,
    produced: u64,
}

impl FrameProducer {
    pub fn new(pool: PagePool, frame_size: usize) -> Self {
        Self {
            pool,
            frame_size,
            fill: 0,
            produced: 0,
        }
    }

    /// Allocate and fill the next frame.
    ///
    /// The fill value only advances when a frame is actually produced.
    pub fn produce(&mut self) -> Result<Message, PoolError> {
        let mut chain = self.pool.allocate(self.frame_size)?;
        chain.fill(self.fill);
        self.fill = self.fill.wrapping_add(1);
        self.produced += 1;
        Ok(chain.freeze())
    }

    /// Fill value the next frame will carry.
    #[cfg(test)]
    pub(crate) fn next_fill(&self) -> u8 {
        self.fill
    }

    /// Total frames produced so far.
    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }
}

/// Split a received byte stream into `frame_size` frames and return each
/// complete frame's fill value, or `None` if a frame is not uniform.
#[cfg(test)]
pub(crate) fn frame_fills(stream: &[u8], frame_size: usize) -> Option<Vec<u8>> {
    stream
        .chunks_exact(frame_size)
        .map(|frame| {
            let first = frame[0];
            frame.iter().all(|&b| b == first).then_some(first)
        })
        .collect()
}
