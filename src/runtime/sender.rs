//! Per-connection deferred send queue.
//!
//! `enqueue` only appends a shared `Message` handle and never touches the
//! socket. `flush` performs as many non-blocking vectored writes as the socket
//! accepts and reports whether bytes are still pending, so the owner can ask
//! the reactor for write readiness. A message handle is dropped exactly once:
//! either after its last byte is written or when the sender is closed.

use crate::runtime::Message;
use std::collections::VecDeque;
use std::io::{self, IoSlice, Write};

/// Upper bound on iovecs handed to a single `write_vectored` call.
const MAX_IOVECS: usize = 64;

/// Outcome of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// The queue is empty.
    Drained,
    /// The socket would block with bytes still queued.
    Pending,
}

/// Unbounded queue of messages waiting for the socket.
///
/// There is no flow control: a peer that stops reading keeps every frame
/// queued for it, and the pages behind those frames, alive until its session
/// is torn down.
#[derive(Debug, Default)]
pub struct DeferredSender {
    queue: VecDeque<Message>,
    /// Bytes of the front message already written.
    offset: usize,
    queued_bytes: usize,
    bytes_sent: u64,
    closed: bool,
}

impl DeferredSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the queue.
    ///
    /// Returns `false` and drops the handle if the sender is closed.
    pub fn enqueue(&mut self, message: Message) -> bool {
        if self.closed {
            return false;
        }
        self.queued_bytes += message.len();
        self.queue.push_back(message);
        true
    }

    /// Write as much of the queue as `writer` accepts without blocking.
    ///
    /// A write error closes the sender before it is returned.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushStatus> {
        loop {
            self.drop_empty_front();
            if self.queue.is_empty() {
                return Ok(FlushStatus::Drained);
            }

            let result = {
                let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_IOVECS);
                for (i, message) in self.queue.iter().enumerate() {
                    let start = if i == 0 { self.offset } else { 0 };
                    message.io_slices_into(start, &mut slices, MAX_IOVECS);
                    if slices.len() >= MAX_IOVECS {
                        break;
                    }
                }
                writer.write_vectored(&slices)
            };

            match result {
                Ok(0) => {
                    self.close();
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Pending);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    /// Drop every queued message and refuse further enqueues.
    ///
    /// Returns how many messages were dropped undelivered. Calling it again
    /// is a no-op.
    pub fn close(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        let dropped = self.queue.len();
        self.queue.clear();
        self.offset = 0;
        self.queued_bytes = 0;
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    /// Bytes enqueued but not yet written.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes - self.offset
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn advance(&mut self, mut written: usize) {
        self.bytes_sent += written as u64;

        while written > 0 {
            let Some(front) = self.queue.front() else {
                break;
            };
            let remaining = front.len() - self.offset;
            if written >= remaining {
                written -= remaining;
                self.queued_bytes -= front.len();
                self.offset = 0;
                self.queue.pop_front();
            } else {
                self.offset += written;
                written = 0;
            }
        }
    }

    fn drop_empty_front(&mut self) {
        while self.queue.front().is_some_and(|m| m.is_empty()) {
            self.queue.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::PagePool;

    /// Accepts at most `budget` bytes, then reports `WouldBlock`.
    struct ThrottledWriter {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn message(pool: &PagePool, size: usize, fill: u8) -> Message {
        let mut chain = pool.allocate(size).unwrap();
        chain.fill(fill);
        chain.freeze()
    }

    #[test]
    fn test_enqueue_does_not_write() {
        let pool = PagePool::new(64, 4, 0);
        let mut sender = DeferredSender::new();

        assert!(sender.enqueue(message(&pool, 100, 1)));
        assert_eq!(sender.queued_messages(), 1);
        assert_eq!(sender.queued_bytes(), 100);
        assert_eq!(sender.bytes_sent(), 0);
    }

    #[test]
    fn test_flush_drains_and_releases() {
        let pool = PagePool::new(64, 8, 0);
        let mut sender = DeferredSender::new();
        let mut out = Vec::new();

        let first = message(&pool, 100, 1);
        sender.enqueue(first.clone());
        sender.enqueue(message(&pool, 30, 2));
        assert_eq!(first.holders(), 2);

        assert_eq!(sender.flush(&mut out).unwrap(), FlushStatus::Drained);
        assert_eq!(out.len(), 130);
        assert!(out[..100].iter().all(|&b| b == 1));
        assert!(out[100..].iter().all(|&b| b == 2));

        // The sender's reference is gone once the bytes are written
        assert_eq!(first.holders(), 1);
        drop(first);
        assert_eq!(pool.stats().free_pages, 8);
        assert_eq!(sender.bytes_sent(), 130);
    }

    #[test]
    fn test_partial_write_keeps_position() {
        let pool = PagePool::new(64, 4, 0);
        let mut sender = DeferredSender::new();
        sender.enqueue(message(&pool, 100, 9));

        let mut writer = ThrottledWriter {
            data: Vec::new(),
            budget: 70,
        };
        assert_eq!(sender.flush(&mut writer).unwrap(), FlushStatus::Pending);
        assert_eq!(sender.queued_messages(), 1);
        assert_eq!(sender.queued_bytes(), 30);

        writer.budget = 1000;
        assert_eq!(sender.flush(&mut writer).unwrap(), FlushStatus::Drained);
        assert_eq!(writer.data, vec![9u8; 100]);
        assert_eq!(sender.queued_bytes(), 0);
    }

    #[test]
    fn test_write_error_closes_and_releases() {
        let pool = PagePool::new(64, 4, 0);
        let mut sender = DeferredSender::new();
        let shared = message(&pool, 64, 3);
        sender.enqueue(shared.clone());

        let err = sender.flush(&mut BrokenWriter).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(sender.is_closed());
        assert_eq!(shared.holders(), 1);

        // Enqueue after close is a no-op that drops the handle
        assert!(!sender.enqueue(shared.clone()));
        assert_eq!(shared.holders(), 1);
        assert_eq!(sender.close(), 0);
    }

    #[test]
    fn test_close_drops_undelivered() {
        let pool = PagePool::new(64, 4, 0);
        let mut sender = DeferredSender::new();
        sender.enqueue(message(&pool, 64, 1));
        sender.enqueue(message(&pool, 64, 2));
        assert_eq!(pool.stats().free_pages, 2);

        assert_eq!(sender.close(), 2);
        assert_eq!(sender.close(), 0);
        assert_eq!(pool.stats().free_pages, 4);
    }

    #[test]
    fn test_flush_is_safe_when_redundant() {
        let mut sender = DeferredSender::new();
        let mut out = Vec::new();
        assert_eq!(sender.flush(&mut out).unwrap(), FlushStatus::Drained);
        assert_eq!(sender.flush(&mut out).unwrap(), FlushStatus::Drained);
        assert!(out.is_empty());
    }

    #[test]
    fn test_empty_messages_are_skipped() {
        let pool = PagePool::new(64, 1, 0);
        let mut sender = DeferredSender::new();
        sender.enqueue(message(&pool, 0, 0));
        sender.enqueue(message(&pool, 5, 4));

        let mut out = Vec::new();
        assert_eq!(sender.flush(&mut out).unwrap(), FlushStatus::Drained);
        assert_eq!(out, vec![4u8; 5]);
    }
}
