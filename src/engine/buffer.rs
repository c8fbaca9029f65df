//! Header buffer pool (component A).
//!
//! Each connection owns one primary buffer sized `client_header_buffer_size`,
//! lazily allocated on first read and released again the moment a read
//! returns nothing (idle-connection memory hygiene). If the request line or
//! headers overrun it, the connection grows into a pool of up to
//! `large_client_header_buffers.num` buffers of
//! `large_client_header_buffers.size` bytes each, bounding worst-case memory
//! per connection to `num * size`.
//!
//! Rather than the pointer-rebasing the spec's pointer-heavy source needs,
//! every parsed token is frozen into a `bytes::Bytes` the instant it
//! completes (see `engine::parser`) — a cheap refcount bump off the live
//! `BytesMut`, not a copy. Growth therefore only ever needs to carry over the
//! bytes of the token *currently in progress*; already-frozen tokens never
//! move and never need rebasing.

use bytes::BytesMut;

/// Returned when a connection has exhausted its large-buffer budget and the
/// request line or headers still don't fit. The connection driver maps this
/// to 414 (URI) or 494/400 (headers), per `client_header_buffer_size` /
/// `large_client_header_buffers` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooLarge;

pub struct BufferPool {
    primary_size: usize,
    large_size: usize,
    large_num: usize,
    /// Large buffers available for reuse, LIFO.
    free: Vec<BytesMut>,
    /// Large buffers allocated so far, whether currently in `free` or
    /// checked out to a connection. Bounds total growth to `large_num`.
    large_allocated: usize,
}

impl BufferPool {
    pub fn new(primary_size: usize, large_size: usize, large_num: usize) -> Self {
        Self {
            primary_size,
            large_size,
            large_num,
            free: Vec::new(),
            large_allocated: 0,
        }
    }

    /// Allocate a fresh primary buffer (first read on a connection, or a
    /// pipelined request reusing the connection after the prior one's
    /// buffer was released).
    pub fn alloc_primary(&mut self) -> BytesMut {
        BytesMut::with_capacity(self.primary_size)
    }

    /// Grow past the active buffer's capacity: draw from `free` first, else
    /// allocate a new large buffer if under budget, else fail with
    /// `TooLarge` ("header too large"). Copies only the bytes of the
    /// in-progress token (`active[token_start..]`) into the new buffer —
    /// already-frozen tokens live on as independent `Bytes` and need no
    /// rebasing.
    pub fn grow(&mut self, active: &BytesMut, token_start: usize) -> Result<BytesMut, TooLarge> {
        let mut next = if let Some(reused) = self.free.pop() {
            reused
        } else if self.large_allocated < self.large_num {
            self.large_allocated += 1;
            BytesMut::with_capacity(self.large_size)
        } else {
            return Err(TooLarge);
        };

        next.clear();
        next.extend_from_slice(&active[token_start..]);
        Ok(next)
    }

    /// Hand a large buffer back to the free list (connection reclaiming a
    /// buffer for the next pipelined/keep-alive request, or finishing a
    /// request that doesn't need it anymore).
    pub fn reclaim(&mut self, mut buf: BytesMut) {
        // Only buffers we actually allocated at `large_size` are worth
        // keeping; a primary-sized buffer that never grew isn't a "large"
        // buffer and is simply dropped.
        if buf.capacity() >= self.large_size {
            buf.clear();
            self.free.push(buf);
        }
    }

    /// Release every pooled buffer — called on true connection idle
    /// (entering keep-alive with no pipelined bytes left) to return memory
    /// to the allocator rather than hold it for a connection that may sit
    /// idle for `keepalive_timeout`.
    pub fn release_all(&mut self) {
        self.free.clear();
        self.large_allocated = 0;
    }

    pub fn large_size(&self) -> usize {
        self.large_size
    }

    pub fn primary_size(&self) -> usize {
        self.primary_size
    }

    /// Worst-case bytes a single connection can hold across header parsing.
    pub fn budget(&self) -> usize {
        self.primary_size.max(self.large_size) * self.large_num.max(1)
    }
}
