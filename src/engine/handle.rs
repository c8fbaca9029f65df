//! `count` in the spec is not RAII-friendly on its own — holders are
//! asynchronous and cross handler boundaries. `Handle` is the RAII reading
//! of it: acquiring one bumps the shared counter, dropping it releases.
//! The request tree is live for as long as at least one `Handle` exists.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared refcount for a request tree (main request + its subrequests +
/// any async holder: body reader, upstream call, running subrequest).
#[derive(Clone)]
pub struct RefCount(Arc<AtomicUsize>);

impl RefCount {
    /// A fresh request tree starts with exactly one implicit holder: the
    /// connection-driven HTTP exchange itself.
    pub fn new() -> (Self, Handle) {
        let count = Self(Arc::new(AtomicUsize::new(1)));
        let handle = Handle {
            count: count.clone(),
            released: false,
        };
        (count, handle)
    }

    /// Current number of independent holders. Zero iff the request tree
    /// is finalized.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Acquire one more holder, returning the token that releases it.
    pub fn acquire(&self) -> Handle {
        self.0.fetch_add(1, Ordering::AcqRel);
        Handle {
            count: self.clone(),
            released: false,
        }
    }
}

/// One pending holder of a request tree. Dropping it (or calling
/// `release` explicitly) decrements the shared count exactly once.
/// Double-release is a logic error and is caught in debug builds.
pub struct Handle {
    count: RefCount,
    released: bool,
}

impl Handle {
    /// Release this holder's claim, returning the count observed
    /// immediately after the decrement.
    pub fn release(mut self) -> usize {
        self.release_mut()
    }

    fn release_mut(&mut self) -> usize {
        debug_assert!(!self.released, "Handle released twice");
        self.released = true;
        self.count.0.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn count(&self) -> usize {
        self.count.get()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.released {
            self.release_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_holder() {
        let (count, handle) = RefCount::new();
        assert_eq!(count.get(), 1);
        drop(handle);
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn acquire_and_release_balance() {
        let (count, main) = RefCount::new();
        let sub = count.acquire();
        assert_eq!(count.get(), 2);
        assert_eq!(sub.release(), 1);
        assert_eq!(main.release(), 0);
    }

    #[test]
    fn never_observed_negative() {
        let (count, main) = RefCount::new();
        let a = count.acquire();
        let b = count.acquire();
        a.release();
        b.release();
        assert_eq!(count.get(), 1);
        main.release();
        assert_eq!(count.get(), 0);
    }
}
