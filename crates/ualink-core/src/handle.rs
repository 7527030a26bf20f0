// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Client handle allocation.
//!
//! Monitored items are identified to the client by a 32-bit client handle.
//! [`ClientHandleSequence`] hands out handles in increasing order, wrapping
//! from the upper bound back to zero, and skips any value the caller reports
//! as still in use.
//!
//! # Example
//!
//! ```
//! use ualink_core::handle::ClientHandleSequence;
//!
//! let handles = ClientHandleSequence::with_seed(u32::MAX - 1);
//! let taken = |_h: u32| false;
//!
//! assert_eq!(handles.next_handle(taken).unwrap(), u32::MAX - 1);
//! assert_eq!(handles.next_handle(taken).unwrap(), u32::MAX);
//! assert_eq!(handles.next_handle(taken).unwrap(), 0);
//! assert_eq!(handles.next_handle(taken).unwrap(), 1);
//! ```

use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};

/// Seed used by [`ClientHandleSequence::new`].
pub const DEFAULT_SEED: u32 = 1;

// =============================================================================
// ClientHandleSequence
// =============================================================================

/// Monotonic, wrapping allocator over an unsigned 32-bit handle space.
///
/// The sequence is deterministic: given the same seed and the same in-use
/// predicate it always yields the same handles.
#[derive(Debug)]
pub struct ClientHandleSequence {
    next: Mutex<u32>,
    max: u32,
}

impl ClientHandleSequence {
    /// Creates a sequence starting at [`DEFAULT_SEED`].
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Creates a sequence starting at `seed` over the full `u32` space.
    pub fn with_seed(seed: u32) -> Self {
        Self::bounded(seed, u32::MAX)
    }

    /// Creates a sequence over `0..=max`, starting at `seed`.
    ///
    /// A seed above `max` starts at zero.
    pub fn bounded(seed: u32, max: u32) -> Self {
        let seed = if seed > max { 0 } else { seed };
        Self {
            next: Mutex::new(seed),
            max,
        }
    }

    /// Upper bound of the handle space (inclusive).
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Returns the value the next scan will start from.
    pub fn peek(&self) -> u32 {
        *self.next.lock()
    }

    /// Returns the next handle for which `in_use` is `false`.
    ///
    /// The scan covers the whole space at most once. If every candidate is
    /// in use, [`CoreError::HandleExhausted`] is returned and the sequence
    /// position is left unchanged.
    pub fn next_handle<F>(&self, in_use: F) -> CoreResult<u32>
    where
        F: Fn(u32) -> bool,
    {
        let mut next = self.next.lock();
        let seed = *next;
        let space = u64::from(self.max) + 1;

        let mut candidate = seed;
        let mut scanned: u64 = 0;

        while scanned < space {
            scanned += 1;
            if !in_use(candidate) {
                *next = self.successor(candidate);
                return Ok(candidate);
            }
            candidate = self.successor(candidate);
        }

        tracing::error!(seed, scanned, max = self.max, "Client handle space exhausted");
        Err(CoreError::handle_exhausted(seed, scanned))
    }

    #[inline]
    fn successor(&self, value: u32) -> u32 {
        if value >= self.max {
            0
        } else {
            value + 1
        }
    }
}

impl Default for ClientHandleSequence {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
