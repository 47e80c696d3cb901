//! Random session id allocation.
//!
//! Ids are drawn uniformly from `1..=i32::MAX - 1` so callers cannot guess
//! another installer's session. Collisions are retried a bounded number of
//! times; running out of attempts is a distinct, terminal error.

use crate::errors::{InstallerError, InstallerResult};
use crate::session::SessionId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// Draws per allocation before giving up.
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 32;

const MIN_SESSION_ID: i32 = 1;
const MAX_SESSION_ID: i32 = i32::MAX - 1;

pub struct SessionIdAllocator<R: Rng = StdRng> {
    rng: R,
}

impl SessionIdAllocator<StdRng> {
    /// Allocator backed by an OS-seeded generator.
    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl<R: Rng> SessionIdAllocator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    /// Picks an id not present in `allocated` and records it there.
    pub fn allocate(&mut self, allocated: &mut HashSet<SessionId>) -> InstallerResult<SessionId> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let candidate = SessionId(self.rng.gen_range(MIN_SESSION_ID..=MAX_SESSION_ID));
            if allocated.insert(candidate) {
                return Ok(candidate);
            }
        }
        tracing::error!(
            allocated = allocated.len(),
            "Session id allocation exhausted after {} attempts",
            MAX_ALLOCATION_ATTEMPTS
        );
        Err(InstallerError::AllocationExhausted {
            attempts: MAX_ALLOCATION_ATTEMPTS,
        })
    }
}

#[cfg(test)]
#[path = "tests/allocator_tests.rs"]
mod tests;
