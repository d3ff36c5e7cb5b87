use std::future::Future;

use crate::error::StoreError;

/// Length of the public short code.
pub const DEFAULT_CODE_LENGTH: usize = 5;

/// Draw attempts per allocation before giving up. With a 64-character
/// alphabet and 5-character codes the space holds over a billion values, so
/// hitting this cap means something is badly wrong with the store or the
/// randomness source, not that the space ran out.
const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// Occupancy check the allocator runs against the store.
///
/// The probe is an optimization that avoids obviously-doomed inserts; the
/// authoritative uniqueness guarantee is the store's unique index, which
/// closes the window where two concurrent allocations observe the same code
/// as free.
pub trait CodeProbe {
    fn code_exists(&self, code: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;
}

/// Generates short, URL-safe random codes and probes the store until it
/// finds one that is not in use.
pub struct IdentifierAllocator {
    length: usize,
    max_attempts: u32,
    draw: Box<dyn Fn(usize) -> String + Send + Sync>,
}

impl IdentifierAllocator {
    /// Allocator drawing from the nanoid URL-safe alphabet
    /// (`A-Za-z0-9_-`).
    pub fn new(length: usize) -> Self {
        Self::with_draw(length, Box::new(|len| nanoid::nanoid!(len)))
    }

    /// Allocator with a caller-supplied draw, used by tests to script
    /// collisions deterministically.
    pub fn with_draw(length: usize, draw: Box<dyn Fn(usize) -> String + Send + Sync>) -> Self {
        IdentifierAllocator {
            length,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            draw,
        }
    }

    pub fn code_length(&self) -> usize {
        self.length
    }

    /// Draws candidate codes until the probe reports one free, up to the
    /// attempt cap. Does not write anything; the caller still has to win the
    /// insert against the store's unique index.
    pub async fn allocate<P>(&self, probe: &P) -> Result<String, StoreError>
    where
        P: CodeProbe + Sync,
    {
        for _ in 0..self.max_attempts {
            let code = (self.draw)(self.length);
            if !probe.code_exists(&code).await? {
                return Ok(code);
            }
            tracing::debug!(code = %code, "candidate code already in use, redrawing");
        }
        Err(StoreError::AllocationExhausted(self.max_attempts))
    }
}

impl Default for IdentifierAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_LENGTH)
    }
}
