//! Weighted byte semaphore.
//!
//! Bounds the total serialized payload bytes in flight between event
//! admission and batch flush. Weights are bytes, not message counts, so
//! memory stays predictable when payload sizes vary by orders of magnitude.

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub struct ByteSemaphore {
    permits: Semaphore,
    max: usize,
}

impl ByteSemaphore {
    pub fn new(max: usize) -> Self {
        Self {
            permits: Semaphore::new(max),
            max,
        }
    }

    /// Non-blocking acquire of `n` bytes.
    pub fn try_acquire(&self, n: usize) -> bool {
        if n > self.max {
            return false;
        }
        match self.permits.try_acquire_many(n as u32) {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Acquires `n` bytes, waiting until capacity frees up or the token is
    /// cancelled. Requests larger than the total capacity fail immediately.
    pub async fn acquire(&self, token: &CancellationToken, n: usize) -> Result<()> {
        if n > self.max {
            return Err(Error::SemaphoreOverflow {
                requested: n,
                max: self.max,
            });
        }
        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            permit = self.permits.acquire_many(n as u32) => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                // the semaphore is never closed
                Err(_) => Err(Error::Cancelled),
            },
        }
    }

    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Bytes currently available for acquisition.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
