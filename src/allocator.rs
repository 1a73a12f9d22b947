//! Process-wide CPU allocator for tensor buffers
//!
//! Every input tensor of a request is materialised into a buffer obtained here.
//! The allocator is created once per process and charges each buffer against an
//! optional byte budget; the bytes are returned when the buffer is dropped, which
//! happens once the request that owns it has produced its response.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Allocation errors
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("allocator budget must be greater than zero")]
    ZeroBudget,

    #[error(
        "out of memory: requested {requested} bytes, but only {available} of {budget} bytes available"
    )]
    BudgetExceeded {
        requested: usize,
        available: usize,
        budget: usize,
    },

    #[error("failed to reserve {requested} bytes: {reason}")]
    ReserveFailed { requested: usize, reason: String },
}

#[derive(Debug)]
struct AllocatorState {
    budget: Option<usize>,
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

/// Shared handle to the CPU allocator
///
/// Cheap to clone; all clones charge the same budget.
#[derive(Debug, Clone)]
pub struct CpuAllocator {
    state: Arc<AllocatorState>,
}

impl CpuAllocator {
    /// Create the allocator
    ///
    /// `budget` caps the bytes held by live buffers at any moment. `None` means
    /// unbounded; `Some(0)` is a configuration error.
    pub fn create(budget: Option<usize>) -> Result<Self, AllocatorError> {
        if budget == Some(0) {
            return Err(AllocatorError::ZeroBudget);
        }

        Ok(Self {
            state: Arc::new(AllocatorState {
                budget,
                in_use: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        })
    }

    /// Allocator without a byte budget
    pub fn unbounded() -> Self {
        Self {
            state: Arc::new(AllocatorState {
                budget: None,
                in_use: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocate a zero-initialised buffer of exactly `len` bytes
    pub fn allocate(&self, len: usize) -> Result<TensorBuffer, AllocatorError> {
        self.charge(len)?;
        // Created before reserving so a failed reservation refunds the charge
        let lease = Lease {
            state: self.state.clone(),
            bytes: len,
        };

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|e| AllocatorError::ReserveFailed {
                requested: len,
                reason: e.to_string(),
            })?;
        bytes.resize(len, 0);

        Ok(TensorBuffer {
            bytes,
            lease: Some(lease),
        })
    }

    /// Bytes currently held by live buffers
    pub fn bytes_in_use(&self) -> usize {
        self.state.in_use.load(Ordering::Acquire)
    }

    /// Highest value `bytes_in_use` has reached
    pub fn peak_bytes(&self) -> usize {
        self.state.peak.load(Ordering::Relaxed)
    }

    pub fn budget(&self) -> Option<usize> {
        self.state.budget
    }

    fn charge(&self, len: usize) -> Result<(), AllocatorError> {
        let mut current = self.state.in_use.load(Ordering::Relaxed);
        loop {
            let exceeded = |budget: usize| AllocatorError::BudgetExceeded {
                requested: len,
                available: budget.saturating_sub(current),
                budget,
            };

            let next = match current.checked_add(len) {
                Some(next) => next,
                None => return Err(exceeded(self.state.budget.unwrap_or(usize::MAX))),
            };
            if let Some(budget) = self.state.budget
                && next > budget
            {
                return Err(exceeded(budget));
            }

            match self.state.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.state.peak.fetch_max(next, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Budget charge held by a buffer
struct Lease {
    state: Arc<AllocatorState>,
    bytes: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.state.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Exclusively owned tensor storage
///
/// Buffers from [`CpuAllocator::allocate`] carry a budget lease; buffers built
/// with [`TensorBuffer::detached`] (model outputs, clones) do not.
pub struct TensorBuffer {
    bytes: Vec<u8>,
    lease: Option<Lease>,
}

impl TensorBuffer {
    /// Wrap bytes that were not obtained from the allocator
    pub fn detached(bytes: Vec<u8>) -> Self {
        Self { bytes, lease: None }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_leased(&self) -> bool {
        self.lease.is_some()
    }

    /// Take the bytes, returning any budget charge to the allocator
    pub fn into_vec(self) -> Vec<u8> {
        let TensorBuffer { bytes, lease } = self;
        drop(lease);
        bytes
    }
}

impl Deref for TensorBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for TensorBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Clone for TensorBuffer {
    fn clone(&self) -> Self {
        Self::detached(self.bytes.clone())
    }
}

impl PartialEq for TensorBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorBuffer")
            .field("len", &self.bytes.len())
            .field("leased", &self.lease.is_some())
            .finish()
    }
}
