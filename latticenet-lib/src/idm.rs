//! Identifier manager: allocation over an arbitrary contiguous numeric range.
//!
//! A thin shim that shifts a [`Bitmap`] by a constant `start` offset, used for
//! spaces like VXLAN network ids where the valid range does not begin at zero.

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::bitmap::{Bitmap, BitmapError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdmError {
    #[error("invalid id range [{0}, {1}]")]
    InvalidRange(u64, u64),

    #[error("id {id} out of range [{start}, {end}]")]
    OutOfRange { id: u64, start: u64, end: u64 },

    #[error(transparent)]
    Bitmap(#[from] BitmapError),
}

/// Allocator over the inclusive numeric range `[start, end]`.
///
/// Each instance serializes its operations behind a mutex; callers on a
/// single instance observe linearizable allocate/release semantics.
pub struct IdManager {
    start: u64,
    end: u64,
    ids: Mutex<Bitmap>,
}

impl IdManager {
    /// Requires `end > start`.
    pub fn new(start: u64, end: u64) -> Result<Self, IdmError> {
        if end <= start {
            return Err(IdmError::InvalidRange(start, end));
        }
        Ok(Self { start, end, ids: Mutex::new(Bitmap::new(end - start + 1)) })
    }

    /// Allocate the lowest available id, or the next one after the previous
    /// serial allocation when `serial` is set.
    pub fn get_id(&self, serial: bool) -> Result<u64, IdmError> {
        let ordinal = self.lock().set_any(serial)?;
        Ok(self.start + ordinal)
    }

    /// Allocate a specific id.
    pub fn get_specific_id(&self, id: u64) -> Result<(), IdmError> {
        self.check_bounds(id)?;
        self.lock().set(id - self.start)?;
        Ok(())
    }

    /// Allocate an id within `[lo, hi]`, a sub-range of the manager's range.
    pub fn get_id_in_range(&self, lo: u64, hi: u64, serial: bool) -> Result<u64, IdmError> {
        self.check_bounds(lo)?;
        self.check_bounds(hi)?;
        let ordinal = self
            .lock()
            .set_any_in_range(lo - self.start, hi - self.start, serial)?;
        Ok(self.start + ordinal)
    }

    /// Release a previously allocated id.
    pub fn release(&self, id: u64) -> Result<(), IdmError> {
        self.check_bounds(id)?;
        self.lock().unset(id - self.start)?;
        Ok(())
    }

    fn check_bounds(&self, id: u64) -> Result<(), IdmError> {
        if id < self.start || id > self.end {
            return Err(IdmError::OutOfRange { id, start: self.start, end: self.end });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Bitmap> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
