//! Run-length-compressed bitmap over a fixed-length bit vector.
//!
//! Ordinals are allocated and released without ever expanding the vector into
//! raw bytes: the state is a list of runs, each covering `count` consecutive
//! identical 32-bit blocks. Dense allocation spaces (IP host ordinals, VXLAN
//! ids) compress to a handful of runs.
//!
//! Not safe for concurrent mutation; callers guard instances with their own
//! lock.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const BLOCK_LEN: u64 = 32;
const BLOCK_FULL: u32 = u32::MAX;
const HEADER_LEN: usize = 16;
const RUN_LEN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitmapError {
    #[error("no bit available")]
    NoBitAvailable,

    #[error("requested bit is already allocated")]
    BitAllocated,

    #[error("invalid ordinal {0}")]
    InvalidOrdinal(u64),

    #[error("invalid bit range [{start}, {end}]")]
    InvalidRange { start: u64, end: u64 },

    #[error("corrupt bitmap encoding: {0}")]
    CorruptEncoding(String),
}

/// One run of `count` consecutive identical 32-bit blocks. Bit 0 of a block
/// is the most significant bit; a `1` means allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    block: u32,
    count: u64,
}

/// A fixed-length bit vector in run-length-compressed form.
#[derive(Clone)]
pub struct Bitmap {
    bits: u64,
    unselected: u64,
    runs: Vec<Run>,
    // Next ordinal scanned on serial allocation. Advisory only: never
    // serialized, reset to zero on decode.
    curr: u64,
}

impl Bitmap {
    /// A bitmap of `n` bits, all unset.
    pub fn new(n: u64) -> Self {
        let blocks = n.div_ceil(BLOCK_LEN);
        let runs = if blocks == 0 {
            Vec::new()
        } else {
            vec![Run { block: 0, count: blocks }]
        };
        Self { bits: n, unselected: n, runs, curr: 0 }
    }

    /// Logical length of the vector.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Number of unset bits.
    pub fn unselected(&self) -> u64 {
        self.unselected
    }

    /// Whether `ordinal` is set. Out-of-range ordinals read as unset.
    pub fn is_set(&self, ordinal: u64) -> bool {
        if ordinal >= self.bits {
            return false;
        }
        let block_idx = ordinal / BLOCK_LEN;
        let bit = ordinal % BLOCK_LEN;
        let mut first = 0u64;
        for run in &self.runs {
            if block_idx < first + run.count {
                return run.block & bit_mask(bit) != 0;
            }
            first += run.count;
        }
        false
    }

    /// Mark `ordinal` allocated. Fails if it already is.
    pub fn set(&mut self, ordinal: u64) -> Result<(), BitmapError> {
        self.validate_ordinal(ordinal)?;
        if self.is_set(ordinal) {
            return Err(BitmapError::BitAllocated);
        }
        self.push_reservation(ordinal, false);
        self.unselected -= 1;
        Ok(())
    }

    /// Release `ordinal`. Releasing an unset bit is a no-op.
    pub fn unset(&mut self, ordinal: u64) -> Result<(), BitmapError> {
        self.validate_ordinal(ordinal)?;
        if !self.is_set(ordinal) {
            return Ok(());
        }
        self.push_reservation(ordinal, true);
        self.unselected += 1;
        Ok(())
    }

    /// Allocate the first available bit. With `serial`, scanning resumes from
    /// the last serial allocation and wraps to the beginning.
    pub fn set_any(&mut self, serial: bool) -> Result<u64, BitmapError> {
        if self.bits == 0 || self.unselected == 0 {
            return Err(BitmapError::NoBitAvailable);
        }
        self.alloc_in_range(0, self.bits - 1, serial)
    }

    /// Allocate the first available bit in `[start, end]`, both bounds
    /// inclusive. Same serial semantics as [`Bitmap::set_any`].
    pub fn set_any_in_range(
        &mut self,
        start: u64,
        end: u64,
        serial: bool,
    ) -> Result<u64, BitmapError> {
        if end < start || end >= self.bits {
            return Err(BitmapError::InvalidRange { start, end });
        }
        if self.unselected == 0 {
            return Err(BitmapError::NoBitAvailable);
        }
        self.alloc_in_range(start, end, serial)
    }

    /// Drop runs whose count decayed to zero and fold adjacent equal runs.
    /// Returns whether a repair took place. Persisted state written by
    /// historical versions can contain such runs; decoded bitmaps are passed
    /// through this before use.
    pub fn check_consistency(&mut self) -> bool {
        let dirty = self.runs.iter().any(|r| r.count == 0)
            || self.runs.windows(2).any(|w| w[0].block == w[1].block);
        if dirty {
            self.coalesce();
        }
        dirty
    }

    /// Compact binary form: `bits (u64 BE) | unselected (u64 BE)` followed by
    /// one `(block u32 BE, count u64 BE)` tuple per run. The serial cursor is
    /// not part of the encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + RUN_LEN * self.runs.len());
        buf.extend_from_slice(&self.bits.to_be_bytes());
        buf.extend_from_slice(&self.unselected.to_be_bytes());
        for run in &self.runs {
            buf.extend_from_slice(&run.block.to_be_bytes());
            buf.extend_from_slice(&run.count.to_be_bytes());
        }
        buf
    }

    /// Decode the binary form produced by [`Bitmap::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, BitmapError> {
        if data.len() < HEADER_LEN || (data.len() - HEADER_LEN) % RUN_LEN != 0 {
            return Err(BitmapError::CorruptEncoding(format!(
                "invalid length {}",
                data.len()
            )));
        }
        let bits = u64::from_be_bytes(slice_to_array(&data[0..8]));
        let unselected = u64::from_be_bytes(slice_to_array(&data[8..16]));
        if unselected > bits {
            return Err(BitmapError::CorruptEncoding(format!(
                "unselected count {unselected} exceeds {bits} bits"
            )));
        }
        let mut runs = Vec::with_capacity((data.len() - HEADER_LEN) / RUN_LEN);
        let mut total_blocks = 0u64;
        for chunk in data[HEADER_LEN..].chunks_exact(RUN_LEN) {
            let block = u32::from_be_bytes(slice_to_array(&chunk[0..4]));
            let count = u64::from_be_bytes(slice_to_array(&chunk[4..12]));
            total_blocks = total_blocks.checked_add(count).ok_or_else(|| {
                BitmapError::CorruptEncoding("block count overflow".to_string())
            })?;
            runs.push(Run { block, count });
        }
        if total_blocks != bits.div_ceil(BLOCK_LEN) {
            return Err(BitmapError::CorruptEncoding(format!(
                "runs cover {total_blocks} blocks, expected {}",
                bits.div_ceil(BLOCK_LEN)
            )));
        }
        Ok(Self { bits, unselected, runs, curr: 0 })
    }

    fn validate_ordinal(&self, ordinal: u64) -> Result<(), BitmapError> {
        if ordinal >= self.bits {
            return Err(BitmapError::InvalidOrdinal(ordinal));
        }
        Ok(())
    }

    fn alloc_in_range(&mut self, start: u64, end: u64, serial: bool) -> Result<u64, BitmapError> {
        let base = if serial && self.curr > start && self.curr <= end {
            self.curr
        } else {
            start
        };
        let ordinal = match self.first_available(base, end) {
            Some(o) => o,
            // Wrap around to the front of the range.
            None if base > start => self
                .first_available(start, end)
                .ok_or(BitmapError::NoBitAvailable)?,
            None => return Err(BitmapError::NoBitAvailable),
        };
        self.push_reservation(ordinal, false);
        self.unselected -= 1;
        if serial {
            self.curr = ordinal + 1;
        }
        Ok(ordinal)
    }

    /// First unset ordinal in `[start, end]`, walking runs without expanding
    /// them: a non-full block is rescanned per run instance with the bit
    /// offset reset after the instance containing `start`.
    fn first_available(&self, start: u64, end: u64) -> Option<u64> {
        if start > end || start >= self.bits {
            return None;
        }
        let start_block = start / BLOCK_LEN;
        let end_block = end / BLOCK_LEN;
        let mut in_bit = start % BLOCK_LEN;
        let mut node_first = 0u64;
        let mut iter = self.runs.iter();
        let mut run = iter.next()?;
        while start_block >= node_first + run.count {
            node_first += run.count;
            run = iter.next()?;
        }
        let mut scan_block = start_block;
        loop {
            if run.block != BLOCK_FULL {
                let node_end = node_first + run.count;
                while scan_block < node_end {
                    if scan_block > end_block {
                        return None;
                    }
                    let base = scan_block * BLOCK_LEN;
                    for b in in_bit..BLOCK_LEN {
                        if run.block & bit_mask(b) == 0 {
                            let ordinal = base + b;
                            if ordinal > end {
                                return None;
                            }
                            return Some(ordinal);
                        }
                    }
                    in_bit = 0;
                    scan_block += 1;
                }
            } else {
                scan_block = node_first + run.count;
                in_bit = 0;
            }
            node_first += run.count;
            if scan_block > end_block {
                return None;
            }
            run = iter.next()?;
        }
    }

    /// Flip the bit at `ordinal` by splitting the containing run out of its
    /// neighbours. The updated single-count run lands before, after, or in
    /// the middle of the shortened run, and adjacent equal runs are folded
    /// back together.
    fn push_reservation(&mut self, ordinal: u64, release: bool) {
        let block_idx = ordinal / BLOCK_LEN;
        let mask = bit_mask(ordinal % BLOCK_LEN);
        let mut first = 0u64;
        let mut i = 0usize;
        while i < self.runs.len() {
            if block_idx < first + self.runs[i].count {
                break;
            }
            first += self.runs[i].count;
            i += 1;
        }
        if i == self.runs.len() {
            return;
        }
        let run = self.runs[i];
        let updated = if release { run.block & !mask } else { run.block | mask };
        if updated == run.block {
            return;
        }
        let prec = block_idx - first;
        if run.count == 1 {
            self.runs[i].block = updated;
        } else if prec == 0 {
            self.runs[i].count -= 1;
            self.runs.insert(i, Run { block: updated, count: 1 });
        } else if prec == run.count - 1 {
            self.runs[i].count -= 1;
            self.runs.insert(i + 1, Run { block: updated, count: 1 });
        } else {
            self.runs[i].count = prec;
            self.runs.insert(i + 1, Run { block: updated, count: 1 });
            self.runs
                .insert(i + 2, Run { block: run.block, count: run.count - prec - 1 });
        }
        self.coalesce();
    }

    fn coalesce(&mut self) {
        self.runs.retain(|r| r.count > 0);
        let mut i = 0;
        while i + 1 < self.runs.len() {
            if self.runs[i].block == self.runs[i + 1].block {
                self.runs[i].count += self.runs[i + 1].count;
                self.runs.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    #[cfg(test)]
    fn run_count(&self) -> usize {
        self.runs.len()
    }
}

fn bit_mask(bit: u64) -> u32 {
    1u32 << (BLOCK_LEN - 1 - bit)
}

fn slice_to_array<const N: usize>(s: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(s);
    out
}

/// Equality ignores the serial scan cursor, which is advisory state.
impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
            && self.unselected == other.unselected
            && self.runs == other.runs
    }
}

impl Eq for Bitmap {}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap(bits={} unselected={}", self.bits, self.unselected)?;
        for run in &self.runs {
            write!(f, " ({:#010x}, {})", run.block, run.count)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// JSON form: the binary encoding as a base64 string. Stable across versions
/// for migration compatibility.
impl Serialize for Bitmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Bitmap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let raw = BASE64.decode(encoded.as_bytes()).map_err(D::Error::custom)?;
        Bitmap::from_bytes(&raw).map_err(D::Error::custom)
    }
}
