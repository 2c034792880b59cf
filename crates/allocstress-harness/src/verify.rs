//! Verification utilities: reference data, byte-exact comparison and
//! address-range overlap detection over a batch of live blocks.

use std::ptr::NonNull;

use serde::Serialize;

/// Reference content for the bulk scenario: `(i % 139 + i % 17)` truncated to a byte.
#[must_use]
pub fn reference_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 139 + i % 17) as u8).collect()
}

/// Worker content: each byte is its own index, truncated.
#[must_use]
pub fn byte_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

/// A live allocation: start address and requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BlockRecord {
    pub addr: usize,
    pub size: usize,
}

impl BlockRecord {
    #[must_use]
    pub fn new(ptr: NonNull<u8>, size: usize) -> Self {
        Self {
            addr: ptr.as_ptr() as usize,
            size,
        }
    }

    /// One past the last requested byte.
    #[must_use]
    pub fn end(&self) -> usize {
        self.addr.saturating_add(self.size)
    }
}

/// How strictly two live ranges must be separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// The lower block must end strictly before the upper one starts; the
    /// memory system is expected to keep bookkeeping bytes between blocks.
    Margin,
    /// Ranges must not intersect; touching blocks are fine.
    Strict,
    /// Only start addresses must differ.
    DistinctOnly,
}

impl OverlapPolicy {
    /// Returns true if `upper` (with `upper.addr >= lower.addr`) violates
    /// the separation from `lower`.
    fn violates(self, lower: &BlockRecord, upper: &BlockRecord) -> bool {
        if lower.addr == upper.addr {
            return true;
        }
        match self {
            Self::Margin => lower.end() >= upper.addr,
            Self::Strict => lower.end() > upper.addr,
            Self::DistinctOnly => false,
        }
    }
}

/// Two live blocks that are not separated as the policy requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverlapViolation {
    /// Batch index and range of the lower block.
    pub lower_index: usize,
    pub lower: BlockRecord,
    /// Batch index and range of the upper block.
    pub upper_index: usize,
    pub upper: BlockRecord,
}

/// Checks a single pair, ordering them by address first.
#[must_use]
pub fn check_pair(
    a: (usize, BlockRecord),
    b: (usize, BlockRecord),
    policy: OverlapPolicy,
) -> Option<OverlapViolation> {
    let (lower, upper) = if a.1.addr <= b.1.addr { (a, b) } else { (b, a) };
    policy
        .violates(&lower.1, &upper.1)
        .then_some(OverlapViolation {
            lower_index: lower.0,
            lower: lower.1,
            upper_index: upper.0,
            upper: upper.1,
        })
}

/// Every pair of records in `records` that violates `policy`.
///
/// Yields exactly the pairs a full pairwise scan would, in address order:
/// after sorting by start, each block is compared forward only while
/// later starts can still fall inside its guarded range.
#[must_use]
pub fn find_overlaps(records: &[BlockRecord], policy: OverlapPolicy) -> Vec<OverlapViolation> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_unstable_by_key(|&i| (records[i].addr, i));

    let mut violations = Vec::new();
    for (pos, &i) in order.iter().enumerate() {
        let lower = &records[i];
        for &j in &order[pos + 1..] {
            let upper = &records[j];
            let reachable = match policy {
                OverlapPolicy::Margin => upper.addr <= lower.end(),
                OverlapPolicy::Strict => upper.addr < lower.end(),
                OverlapPolicy::DistinctOnly => upper.addr == lower.addr,
            };
            if !reachable && upper.addr != lower.addr {
                break;
            }
            if policy.violates(lower, upper) {
                violations.push(OverlapViolation {
                    lower_index: i,
                    lower: *lower,
                    upper_index: j,
                    upper: *upper,
                });
            }
        }
    }
    violations
}

/// Copies `data` into the block at `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for writes of `data.len()` bytes and must not
/// overlap `data`.
pub unsafe fn fill_block(ptr: NonNull<u8>, data: &[u8]) {
    // SAFETY: guaranteed by the caller.
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len()) };
}

/// First offset at which a read-back block differs from what was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContentMismatch {
    pub offset: usize,
    pub expected: u8,
    pub actual: u8,
}

/// Compares the block at `ptr` against `expected`, byte for byte.
///
/// # Safety
///
/// `ptr` must be valid for reads of `expected.len()` bytes.
#[must_use]
pub unsafe fn compare_block(ptr: NonNull<u8>, expected: &[u8]) -> Option<ContentMismatch> {
    // SAFETY: guaranteed by the caller.
    let actual = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), expected.len()) };
    if actual == expected {
        return None;
    }
    actual
        .iter()
        .zip(expected)
        .position(|(a, e)| a != e)
        .map(|offset| ContentMismatch {
            offset,
            expected: expected[offset],
            actual: actual[offset],
        })
}
