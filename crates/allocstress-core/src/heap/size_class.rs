//! Size class table for small blocks.
//!
//! Requests up to [`MAX_SMALL_SIZE`] are rounded up to the nearest class
//! boundary. Larger requests take the page-granular ("virtual") path.

/// Smallest block handed out (bytes).
pub const MIN_SIZE: usize = 16;

/// Largest size-classed block (bytes). Above this, blocks are page-rounded.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

/// Number of size classes.
pub const NUM_SIZE_CLASSES: usize = 32;

/// Page granularity of the large path.
pub const PAGE_SIZE: usize = 4096;

/// Bins 0-7: 16-byte steps, 8-15: 32-byte steps, then progressively wider.
const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, 80, 96, 112, 128, //
    160, 192, 224, 256, 288, 320, 352, 384, //
    448, 512, 640, 768, 896, 1024, 1280, 1536, //
    2048, 2560, 3072, 4096, 8192, 16384, 24576, 32768,
];

/// Bin index for `size`, or `NUM_SIZE_CLASSES` for the large path.
#[must_use]
pub fn bin_index(size: usize) -> usize {
    let size = size.max(MIN_SIZE);
    if size > MAX_SMALL_SIZE {
        return NUM_SIZE_CLASSES;
    }
    SIZE_TABLE.partition_point(|&class_size| class_size < size)
}

/// Block size of bin `index`; 0 when out of range.
#[must_use]
pub fn bin_size(index: usize) -> usize {
    SIZE_TABLE.get(index).copied().unwrap_or(0)
}

/// Rounds `size` up to a page boundary, `None` on overflow.
#[must_use]
pub fn page_align(size: usize) -> Option<usize> {
    Some(size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}

/// Usable capacity for a request of `size` bytes and whether it is
/// served by the large path.
#[must_use]
pub fn block_capacity(size: usize) -> Option<(usize, bool)> {
    let bin = bin_index(size);
    if bin < NUM_SIZE_CLASSES {
        Some((bin_size(bin), false))
    } else {
        page_align(size).map(|mapped| (mapped, true))
    }
}
