//! Part planning
//!
//! Splits an object into contiguous byte ranges that satisfy the store's
//! multipart constraints. Pure and deterministic.

use super::part::PartDescriptor;
use super::UploadError;

/// Minimum part size (5MB) - S3 requirement for every part but the last
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum parts allowed
pub const MAX_PARTS: usize = 10000;

/// Extra bytes added to the even split so rounding never yields one more part
pub const SAFETY_MARGIN: u64 = 1024;

/// Size of every part except the last
pub fn part_size(object_len: u64, max_parts: usize) -> u64 {
    let even = object_len.div_ceil(max_parts.max(1) as u64);
    std::cmp::max(MIN_PART_SIZE, even + SAFETY_MARGIN)
}

/// Compute the part plan for an object of `object_len` bytes
///
/// Parts are numbered from 1. The last part carries the remainder and may be
/// smaller than [`MIN_PART_SIZE`].
pub fn plan(object_len: u64, max_parts: usize) -> Result<Vec<PartDescriptor>, UploadError> {
    if object_len == 0 {
        return Err(UploadError::InvalidPlan("object is empty".into()));
    }
    if max_parts < 1 {
        return Err(UploadError::InvalidPlan(
            "max_parts must be at least 1".into(),
        ));
    }

    let size = part_size(object_len, max_parts);
    let count = object_len.div_ceil(size);
    if count > MAX_PARTS as u64 {
        return Err(UploadError::InvalidPlan(format!(
            "{} parts exceed the limit of {}",
            count, MAX_PARTS
        )));
    }

    let mut parts = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut number = 0u32;

    while offset < object_len {
        number += 1;
        let length = std::cmp::min(size, object_len - offset);
        parts.push(PartDescriptor::new(number, offset, length));
        offset += length;
    }

    Ok(parts)
}
