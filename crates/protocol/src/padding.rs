//! Length-standardizing padding for traffic-analysis resistance.
//!
//! # Padded Format
//!
//! - 4 bytes: original length (big-endian)
//! - N bytes: original data
//! - random filler up to the block size
//!
//! Block sizes come from a fixed ladder so that every payload on the air has
//! one of a handful of lengths.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};

/// Size of the length header prepended to padded data.
pub const PADDING_HEADER_SIZE: usize = 4;

/// Ascending block sizes a payload may be padded to.
pub const BLOCK_SIZES: &[usize] = &[256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

/// Pad `data` to exactly `block_size` bytes.
///
/// Filler bytes come from the OS RNG, so padding the same input twice gives
/// different output that unpads to the same data.
pub fn pad(data: &[u8], block_size: usize) -> Result<Vec<u8>> {
    let needed = data.len().checked_add(PADDING_HEADER_SIZE).ok_or_else(|| {
        ProtocolError::InvalidArgument(format!("data too large to pad: {} bytes", data.len()))
    })?;
    if needed > block_size {
        return Err(ProtocolError::InvalidArgument(format!(
            "data of {} bytes does not fit in a {} byte block",
            data.len(),
            block_size
        )));
    }
    let length = u32::try_from(data.len()).map_err(|_| {
        ProtocolError::InvalidArgument(format!("data too large to pad: {} bytes", data.len()))
    })?;

    let mut output = Vec::with_capacity(block_size);
    output.extend_from_slice(&length.to_be_bytes());
    output.extend_from_slice(data);

    let mut filler = vec![0u8; block_size - needed];
    OsRng.fill_bytes(&mut filler);
    output.extend_from_slice(&filler);

    Ok(output)
}

/// Pad `data` to the smallest block from [`BLOCK_SIZES`] that holds it.
pub fn pad_to_optimal(data: &[u8]) -> Result<Vec<u8>> {
    pad(data, optimal_block_size(data.len()))
}

/// Strip padding added by [`pad`].
///
/// Never fails: callers may run this on data not known to be padded, so
/// anything without a consistent header is returned unchanged.
pub fn unpad(padded: &[u8]) -> Vec<u8> {
    if padded.is_empty() {
        return Vec::new();
    }
    if padded.len() < PADDING_HEADER_SIZE {
        return padded.to_vec();
    }

    let header: [u8; PADDING_HEADER_SIZE] = [padded[0], padded[1], padded[2], padded[3]];
    let length = u32::from_be_bytes(header) as usize;
    let body = &padded[PADDING_HEADER_SIZE..];
    if length > body.len() {
        return padded.to_vec();
    }

    body[..length].to_vec()
}

/// Smallest ladder block that fits `size` bytes plus the header.
///
/// Payloads larger than the top of the ladder get an exact-fit block,
/// saturating at `usize::MAX`.
pub fn optimal_block_size(size: usize) -> usize {
    let needed = size.saturating_add(PADDING_HEADER_SIZE);
    BLOCK_SIZES
        .iter()
        .copied()
        .find(|&block| needed <= block)
        .unwrap_or(needed)
}
