//! Splitting a file into fixed-size chunks.
use crate::error::TransferError;

/// A contiguous byte range of one file, transferred as a single network operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Position in the plan, `0..N` without gaps.
    pub index: usize,
    /// Byte offset of the chunk inside its file.
    pub offset: u64,
    /// Number of bytes in the chunk.
    pub length: u64,
}

impl ChunkDescriptor {
    /// Last byte covered by the chunk, inclusive. Used for `Range` headers.
    ///
    /// Only meaningful for non-empty chunks.
    pub fn end_inclusive(&self) -> u64 {
        self.offset + self.length.saturating_sub(1)
    }

    /// Value for the HTTP `Range` request header.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end_inclusive())
    }
}

/// Divides `total_size` bytes into chunks of `chunk_size`.
///
/// Every chunk has exactly `chunk_size` bytes except the last one, which holds
/// the remainder. When `total_size` is a multiple of `chunk_size` there is no
/// remainder chunk, and a zero-byte file has no chunks at all.
pub fn plan(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkDescriptor>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::Precondition(
            "chunk size must be greater than zero".into(),
        ));
    }

    let full = total_size / chunk_size;
    let remainder = total_size % chunk_size;
    let count = full + u64::from(remainder > 0);

    let chunks = (0..count)
        .map(|i| {
            let offset = i * chunk_size;
            ChunkDescriptor {
                index: i as usize,
                offset,
                length: chunk_size.min(total_size - offset),
            }
        })
        .collect();

    Ok(chunks)
}
