//! zlib framing with explicit consumed-byte accounting.
//!
//! Pack files concatenate zlib streams back to back without any length
//! framing, so the decoder must report exactly how many input bytes each
//! stream consumed (header + deflate data + adler trailer) for the caller
//! to find the next entry.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::errors::GitError;

/// Decompress a single zlib stream beginning at `buf[at..]`.
///
/// Returns the decoded bytes and the number of input bytes consumed.
/// `expected_size` is the declared uncompressed size; producing more than
/// that is corruption, producing less is a truncated stream.
pub fn inflate_with_consumed(
    buf: &[u8],
    at: usize,
    expected_size: usize,
) -> Result<(Vec<u8>, usize), GitError> {
    if at > buf.len() {
        return Err(GitError::InvalidPackFile(format!(
            "inflate offset {at} beyond buffer of {} bytes",
            buf.len()
        )));
    }
    let mut state = Decompress::new(true);
    let mut out: Vec<u8> = Vec::with_capacity(expected_size + 1);

    loop {
        let consumed = state.total_in() as usize;
        let input = &buf[at + consumed..];
        let status = state
            .decompress_vec(input, &mut out, FlushDecompress::None)
            .map_err(|e| GitError::Corruption(format!("corrupt deflate stream: {e}")))?;

        if out.len() > expected_size {
            return Err(GitError::Corruption(format!(
                "zlib stream inflated past declared size {expected_size}"
            )));
        }
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if out.len() == out.capacity() {
                    out.reserve(8 * 1024);
                } else if input.is_empty() {
                    return Err(GitError::Corruption(
                        "zlib stream truncated before stream end".to_string(),
                    ));
                }
            }
        }
    }

    if out.len() != expected_size {
        return Err(GitError::Corruption(format!(
            "zlib stream produced {} bytes, declared {expected_size}",
            out.len()
        )));
    }
    Ok((out, state.total_in() as usize))
}

/// Compress `data` as one zlib stream with the default window.
pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut state = Compress::new(Compression::default(), true);
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    loop {
        let consumed = state.total_in() as usize;
        let status = state
            .compress_vec(&data[consumed..], &mut out, FlushCompress::Finish)
            .expect("in-memory deflate cannot fail");
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => out.reserve(8 * 1024),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deflate then inflate round-trips and reports full consumption.
    #[test]
    fn round_trip_with_consumed() {
        let body = b"hello, tablet world".repeat(100);
        let compressed = deflate(&body);
        let (out, consumed) = inflate_with_consumed(&compressed, 0, body.len()).unwrap();
        assert_eq!(out, body);
        assert_eq!(consumed, compressed.len());
    }

    /// Back-to-back streams: consumed points exactly at the second stream.
    #[test]
    fn concatenated_streams() {
        let a = b"first stream".to_vec();
        let b = b"second stream, longer".to_vec();
        let mut buf = deflate(&a);
        let first_len = buf.len();
        buf.extend(deflate(&b));

        let (out_a, consumed_a) = inflate_with_consumed(&buf, 0, a.len()).unwrap();
        assert_eq!(out_a, a);
        assert_eq!(consumed_a, first_len);

        let (out_b, consumed_b) = inflate_with_consumed(&buf, consumed_a, b.len()).unwrap();
        assert_eq!(out_b, b);
        assert_eq!(consumed_a + consumed_b, buf.len());
    }

    /// A declared size smaller than the actual stream is corruption.
    #[test]
    fn oversized_stream_rejected() {
        let body = b"0123456789";
        let compressed = deflate(body);
        let err = inflate_with_consumed(&compressed, 0, 4).unwrap_err();
        assert!(matches!(err, GitError::Corruption(_)));
    }

    /// Garbage input surfaces as corruption, not a panic.
    #[test]
    fn corrupt_stream_rejected() {
        let err = inflate_with_consumed(b"not a zlib stream", 0, 8).unwrap_err();
        assert!(matches!(err, GitError::Corruption(_)));
    }

    /// The empty payload compresses and round-trips.
    #[test]
    fn empty_payload() {
        let compressed = deflate(b"");
        let (out, consumed) = inflate_with_consumed(&compressed, 0, 0).unwrap();
        assert!(out.is_empty());
        assert_eq!(consumed, compressed.len());
    }
}
