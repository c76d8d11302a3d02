//! Bounded-memory base64 conversion.
//!
//! Base64 maps every 3 input bytes onto 4 output characters, so a buffer can
//! only be encoded in independent pieces when every piece except the last is
//! a multiple of 3 bytes long. The chunked helpers align their window sizes
//! accordingly; [`Base64Transform`] carries the 0-2 leftover bytes between
//! writes for inputs whose total size is not known up front.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::stream::{self, Stream};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const CHUNKED_UPLOAD_THRESHOLD: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 input at chunk offset {offset}: {source}")]
    InvalidBase64 {
        offset: usize,
        #[source]
        source: base64::DecodeError,
    },
}

/// Encodes `buffer` window by window. The output is identical to a single
/// `STANDARD.encode(buffer)` for every chunk size.
pub fn encode_chunked(buffer: &[u8], chunk_size: usize) -> String {
    if buffer.len() <= chunk_size {
        return STANDARD.encode(buffer);
    }

    let window = align_down(chunk_size, 3);
    let mut out = String::with_capacity(encoded_len(buffer.len()));
    for piece in buffer.chunks(window) {
        STANDARD.encode_string(piece, &mut out);
    }
    out
}

/// Mirror of [`encode_chunked`]. The chunk size is aligned down to a multiple
/// of 4 characters, the smallest independently decodable unit.
pub fn decode_chunked(encoded: &str, chunk_size: usize) -> Result<Vec<u8>, CodecError> {
    let window = align_down(chunk_size, 4);
    let mut out = Vec::with_capacity(encoded.len() / 4 * 3);
    for (index, piece) in encoded.as_bytes().chunks(window).enumerate() {
        STANDARD
            .decode_vec(piece, &mut out)
            .map_err(|source| CodecError::InvalidBase64 {
                offset: index * window,
                source,
            })?;
    }
    Ok(out)
}

/// Whether a payload of `file_size` bytes must go through the chunked or
/// streaming path instead of a one-shot encode, using the fixed 1 MiB
/// default. `Config::should_use_chunked_upload` applies the configured
/// threshold instead.
pub fn should_use_chunked_upload(file_size: u64) -> bool {
    exceeds_threshold(file_size, CHUNKED_UPLOAD_THRESHOLD)
}

pub fn exceeds_threshold(file_size: u64, threshold: u64) -> bool {
    file_size > threshold
}

pub fn create_base64_transform() -> Base64Transform {
    Base64Transform::default()
}

/// Incremental encoder accepting writes of any size.
#[derive(Debug, Default)]
pub struct Base64Transform {
    carry: Vec<u8>,
}

impl Base64Transform {
    /// Encodes every complete 3-byte group available after prepending the
    /// carry-over, keeping the remainder for the next write.
    pub fn push(&mut self, input: &[u8]) -> String {
        if self.carry.len() + input.len() < 3 {
            self.carry.extend_from_slice(input);
            return String::new();
        }

        let mut out = String::with_capacity(encoded_len(self.carry.len() + input.len()));
        let mut rest = input;
        if !self.carry.is_empty() {
            let needed = 3 - self.carry.len();
            self.carry.extend_from_slice(&rest[..needed]);
            STANDARD.encode_string(&self.carry, &mut out);
            self.carry.clear();
            rest = &rest[needed..];
        }

        let whole = align_down_or_zero(rest.len(), 3);
        STANDARD.encode_string(&rest[..whole], &mut out);
        self.carry.extend_from_slice(&rest[whole..]);
        out
    }

    /// Flushes the padded remainder.
    pub fn finish(self) -> String {
        STANDARD.encode(&self.carry)
    }

    pub fn pending(&self) -> usize {
        self.carry.len()
    }
}

/// Streams `reader` as base64 text, reading at most `read_size` bytes at a time.
pub fn encode_reader<R>(
    reader: R,
    read_size: usize,
) -> impl Stream<Item = std::io::Result<String>>
where
    R: AsyncRead + Unpin,
{
    let read_size = read_size.max(3);
    let state = Some((reader, create_base64_transform(), vec![0u8; read_size]));
    stream::unfold(state, |state| async move {
        let (mut reader, mut transform, mut buf) = state?;
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let tail = transform.finish();
                    return if tail.is_empty() {
                        None
                    } else {
                        Some((Ok(tail), None))
                    };
                }
                Ok(n) => {
                    let text = transform.push(&buf[..n]);
                    if !text.is_empty() {
                        return Some((Ok(text), Some((reader, transform, buf))));
                    }
                }
                Err(err) => return Some((Err(err), None)),
            }
        }
    })
}

fn align_down(size: usize, unit: usize) -> usize {
    align_down_or_zero(size, unit).max(unit)
}

fn align_down_or_zero(size: usize, unit: usize) -> usize {
    size - size % unit
}

fn encoded_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn small_buffer_is_single_shot() {
        let data = b"hello world";
        assert_eq!(encode_chunked(data, DEFAULT_CHUNK_SIZE), STANDARD.encode(data));
    }

    #[test]
    fn chunked_encode_matches_direct_encode_for_any_chunk_size() {
        let data = sample(1000);
        let direct = STANDARD.encode(&data);
        for chunk_size in [1, 2, 3, 4, 5, 7, 64, 100, 333, 999, 1000, 4096] {
            assert_eq!(encode_chunked(&data, chunk_size), direct, "chunk {chunk_size}");
        }
    }

    #[test]
    fn default_chunk_size_is_transparent_past_one_window() {
        let data = sample(DEFAULT_CHUNK_SIZE * 2 + 17);
        assert_eq!(
            encode_chunked(&data, DEFAULT_CHUNK_SIZE),
            STANDARD.encode(&data)
        );
    }

    #[test]
    fn decode_recovers_original_bytes() {
        let data = sample(777);
        let encoded = encode_chunked(&data, 128);
        for chunk_size in [1, 4, 6, 10, 64, 1036, 10_000] {
            assert_eq!(decode_chunked(&encoded, chunk_size).unwrap(), data);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_chunked("abcd$efg", 4).unwrap_err();
        assert!(matches!(err, CodecError::InvalidBase64 { offset: 4, .. }));
    }

    #[test]
    fn transform_is_split_independent() {
        let data = sample(101);
        let direct = STANDARD.encode(&data);

        let mut bytewise = create_base64_transform();
        let mut out = String::new();
        for byte in &data {
            out.push_str(&bytewise.push(std::slice::from_ref(byte)));
            assert!(bytewise.pending() < 3);
        }
        out.push_str(&bytewise.finish());
        assert_eq!(out, direct);

        let mut uneven = create_base64_transform();
        let mut out = String::new();
        for piece in [&data[..5], &data[5..6], &data[6..50], &data[50..]] {
            out.push_str(&uneven.push(piece));
        }
        out.push_str(&uneven.finish());
        assert_eq!(out, direct);

        let mut whole = create_base64_transform();
        let out = whole.push(&data) + &whole.finish();
        assert_eq!(out, direct);
    }

    #[test]
    fn empty_transform_emits_nothing() {
        assert_eq!(create_base64_transform().finish(), "");
    }

    #[tokio::test]
    async fn encode_reader_matches_direct_encode() {
        let data = sample(10_000);
        let chunks: Vec<String> = encode_reader(&data[..], 1000)
            .map(|chunk| chunk.expect("in-memory read"))
            .collect()
            .await;
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), STANDARD.encode(&data));
    }

    #[test]
    fn upload_threshold() {
        assert!(should_use_chunked_upload(2_000_000));
        assert!(!should_use_chunked_upload(500_000));
        assert!(!should_use_chunked_upload(CHUNKED_UPLOAD_THRESHOLD));
    }
}
