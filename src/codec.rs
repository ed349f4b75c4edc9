//! Block-wise compression for archive payloads.
//!
//! File bodies are cut into fixed-maximum-size chunks and each chunk is
//! compressed on its own, so a consumer can walk an archive block by block.
//! A block that does not shrink is stored raw; readers detect stored blocks
//! heuristically (zlib magic bytes, or size comparison for LZMA), which is
//! why a compressed block must always end up strictly smaller than the raw
//! chunk it encodes.

use std::io::{Cursor, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use lzma_rs::compress::{Options as LzmaOptions, UnpackedSize};

use crate::error::{Result, SyncError};

/// Compression applied to the blocks of a file body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionKind {
    #[default]
    None,
    Zlib,
    Lzma,
}

/// Per-block LZMA framing: 5 properties bytes plus a little-endian u64
/// uncompressed length, in front of the raw LZMA stream.
pub const LZMA_HEADER_SIZE: usize = 13;

/// First-word values of a zlib stream, in both byte orders.
const ZLIB_MAGICS: [u16; 6] = [0x78DA, 0xDA78, 0x789C, 0x9C78, 0x7801, 0x0178];

/// Whether the first two bytes of a block look like a zlib stream.
pub fn is_zlib_magic(first: u8, second: u8) -> bool {
    ZLIB_MAGICS.contains(&u16::from_be_bytes([first, second]))
}

/// Compresses `src` into consecutive blocks of at most `max_uncompressed`
/// input bytes each. Returns the packed output along with each block's
/// on-disk size and whether it is actually compressed (raw storage is the
/// fallback whenever compression gives no gain).
pub fn compress_blocks(
    kind: CompressionKind,
    src: &[u8],
    max_uncompressed: usize,
    max_compressed: usize,
) -> Result<(Vec<u8>, Vec<u32>, Vec<bool>)> {
    if max_uncompressed == 0 {
        return Err(SyncError::Compression(
            "maximum uncompressed block size is zero".to_string(),
        ));
    }

    let mut dst = Vec::new();
    let mut block_sizes = Vec::new();
    let mut block_is_compressed = Vec::new();

    for chunk in src.chunks(max_uncompressed) {
        let encoded = match kind {
            CompressionKind::Lzma => Some(lzma_encode(chunk)?),
            CompressionKind::Zlib => Some(zlib_encode(chunk)?),
            CompressionKind::None => None,
        };

        // Keep the encoded form only if it is strictly smaller than both the
        // block budget and the chunk itself; a block as large as the chunk
        // would be indistinguishable from raw storage on the reader side.
        match encoded.filter(|e| e.len() < max_compressed.min(chunk.len())) {
            Some(encoded) => {
                block_sizes.push(encoded.len() as u32);
                block_is_compressed.push(true);
                dst.extend_from_slice(&encoded);
            }
            None => {
                block_sizes.push(chunk.len() as u32);
                block_is_compressed.push(false);
                dst.extend_from_slice(chunk);
            }
        }
    }

    Ok((dst, block_sizes, block_is_compressed))
}

/// Inverse of [`compress_blocks`]: walks `src` block by block, inflating
/// blocks flagged as compressed and copying the rest. Input past the last
/// described block is treated as a single stored tail block.
pub fn decompress_blocks(
    kind: CompressionKind,
    src: &[u8],
    block_sizes: &[u32],
    block_is_compressed: &[bool],
) -> Result<Vec<u8>> {
    let mut dst = Vec::new();
    let mut offset = 0usize;
    let mut block = 0usize;

    while offset < src.len() {
        let compressed = block_is_compressed.get(block).copied().unwrap_or(false);

        if compressed {
            let size = block_sizes
                .get(block)
                .map(|s| *s as usize)
                .ok_or_else(|| decompression_error(block, "block size missing"))?;
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= src.len())
                .ok_or_else(|| decompression_error(block, "block extends past input"))?;

            match kind {
                CompressionKind::Lzma => {
                    if size < LZMA_HEADER_SIZE {
                        return Err(decompression_error(block, "truncated LZMA block header"));
                    }
                    lzma_rs::lzma_decompress(&mut Cursor::new(&src[offset..end]), &mut dst)
                        .map_err(|e| decompression_error(block, &e.to_string()))?;
                }
                CompressionKind::Zlib => {
                    ZlibDecoder::new(&src[offset..end])
                        .read_to_end(&mut dst)
                        .map_err(|e| decompression_error(block, &e.to_string()))?;
                }
                // Blocks of an uncompressed body are never flagged, but a
                // caller-supplied flag still decodes as a copy.
                CompressionKind::None => dst.extend_from_slice(&src[offset..end]),
            }

            offset = end;
        } else {
            let size = match block_sizes.get(block) {
                Some(size) => *size as usize,
                None => src.len() - offset,
            };
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= src.len())
                .ok_or_else(|| decompression_error(block, "block extends past input"))?;

            dst.extend_from_slice(&src[offset..end]);
            offset = end;
        }

        block += 1;
    }

    Ok(dst)
}

fn lzma_encode(chunk: &[u8]) -> Result<Vec<u8>> {
    let mut encoded = Vec::with_capacity(chunk.len() / 2 + LZMA_HEADER_SIZE);
    let options = LzmaOptions {
        unpacked_size: UnpackedSize::WriteToHeader(Some(chunk.len() as u64)),
    };
    lzma_rs::lzma_compress_with_options(&mut Cursor::new(chunk), &mut encoded, &options)
        .map_err(|e| SyncError::Compression(e.to_string()))?;
    Ok(encoded)
}

fn zlib_encode(chunk: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(chunk.len() / 2),
        Compression::default(),
    );
    encoder
        .write_all(chunk)
        .map_err(|e| SyncError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SyncError::Compression(e.to_string()))
}

fn decompression_error(block: usize, detail: &str) -> SyncError {
    SyncError::Decompression(format!("block {block}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic stand-in for incompressible random data.
    fn xorshift_bytes(len: usize, mut state: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    fn repeated_text(len: usize) -> Vec<u8> {
        b"the quick brown fox jumps over the lazy dog; "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[test]
    fn lzma_round_trips_across_blocks() {
        let src = repeated_text(150_000);
        let (packed, sizes, flags) =
            compress_blocks(CompressionKind::Lzma, &src, 65536, 65536).unwrap();
        assert_eq!(sizes.len(), 3);
        assert_eq!(flags.len(), sizes.len());
        assert_eq!(sizes.iter().map(|s| *s as usize).sum::<usize>(), packed.len());

        let restored = decompress_blocks(CompressionKind::Lzma, &packed, &sizes, &flags).unwrap();
        assert_eq!(restored, src);
    }

    #[test]
    fn zlib_round_trips_and_shrinks_text() {
        let src = repeated_text(100_000);
        let (packed, sizes, flags) =
            compress_blocks(CompressionKind::Zlib, &src, 65536, 65536).unwrap();
        assert!(flags.iter().all(|f| *f));
        assert!(packed.len() < src.len());
        assert!(is_zlib_magic(packed[0], packed[1]));

        let restored = decompress_blocks(CompressionKind::Zlib, &packed, &sizes, &flags).unwrap();
        assert_eq!(restored, src);
    }

    #[test]
    fn incompressible_blocks_are_stored_raw() {
        let src = xorshift_bytes(100_000, 0x1234_5678);
        for kind in [CompressionKind::Lzma, CompressionKind::Zlib] {
            let (packed, sizes, flags) = compress_blocks(kind, &src, 65536, 65536).unwrap();
            assert_eq!(packed, src);
            assert_eq!(sizes, vec![65536, 34464]);
            assert_eq!(flags, vec![false, false]);

            let restored = decompress_blocks(kind, &packed, &sizes, &flags).unwrap();
            assert_eq!(restored, src);
        }
    }

    #[test]
    fn uncompressed_kind_chunks_without_encoding() {
        let src = repeated_text(70_000);
        let (packed, sizes, flags) =
            compress_blocks(CompressionKind::None, &src, 65536, 65536).unwrap();
        assert_eq!(packed, src);
        assert_eq!(sizes, vec![65536, 4464]);
        assert!(flags.iter().all(|f| !*f));
    }

    #[test]
    fn empty_input_produces_no_blocks() {
        let (packed, sizes, flags) =
            compress_blocks(CompressionKind::Lzma, &[], 65536, 65536).unwrap();
        assert!(packed.is_empty() && sizes.is_empty() && flags.is_empty());
    }

    #[test]
    fn zero_block_size_is_rejected() {
        assert!(matches!(
            compress_blocks(CompressionKind::Zlib, b"abc", 0, 0),
            Err(SyncError::Compression(_))
        ));
    }

    #[test]
    fn truncated_lzma_block_fails() {
        let result = decompress_blocks(CompressionKind::Lzma, &[0x5D; 5], &[5], &[true]);
        assert!(matches!(result, Err(SyncError::Decompression(_))));
    }

    #[test]
    fn input_past_block_metadata_is_a_stored_tail() {
        let src = repeated_text(1000);
        let (mut packed, sizes, flags) =
            compress_blocks(CompressionKind::Zlib, &src, 65536, 65536).unwrap();
        packed.extend_from_slice(b"tail");

        let restored = decompress_blocks(CompressionKind::Zlib, &packed, &sizes, &flags).unwrap();
        assert_eq!(&restored[..src.len()], &src[..]);
        assert_eq!(&restored[src.len()..], b"tail");
    }
}
