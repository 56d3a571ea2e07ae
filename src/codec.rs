//! zstd compression helpers for blobs and manifests.

use std::io::{self, Read};

/// How a blob's payload is stored.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Compression {
    None,
    ZStd,
}

impl Compression {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ZStd => "zstd",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "zstd" => Some(Self::ZStd),
            _ => None,
        }
    }
}

/// A grow-only scratch buffer reused across compression calls, avoiding a
/// fresh allocation per blob during ingestion.
#[derive(Default)]
pub struct CompressBuffer(Vec<u8>);

impl CompressBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Grows the scratch buffer's capacity to at least a conservative
    /// compress-bound estimate for `len` uncompressed bytes, so repeated
    /// calls for similarly-sized blobs stop reallocating.
    fn ensure_capacity(&mut self, len: usize) {
        let bound = len + len / 16 + 64;
        if self.0.capacity() < bound {
            self.0.reserve(bound - self.0.capacity());
        }
    }
}

type ZstdEncoder<W> = zstd::stream::write::Encoder<'static, W>;
type ZstdDecoder<R> = zstd::stream::read::Decoder<'static, R>;

/// Compresses `data` at `level`, writing the compressed output directly into
/// `buf`'s backing allocation (grown beforehand if needed) rather than
/// letting zstd allocate its own destination buffer.
pub fn zstd_compress(data: &[u8], level: i32, buf: &mut CompressBuffer) -> io::Result<Vec<u8>> {
    buf.ensure_capacity(data.len());
    let written = zstd::bulk::compress_to_buffer(data, &mut buf.0, level)?;
    Ok(buf.0[..written].to_vec())
}

/// Decompresses a one-shot zstd block (e.g. a manifest) of known uncompressed
/// size.
pub fn zstd_decompress(data: &[u8], uncompressed_size: usize) -> io::Result<Vec<u8>> {
    zstd::block::decompress(data, uncompressed_size)
}

/// Wraps a reader in a streaming zstd decoder, for decompressing blobs
/// without materializing the whole compressed buffer first.
pub fn zstd_decompress_stream<R: Read>(reader: R) -> io::Result<ZstdDecoder<io::BufReader<R>>> {
    ZstdDecoder::new(reader)
}

/// Wraps a writer in a streaming zstd encoder at `level`.
pub fn zstd_compress_stream<W: std::io::Write>(writer: W, level: i32) -> io::Result<ZstdEncoder<W>> {
    ZstdEncoder::new(writer, level)
}

/// Whether compressing `uncompressed_len` bytes down to `compressed_len` is
/// worth the CPU and storage overhead, per the configured savings threshold.
///
/// `compressed + threshold < uncompressed`.
#[must_use]
pub const fn worth_compressing(uncompressed_len: usize, compressed_len: usize, threshold: usize) -> bool {
    compressed_len + threshold < uncompressed_len
}

/// Compresses `data` if enabled and worthwhile; otherwise returns the
/// original bytes tagged [`Compression::None`].
pub fn compress_if_worthwhile(
    data: &[u8],
    enabled: bool,
    level: i32,
    threshold: usize,
    buf: &mut CompressBuffer,
) -> io::Result<(Compression, Vec<u8>)> {
    if !enabled || data.is_empty() {
        return Ok((Compression::None, data.to_vec()));
    }
    let compressed = zstd_compress(data, level, buf)?;
    if worth_compressing(data.len(), compressed.len(), threshold) {
        Ok((Compression::ZStd, compressed))
    } else {
        Ok((Compression::None, data.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut buf = CompressBuffer::new();
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".repeat(50);
        let compressed = zstd_compress(&data, 3, &mut buf).unwrap();
        assert!(compressed.len() < data.len());
        let decompressed = zstd_decompress(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn worth_compressing_predicate() {
        assert!(worth_compressing(1000, 10, 16));
        assert!(!worth_compressing(1000, 995, 16));
        assert!(!worth_compressing(100, 100, 0));
    }

    #[test]
    fn incompressible_small_data_stays_uncompressed() {
        let mut buf = CompressBuffer::new();
        let data = [1u8, 2, 3];
        let (kind, bytes) = compress_if_worthwhile(&data, true, 3, 8, &mut buf).unwrap();
        assert_eq!(kind, Compression::None);
        assert_eq!(bytes, data);
    }

    #[test]
    fn empty_data_never_compressed() {
        let mut buf = CompressBuffer::new();
        let (kind, bytes) = compress_if_worthwhile(&[], true, 3, 0, &mut buf).unwrap();
        assert_eq!(kind, Compression::None);
        assert!(bytes.is_empty());
    }
}
