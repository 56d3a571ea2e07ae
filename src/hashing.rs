//! BLAKE2b-256 hashing, the hash used to identify every blob and manifest.

use std::fmt;
use std::io::{self, Read, Write};

use blake2::Blake2b;
use blake2::digest::consts::U32;
use blake2::digest::{Digest, Output};

type Blake2b256 = Blake2b<U32>;
type Hash32 = Output<Blake2b256>;

/// A 32-byte BLAKE2b hash, used for blob content IDs and manifest hashes.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectHash(Hash32);

impl ObjectHash {
    /// Hashes `bytes` in one shot. Used when the caller already has the full
    /// buffer in memory (ingestion, which fully buffers each zip entry).
    #[must_use]
    pub fn hash(bytes: &[u8]) -> Self {
        Self(Blake2b256::digest(bytes))
    }

    /// The raw 32-byte digest.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_ref()
    }

    /// Upper-case hex encoding, as used in the canonical manifest text.
    #[must_use]
    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Lower-case hex encoding, as used for SHA-256 checksums in JSON bodies.
    #[must_use]
    pub fn to_hex_lower(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string (either case) into a hash.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(Hash32::from(out)))
    }
}

impl From<[u8; 32]> for ObjectHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(Hash32::from(bytes))
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.to_hex_upper())
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_upper())
    }
}

/// Incremental BLAKE2b-256 reader, for hashing streams of unbounded size
/// (server-build zip uploads) without buffering them fully.
pub struct HashingReader<R> {
    inner: R,
    hasher: Blake2b256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Blake2b256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectHash, R) {
        (ObjectHash(self.hasher.finalize()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

/// Incremental BLAKE2b-256 writer, the counterpart to [`HashingReader`].
pub struct HashingWriter<W> {
    inner: W,
    hasher: Blake2b256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Blake2b256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectHash, W) {
        (ObjectHash(self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A writer that only counts bytes written, without buffering them.
///
/// Used to measure response body size for request logging.
pub struct CountWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Builds the canonical manifest text for a version:
///
/// ```text
/// Robust Content Manifest 1\n
/// <HEX-UPPER-BLAKE2B-256> <full-entry-path>\n
/// ...
/// ```
///
/// Entries must already be sorted ordinally by path with directory entries
/// excluded; this function only formats and hashes.
#[must_use]
pub fn canonical_manifest_text(entries: &[(ObjectHash, String)]) -> String {
    let mut text = String::from("Robust Content Manifest 1\n");
    for (hash, path) in entries {
        text.push_str(&hash.to_hex_upper());
        text.push(' ');
        text.push_str(path);
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        let id = ObjectHash::hash(b"hello");
        assert_eq!(id.to_hex_upper().len(), 64);
        assert_eq!(id, ObjectHash::hash(b"hello"));
        assert_ne!(id, ObjectHash::hash(b"world"));
    }

    #[test]
    fn hex_round_trip() {
        let id = ObjectHash::hash(b"round trip me");
        let hex = id.to_hex_lower();
        let back = ObjectHash::from_hex(&hex).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn reader_and_writer_agree() {
        let data = b"Developers, developers, developers, developers!";
        let mut r = HashingReader::new(&data[..]);
        io::copy(&mut r, &mut io::sink()).unwrap();
        let (from_reader, _) = r.finalize();

        let mut w = HashingWriter::new(io::sink());
        w.write_all(data).unwrap();
        let (from_writer, _) = w.finalize();

        assert_eq!(from_reader, from_writer);
        assert_eq!(from_reader, ObjectHash::hash(data));
    }

    #[test]
    fn canonical_manifest_matches_scenario_one() {
        let a = ObjectHash::hash(b"hello");
        let b = ObjectHash::hash(b"world");
        let text = canonical_manifest_text(&[(a, "a.txt".into()), (b, "b.txt".into())]);
        assert_eq!(
            text,
            format!(
                "Robust Content Manifest 1\n{} a.txt\n{} b.txt\n",
                a.to_hex_upper(),
                b.to_hex_upper()
            )
        );
    }

    #[test]
    fn count_writer_counts_without_buffering() {
        let mut cw = CountWriter::new(io::sink());
        cw.write_all(b"0123456789").unwrap();
        assert_eq!(cw.count(), 10);
    }
}
