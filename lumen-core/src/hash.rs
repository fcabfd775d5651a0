//! Content identification.
//!
//! Every cache entry and lock record is keyed by the SHA-256 digest of the raw
//! source bytes. URLs never take part in the key: the same image served from
//! two CDNs resolves to the same analysis.
//!
//! Source downloads go through [`FanOutWriter`], which hashes each chunk as it
//! is written to local scratch storage, so the payload is read once and never
//! buffered twice.

use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;

/// SHA-256 digest length in bytes.
pub const CONTENT_HASH_BYTES: usize = 32;

/// Stable identifier of an image's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; CONTENT_HASH_BYTES]);

impl ContentHash {
    /// Hash an in-memory buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    fn from_hasher(hasher: Sha256) -> Self {
        let mut digest = [0u8; CONTENT_HASH_BYTES];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    /// Lowercase hex rendering, as used in storage paths and lock keys.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines and terminal output.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Error returned when parsing a hash from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid content hash: {0}")]
pub struct ParseContentHashError(String);

impl FromStr for ContentHash {
    type Err = ParseContentHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| ParseContentHashError(e.to_string()))?;
        let digest: [u8; CONTENT_HASH_BYTES] = bytes.try_into().map_err(|v: Vec<u8>| {
            ParseContentHashError(format!(
                "expected {CONTENT_HASH_BYTES} bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(digest))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Writer that duplicates every chunk into a SHA-256 hasher and an inner sink.
///
/// Only the bytes the inner writer accepts are hashed, so the digest always
/// matches what actually landed in the sink.
pub struct FanOutWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W> FanOutWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consume the writer, returning the inner sink, the digest and the byte count.
    pub fn finish(self) -> (W, ContentHash, u64) {
        (self.inner, ContentHash::from_hasher(self.hasher), self.written)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FanOutWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.hasher.update(&buf[..n]);
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Hash a byte stream without keeping it.
pub async fn hash_reader<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<ContentHash> {
    let mut writer = FanOutWriter::new(tokio::io::sink());
    tokio::io::copy(reader, &mut writer).await?;
    let (_, hash, _) = writer.finish();
    Ok(hash)
}

/// Stream `reader` into a new file at `path` while hashing it.
///
/// Returns the digest and the number of bytes persisted.
pub async fn persist_reader<R: AsyncRead + Unpin>(
    reader: &mut R,
    path: &Path,
) -> io::Result<(ContentHash, u64)> {
    let file = tokio::fs::File::create(path).await?;
    let mut writer = FanOutWriter::new(BufWriter::new(file));
    tokio::io::copy(reader, &mut writer).await?;
    writer.flush().await?;
    let (_, hash, written) = writer.finish();
    Ok((hash, written))
}

/// [`persist_reader`] for a chunked byte stream such as an HTTP body.
///
/// A read error in the stream aborts the copy and is returned as-is.
pub async fn persist_stream<S>(stream: S, path: &Path) -> io::Result<(ContentHash, u64)>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let reader = StreamReader::new(stream);
    tokio::pin!(reader);
    persist_reader(&mut reader, path).await
}
