//! Gzip response decoding
//!
//! A request only advertises gzip when it carries no `Range` header, so a
//! compressed response never participates in byte-range splitting: it is
//! served on the main session alone and decoded here. The encoded bytes are
//! collected and inflated in one pass; the declared range of a response body
//! is permitted to reside in memory either way.

use std::io::Read;

use flate2::read::MultiGzDecoder;

use crate::http::response::DirectBody;

/// Body wrapper inflating a gzip-encoded response stream.
pub struct GzipBody {
    inner: DirectBody,
    decoded: Option<Vec<u8>>,
    pos: usize,
}

impl GzipBody {
    pub(crate) fn new(inner: DirectBody) -> Self {
        Self {
            inner,
            decoded: None,
            pos: 0,
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> crate::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.decoded.is_none() {
            self.inflate().await?;
        }
        let decoded = self.decoded.as_ref().expect("decoded body present");
        let available = decoded.len() - self.pos;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&decoded[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    async fn inflate(&mut self) -> crate::Result<()> {
        let mut raw = Vec::new();
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
        }

        let mut decoded = Vec::new();
        MultiGzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .map_err(crate::error::body)?;
        self.decoded = Some(decoded);
        Ok(())
    }
}

impl std::fmt::Debug for GzipBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipBody")
            .field("decoded", &self.decoded.as_ref().map(Vec::len))
            .field("pos", &self.pos)
            .finish()
    }
}
