//! NUL-escaped message framing over a duplex byte stream.
//!
//! Wire rules:
//! - a literal 0 in opaque data is sent as two consecutive 0 bytes;
//! - `0 kind len4` (kind nonzero, len4 big-endian) introduces a message of
//!   exactly `len4` payload bytes, which are not themselves stuffed;
//! - every other byte is opaque data.

use std::io;

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::MessageKind;

/// `0 kind len4`.
const HEADER_LEN: usize = 6;

/// Header and payload are coalesced into one underlying write up to this
/// many bytes; longer payloads get a second tail write.
const COPY_THRESHOLD: usize = 1024;

/// Read-buffer growth step. The reader never allocates an advertised
/// payload length up front; it grows toward it as bytes arrive.
const CHUNK: usize = 4096;

/// Serializing writer for the mixed data/message stream.
///
/// All methods take `&self`; an internal lock guarantees that concurrent
/// senders interleave at message boundaries only.
pub struct MessageWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Write opaque terminal data, stuffing embedded NULs. Returns the
    /// logical byte count (excluding the doubled zeros).
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut stuffed = bytes::BytesMut::with_capacity(buf.len() + 8);
        for &b in buf {
            stuffed.put_u8(b);
            if b == 0 {
                stuffed.put_u8(0);
            }
        }
        let mut w = self.inner.lock().await;
        w.write_all(&stuffed).await?;
        w.flush().await?;
        Ok(buf.len())
    }

    /// Send a control message. `Data` delegates to [`write`](Self::write);
    /// everything else is framed as `0 kind len4 payload`.
    pub async fn send(&self, kind: MessageKind, payload: &[u8]) -> io::Result<()> {
        if kind == MessageKind::Data {
            self.write(payload).await?;
            return Ok(());
        }
        debug_assert!(payload.len() <= u32::MAX as usize);
        let copied = payload.len().min(COPY_THRESHOLD - HEADER_LEN);
        let mut head = bytes::BytesMut::with_capacity(HEADER_LEN + copied);
        head.put_u8(0);
        head.put_u8(kind as u8);
        head.put_u32(payload.len() as u32);
        head.put_slice(&payload[..copied]);
        let mut w = self.inner.lock().await;
        w.write_all(&head).await?;
        if copied < payload.len() {
            w.write_all(&payload[copied..]).await?;
        }
        w.flush().await?;
        Ok(())
    }

    /// Shut down the underlying stream.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.lock().await.shutdown().await
    }
}

/// Deframing reader. Opaque bytes come back through [`read`](Self::read);
/// control messages are handed to the callback synchronously, in stream
/// order, as `(wire kind byte, payload)`.
pub struct MessageReader<R, F> {
    inner: R,
    callback: F,
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    err: Option<io::Error>,
    eof: bool,
}

impl<R, F> MessageReader<R, F>
where
    R: AsyncRead + Unpin,
    F: FnMut(u8, &[u8]),
{
    pub fn new(inner: R, callback: F) -> Self {
        Self {
            inner,
            callback,
            buf: vec![0; 1024],
            head: 0,
            tail: 0,
            err: None,
            eof: false,
        }
    }

    /// Read opaque data into `out`, dispatching any interleaved messages.
    ///
    /// If opaque bytes have already been copied when a message start is
    /// seen, the call returns early so the caller observes a deterministic
    /// boundary between data and control. `Ok(0)` means a clean end of
    /// stream (for a nonempty `out`).
    pub async fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut cnt = 0usize;
        loop {
            if cnt == out.len() {
                return Ok(cnt);
            }
            if !self.fill(1).await {
                return self.stalled(cnt, false);
            }

            if self.buf[self.head] != 0 {
                // Opaque run: copy up to the next NUL, the end of the
                // buffered bytes, or the caller's remaining space.
                let window = (self.tail - self.head).min(out.len() - cnt);
                let run = &self.buf[self.head..self.head + window];
                match run.iter().position(|&b| b == 0) {
                    None => {
                        out[cnt..cnt + window].copy_from_slice(run);
                        self.head += window;
                        return Ok(cnt + window);
                    }
                    Some(x) => {
                        out[cnt..cnt + x].copy_from_slice(&run[..x]);
                        self.head += x;
                        cnt += x;
                    }
                }
            }

            // A NUL is at the head: either a stuffed data zero or a header.
            if !self.fill(2).await {
                return self.stalled(cnt, true);
            }
            if self.buf[self.head + 1] == 0 {
                out[cnt] = 0;
                cnt += 1;
                self.head += 2;
                continue;
            }

            // A message starts here; hand back any opaque bytes first.
            if cnt > 0 {
                return Ok(cnt);
            }

            if !self.fill(HEADER_LEN).await {
                return self.stalled(cnt, true);
            }
            let kind = self.buf[self.head + 1];
            let len = u32::from_be_bytes([
                self.buf[self.head + 2],
                self.buf[self.head + 3],
                self.buf[self.head + 4],
                self.buf[self.head + 5],
            ]) as usize;
            self.head += HEADER_LEN;

            if !self.fill(len).await {
                return self.stalled(cnt, true);
            }
            (self.callback)(kind, &self.buf[self.head..self.head + len]);
            self.head += len;
        }
    }

    fn stalled(&mut self, cnt: usize, mid_message: bool) -> io::Result<usize> {
        let pending = match self.err.take() {
            Some(e) => Some(e),
            None if self.eof && mid_message => Some(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a message",
            )),
            None => None,
        };
        match pending {
            Some(e) if cnt == 0 => Err(e),
            Some(e) => {
                // Surface the buffered bytes now; the error re-appears on
                // the next read.
                self.err = Some(e);
                Ok(cnt)
            }
            None => Ok(cnt),
        }
    }

    /// Buffer at least `count` contiguous bytes. Returns false once the
    /// stream errors or ends before that many bytes exist.
    async fn fill(&mut self, count: usize) -> bool {
        if self.tail - self.head >= count {
            return true;
        }
        if self.head >= self.tail {
            self.head = 0;
            self.tail = 0;
        }
        loop {
            if self.tail - self.head >= count {
                return true;
            }
            if self.eof || self.err.is_some() {
                return false;
            }
            if self.head > 0 && self.head + count > self.buf.len() {
                let have = self.tail - self.head;
                self.buf.copy_within(self.head..self.tail, 0);
                self.head = 0;
                self.tail = have;
            }
            if self.tail == self.buf.len() {
                let new_len = (self.buf.len() + CHUNK).min(count);
                self.buf.resize(new_len, 0);
            }
            match self.inner.read(&mut self.buf[self.tail..]).await {
                Ok(0) => self.eof = true,
                Ok(n) => self.tail += n,
                Err(e) => self.err = Some(e),
            }
        }
    }
}
