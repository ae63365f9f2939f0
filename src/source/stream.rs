// Response streams handed to the renderer: fully buffered, or bridged onto a body still arriving.

use std::io::{self, Read};

use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::SessionConnection;

/// Readable response body. A bridged stream yields the bytes read so far, then blocks on the
/// live tail; read it from a renderer thread, not from inside an async task.
pub struct SessionStream {
    current: Bytes,
    tail: Option<mpsc::UnboundedReceiver<io::Result<Bytes>>>,
    bridged: bool,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl SessionStream {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            current: bytes.into(),
            tail: None,
            bridged: false,
            on_close: None,
        }
    }

    pub fn bridged(prefix: Bytes, tail: mpsc::UnboundedReceiver<io::Result<Bytes>>) -> Self {
        Self {
            current: prefix,
            tail: Some(tail),
            bridged: true,
            on_close: None,
        }
    }

    /// Run `hook` once when the stream is dropped.
    pub(crate) fn with_close_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Drop the stream without running its close hook.
    pub(crate) fn discard(mut self) {
        self.on_close = None;
    }

    pub fn is_bridged(&self) -> bool {
        self.bridged
    }

    /// Drain the stream from async code.
    pub async fn read_all(mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::from(&self.current[..]);
        if let Some(rx) = self.tail.as_mut() {
            while let Some(chunk) = rx.recv().await {
                out.extend_from_slice(&chunk?);
            }
        }
        Ok(out.freeze())
    }
}

impl Read for SessionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.current.is_empty() {
                let n = buf.len().min(self.current.len());
                buf[..n].copy_from_slice(&self.current[..n]);
                self.current.advance(n);
                return Ok(n);
            }
            let Some(rx) = self.tail.as_mut() else {
                return Ok(0);
            };
            match rx.blocking_recv() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => {
                    self.tail = None;
                    return Err(e);
                }
                None => {
                    self.tail = None;
                    return Ok(0);
                }
            }
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

/// Read `conn`'s body into `buf` until it ends (`Ok(true)`) or `brk` fires (`Ok(false)`).
/// `closed` aborts the read with an error.
pub(crate) async fn read_until(
    conn: &mut (dyn SessionConnection + '_),
    buf: &mut BytesMut,
    brk: Option<&CancellationToken>,
    closed: &CancellationToken,
    mut on_progress: impl FnMut(usize),
) -> Result<bool> {
    let never = CancellationToken::new();
    let brk = brk.unwrap_or(&never);
    loop {
        if brk.is_cancelled() {
            return Ok(false);
        }
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(anyhow!("connection closed while reading body")),
            _ = brk.cancelled() => return Ok(false),
            chunk = conn.next_chunk() => chunk?,
        };
        match next {
            Some(chunk) => {
                buf.extend_from_slice(&chunk);
                on_progress(buf.len());
            }
            None => return Ok(true),
        }
    }
}

/// Hand the rest of `conn`'s body to a background pump and return a stream over `prefix`
/// plus the live tail. `on_close` receives the complete body, or `None` if reading failed.
pub(crate) fn bridge<F>(
    prefix: Bytes,
    mut conn: Box<dyn SessionConnection>,
    closed: CancellationToken,
    on_close: F,
) -> SessionStream
where
    F: FnOnce(Option<Bytes>) + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<io::Result<Bytes>>();
    let mut full = BytesMut::from(&prefix[..]);

    tokio::spawn(async move {
        let mut forwarding = true;
        let complete = loop {
            let next = tokio::select! {
                biased;
                _ = closed.cancelled() => break false,
                chunk = conn.next_chunk() => chunk,
            };
            match next {
                Ok(Some(chunk)) => {
                    full.extend_from_slice(&chunk);
                    if forwarding && tx.send(Ok(chunk)).is_err() {
                        debug!("bridged stream reader dropped, draining body for cache");
                        forwarding = false;
                    }
                }
                Ok(None) => break true,
                Err(e) => {
                    if forwarding {
                        let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
                    }
                    break false;
                }
            }
        };
        drop(tx);
        conn.disconnect();
        on_close(complete.then(|| full.freeze()));
    });

    SessionStream::bridged(prefix, rx)
}
