//! Bidirectional byte pump.
//!
//! Each session runs one pump: two copy loops over pooled slabs, one per
//! direction. The first direction to finish — error or EOF — ends the
//! session; the Drop of the remaining half tears the other direction
//! down, which matches how the peers observe a closed proxy.

use std::io;

use pin_project_lite::pin_project;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::pool::BufferPool;

pin_project! {
    /// Stream wrapper that replays a prefix before reading the inner
    /// stream. Writes go straight through. Used to put an already-consumed
    /// first packet back in front of a client stream.
    pub struct PrefixedStream<S> {
        prefix: Bytes,
        #[pin]
        inner: S,
    }
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return std::task::Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

async fn copy_with_slab<R, W>(reader: &mut R, writer: &mut W, pool: &BufferPool) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let result = async {
        let mut total: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                let _ = writer.shutdown().await;
                return Ok(total);
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
    .await;
    pool.put(buf);
    result
}

/// Pump bytes both ways until one direction finishes.
///
/// Returns `(a_to_b, b_to_a)` byte counts observed so far on the winning
/// side; the losing direction is dropped mid-copy.
pub async fn pump<A, B>(a: A, b: B, pool: &BufferPool) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let up = copy_with_slab(&mut a_read, &mut b_write, pool);
    let down = copy_with_slab(&mut b_read, &mut a_write, pool);
    tokio::pin!(up, down);

    tokio::select! {
        result = &mut up => {
            let sent = result?;
            Ok((sent, 0))
        }
        result = &mut down => {
            let received = result?;
            Ok((0, received))
        }
    }
}
