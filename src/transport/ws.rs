//! WebSocket byte-stream adapter.
//!
//! Wraps a client WebSocket as AsyncRead + AsyncWrite so the relay
//! machinery can treat the tunnel like any TCP stream. Reads buffer the
//! current binary frame and hand it out piecewise — frame boundaries are
//! invisible to the caller. Writes emit one binary frame per call, with
//! backpressure surfaced as Pending rather than an error.
//!
//! Normal closes (1005/1006 and friends) surface as a clean EOF: for a
//! relay they mean "the other side is done", not a failure.

use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use crate::logger::log;

pub struct WsStream<S> {
    ws: WebSocketStream<S>,
    read_buffer: Bytes,
    read_pos: usize,
    closed: bool,
    label: String,
}

impl<S> WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(ws: WebSocketStream<S>, label: String) -> Self {
        Self {
            ws,
            read_buffer: Bytes::new(),
            read_pos: 0,
            closed: false,
            label,
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }

        if self.read_pos < self.read_buffer.len() {
            let remaining = &self.read_buffer[self.read_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.read_pos += to_copy;

            if self.read_pos >= self.read_buffer.len() {
                self.read_buffer = Bytes::new();
                self.read_pos = 0;
            }

            return Poll::Ready(Ok(()));
        }

        match Stream::poll_next(Pin::new(&mut self.ws), cx) {
            Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                let to_copy = data.len().min(buf.remaining());
                buf.put_slice(&data[..to_copy]);

                if to_copy < data.len() {
                    self.read_buffer = data.slice(to_copy..);
                    self.read_pos = 0;
                }

                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Ok(Message::Close(frame)))) => {
                log::debug!(
                    endpoint = %self.label,
                    close_code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1005),
                    "tunnel stream closed by peer"
                );
                self.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => {
                log::debug!(endpoint = %self.label, error = %e, "tunnel stream read error");
                self.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Ok(_))) => {
                // Ignore pings/pongs/text; come back for the next frame
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Poll::Ready(None) => {
                self.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel stream closed",
            )));
        }

        let me = &mut *self;
        match Sink::poll_ready(Pin::new(&mut me.ws), cx) {
            Poll::Ready(Ok(())) => {
                let data = Bytes::copy_from_slice(buf);
                Sink::start_send(Pin::new(&mut me.ws), Message::Binary(data)).map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel frame send failed")
                })?;
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "tunnel sink error",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Sink::poll_flush(Pin::new(&mut self.ws), cx)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tunnel flush failed"))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.closed {
            self.closed = true;
            let me = &mut *self;
            if let Poll::Ready(Ok(())) = Sink::poll_ready(Pin::new(&mut me.ws), cx) {
                let _ = Sink::start_send(Pin::new(&mut me.ws), Message::Close(None));
            }
        }
        // Best-effort close; do not hang a teardown on a slow peer.
        Poll::Ready(Ok(()))
    }
}
