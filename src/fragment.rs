//! First-packet fragmentation.
//!
//! The opening application record of a session (TLS ClientHello or HTTP
//! request) is split around the hostname into three regions — before the
//! SNI, the SNI itself, after the SNI — and each region is emitted as a
//! series of sub-fragments with randomized lengths and inter-fragment
//! delays. A middlebox reassembling per-packet never sees the hostname as
//! one contiguous token. The SNI bytes are additionally case-mangled:
//! names are case-insensitive in DNS and TLS, so the destination accepts
//! them unchanged.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::sniff;

/// Length and pacing ranges for the three first-packet regions.
///
/// Every range is inclusive of `min` and exclusive of `max` when drawn,
/// except that `min == max` means the constant value with no RNG draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentPolicy {
    pub before_sni: (usize, usize),
    pub sni: (usize, usize),
    pub after_sni: (usize, usize),
    pub delay_ms: (u64, u64),
}

impl FragmentPolicy {
    pub fn new(
        before_sni: (usize, usize),
        sni: (usize, usize),
        after_sni: (usize, usize),
        delay_ms: (u64, u64),
    ) -> Self {
        Self {
            before_sni,
            sni,
            after_sni,
            delay_ms,
        }
    }

    fn range_for(&self, region: Region) -> (usize, usize) {
        match region {
            Region::BeforeSni => self.before_sni,
            Region::Sni => self.sni,
            Region::AfterSni => self.after_sni,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    BeforeSni,
    Sni,
    AfterSni,
}

/// One planned wire write and the pause that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFragment {
    pub bytes: Vec<u8>,
    pub delay_ms: u64,
}

fn draw(range: (usize, usize), rng: &mut SmallRng) -> usize {
    let (min, max) = range;
    if max > min {
        rng.gen_range(min..max)
    } else {
        min
    }
}

fn draw_delay(range: (u64, u64), rng: &mut SmallRng) -> u64 {
    let (min, max) = range;
    if max > min {
        rng.gen_range(min..max)
    } else {
        min
    }
}

fn mangle_case(bytes: &mut [u8], rng: &mut SmallRng) {
    for b in bytes.iter_mut() {
        if b.is_ascii_alphabetic() && rng.gen_bool(0.5) {
            *b = b.to_ascii_uppercase();
        }
    }
}

fn push_region(
    out: &mut Vec<PlannedFragment>,
    data: &[u8],
    region: Region,
    policy: &FragmentPolicy,
    rng: &mut SmallRng,
) {
    let range = policy.range_for(region);
    let mut position = 0;
    while position < data.len() {
        let mut len = draw(range, rng).max(1);
        if len > data.len() - position {
            len = data.len() - position;
        }
        let delay_ms = draw_delay(policy.delay_ms, rng);
        out.push(PlannedFragment {
            bytes: data[position..position + len].to_vec(),
            delay_ms,
        });
        position += len;
    }
}

/// Plan the writes for a first packet.
///
/// When no SNI can be located the whole packet is one region using the
/// before-SNI ranges. Concatenating the planned fragments reproduces the
/// input exactly, except for the SNI case mangling.
pub fn plan_first_packet(
    data: &[u8],
    policy: &FragmentPolicy,
    rng: &mut SmallRng,
) -> Vec<PlannedFragment> {
    let mut out = Vec::new();

    let sni = sniff::client_hello_sni(data);
    let index = sni.as_ref().and_then(|name| {
        data.windows(name.len()).position(|window| window == &name[..])
    });

    match (sni, index) {
        (Some(name), Some(index)) => {
            let mut mangled = name.clone();
            mangle_case(&mut mangled, rng);
            push_region(&mut out, &data[..index], Region::BeforeSni, policy, rng);
            push_region(&mut out, &mangled, Region::Sni, policy, rng);
            push_region(
                &mut out,
                &data[index + name.len()..],
                Region::AfterSni,
                policy,
                rng,
            );
        }
        _ => push_region(&mut out, data, Region::BeforeSni, policy, rng),
    }

    out
}

enum WriteState {
    /// Next write is the first packet and gets the full treatment
    First,
    /// Mid-plan: emitting fragments of the first packet
    Emitting {
        frags: Vec<PlannedFragment>,
        idx: usize,
        off: usize,
        reported: usize,
        delay: Option<Pin<Box<Sleep>>>,
    },
    /// First packet done, everything else is forwarded untouched
    Passthrough,
}

/// Stream adapter that fragments the first write.
///
/// The first `poll_write` is expanded into the planned sub-fragments with
/// pacing sleeps between them; once the plan drains, the adapter reports
/// the original buffer length and becomes transparent. Callers follow the
/// usual `AsyncWrite` contract of re-presenting the same buffer until
/// `Ready`, so the plan built from the first presentation stays valid.
pub struct FragmentStream<S> {
    inner: S,
    policy: FragmentPolicy,
    rng: SmallRng,
    state: WriteState,
}

impl<S> FragmentStream<S> {
    pub fn new(inner: S, policy: FragmentPolicy) -> Self {
        Self {
            inner,
            policy,
            rng: SmallRng::from_entropy(),
            state: WriteState::First,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;

        if matches!(me.state, WriteState::First) {
            let frags = plan_first_packet(buf, &me.policy, &mut me.rng);
            me.state = WriteState::Emitting {
                frags,
                idx: 0,
                off: 0,
                reported: buf.len(),
                delay: None,
            };
        }

        loop {
            match &mut me.state {
                WriteState::Passthrough => return Pin::new(&mut me.inner).poll_write(cx, buf),
                WriteState::First => unreachable!("first write already planned"),
                WriteState::Emitting {
                    frags,
                    idx,
                    off,
                    reported,
                    delay,
                } => {
                    if let Some(sleep) = delay {
                        match sleep.as_mut().poll(cx) {
                            Poll::Ready(()) => *delay = None,
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    if *idx >= frags.len() {
                        let n = *reported;
                        me.state = WriteState::Passthrough;
                        return Poll::Ready(Ok(n));
                    }

                    let frag = &frags[*idx];
                    match Pin::new(&mut me.inner).poll_write(cx, &frag.bytes[*off..]) {
                        Poll::Ready(Ok(0)) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "connection closed mid-fragment",
                            )))
                        }
                        Poll::Ready(Ok(n)) => {
                            *off += n;
                            if *off >= frag.bytes.len() {
                                let pause = frag.delay_ms;
                                *off = 0;
                                *idx += 1;
                                if pause > 0 && *idx < frags.len() {
                                    *delay = Some(Box::pin(tokio::time::sleep(
                                        Duration::from_millis(pause),
                                    )));
                                }
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::hello::ClientHelloSpec;
    use tokio::io::AsyncWriteExt;

    fn test_rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    fn reassemble(frags: &[PlannedFragment]) -> Vec<u8> {
        frags.iter().flat_map(|f| f.bytes.clone()).collect()
    }

    #[test]
    fn test_plan_preserves_bytes_without_hostname() {
        let data: Vec<u8> = (0u8..=255).collect();
        let policy = FragmentPolicy::new((7, 13), (2, 3), (7, 13), (0, 0));
        let mut rng = test_rng();
        let frags = plan_first_packet(&data, &policy, &mut rng);
        assert!(frags.len() > 1);
        assert_eq!(reassemble(&frags), data);
    }

    #[test]
    fn test_plan_splits_hello_around_sni() {
        let hello = ClientHelloSpec::padded("example.com", 64).encode();
        let policy = FragmentPolicy::new((5, 5), (2, 2), (5, 5), (0, 0));
        let mut rng = test_rng();
        let frags = plan_first_packet(&hello, &policy, &mut rng);

        let out = reassemble(&frags);
        assert_eq!(out.len(), hello.len());
        // Byte-preserving except for SNI case mangling
        assert_eq!(out.to_ascii_lowercase(), hello.to_ascii_lowercase());

        let sni_index = hello
            .windows(11)
            .position(|w| w == b"example.com")
            .unwrap();
        let pre = sni_index;
        let post = hello.len() - sni_index - 11;
        let expected_min = pre.div_ceil(5) + 11usize.div_ceil(2) + post.div_ceil(5);
        assert!(frags.len() >= expected_min);
    }

    #[test]
    fn test_plan_constant_ranges_are_deterministic_lengths() {
        let data = vec![0xAA; 23];
        let policy = FragmentPolicy::new((5, 5), (1, 1), (5, 5), (0, 0));
        let mut rng = test_rng();
        let frags = plan_first_packet(&data, &policy, &mut rng);
        let lens: Vec<usize> = frags.iter().map(|f| f.bytes.len()).collect();
        assert_eq!(lens, vec![5, 5, 5, 5, 3]);
    }

    #[test]
    fn test_plan_zero_min_still_progresses() {
        let data = vec![1u8; 16];
        let policy = FragmentPolicy::new((0, 1), (0, 1), (0, 1), (0, 0));
        let mut rng = test_rng();
        let frags = plan_first_packet(&data, &policy, &mut rng);
        assert_eq!(reassemble(&frags), data);
        assert!(frags.iter().all(|f| !f.bytes.is_empty()));
    }

    #[test]
    fn test_delay_draws_within_range() {
        let data = vec![2u8; 64];
        let policy = FragmentPolicy::new((4, 8), (1, 2), (4, 8), (3, 9));
        let mut rng = test_rng();
        let frags = plan_first_packet(&data, &policy, &mut rng);
        assert!(frags.iter().all(|f| (3..9).contains(&f.delay_ms)));
    }

    /// AsyncWrite sink that records each poll_write as a separate chunk.
    struct ChunkSink {
        chunks: Vec<Vec<u8>>,
    }

    impl AsyncWrite for ChunkSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.chunks.push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncRead for ChunkSink {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_stream_first_write_is_fragmented() {
        let hello = ClientHelloSpec::padded("example.com", 16).encode();
        let sink = ChunkSink { chunks: Vec::new() };
        let policy = FragmentPolicy::new((5, 5), (2, 2), (5, 5), (0, 0));
        let mut stream = FragmentStream::new(sink, policy);

        stream.write_all(&hello).await.unwrap();
        stream.write_all(b"untouched").await.unwrap();

        let sink = stream.into_inner();
        assert!(sink.chunks.len() > 2);
        assert_eq!(sink.chunks.last().unwrap(), &b"untouched".to_vec());

        let first_packet: Vec<u8> = sink.chunks[..sink.chunks.len() - 1]
            .iter()
            .flatten()
            .copied()
            .collect();
        assert_eq!(
            first_packet.to_ascii_lowercase(),
            hello.to_ascii_lowercase()
        );
    }

    #[tokio::test]
    async fn test_stream_paces_fragments() {
        let data = vec![3u8; 10];
        let sink = ChunkSink { chunks: Vec::new() };
        let policy = FragmentPolicy::new((5, 5), (1, 1), (5, 5), (10, 10));
        let mut stream = FragmentStream::new(sink, policy);

        let start = std::time::Instant::now();
        stream.write_all(&data).await.unwrap();
        // Two fragments with one pause between them
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
