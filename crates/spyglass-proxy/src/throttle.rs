//! Shared bandwidth limiting.
//!
//! One [`ThrottleGroup`] exists per proxy server when a throttle rate is
//! configured. Every proxied connection wraps its upstream stream in a
//! [`ThrottledStream`], so all connections together stay under the
//! configured aggregate rate. Token consumption is the only mutation and
//! happens under a mutex; attaching and detaching streams is just wrapper
//! construction and drop, safe under arbitrary connection churn.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

/// Largest grant handed to a single read or write.
const CHUNK: usize = 16 * 1024;

/// Outcome of asking the bucket for tokens.
enum Grant {
    /// Proceed with up to this many bytes.
    Ready(usize),
    /// No tokens; retry after this long.
    Backoff(Duration),
}

/// Token bucket state. Tokens are bytes; capacity is one second of the
/// configured rate, so short bursts up to the rate are allowed.
struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn grant(&mut self, want: usize) -> Grant {
        self.refill();
        let want = want.min(CHUNK).max(1);
        if self.tokens >= 1.0 {
            let take = (self.tokens as usize).min(want);
            self.tokens -= take as f64;
            Grant::Ready(take)
        } else {
            // Sleep until a whole chunk (or the full request, if smaller)
            // is available, so small rates do not wake per byte.
            let target = (want as f64).min(self.capacity);
            let needed = target - self.tokens;
            let secs = (needed / self.refill_rate).max(0.001);
            Grant::Backoff(Duration::from_secs_f64(secs))
        }
    }

    fn give_back(&mut self, unused: usize) {
        self.tokens = (self.tokens + unused as f64).min(self.capacity);
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("tokens", &self.tokens)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Process-shared token-bucket rate limiter.
#[derive(Debug)]
pub struct ThrottleGroup {
    rate: u64,
    bucket: Mutex<Bucket>,
}

impl ThrottleGroup {
    /// Creates a group limiting aggregate throughput to `rate_kbps` KB/s.
    ///
    /// The caller validates positivity; this constructor treats the rate
    /// as trusted.
    pub fn new(rate_kbps: u64) -> Self {
        let rate = rate_kbps * 1024;
        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate as f64,
                capacity: rate as f64,
                refill_rate: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// The configured rate in bytes per second.
    pub fn rate_bytes_per_sec(&self) -> u64 {
        self.rate
    }

    fn grant(&self, want: usize) -> Grant {
        self.bucket.lock().grant(want)
    }

    fn give_back(&self, unused: usize) {
        if unused > 0 {
            self.bucket.lock().give_back(unused);
        }
    }
}

/// Stream wrapper that charges every byte read or written against a
/// shared [`ThrottleGroup`].
#[derive(Debug)]
pub struct ThrottledStream<S> {
    inner: S,
    group: Arc<ThrottleGroup>,
    read_delay: Option<Pin<Box<Sleep>>>,
    write_delay: Option<Pin<Box<Sleep>>>,
}

impl<S> ThrottledStream<S> {
    /// Attaches `inner` to the group.
    pub fn new(inner: S, group: Arc<ThrottleGroup>) -> Self {
        Self {
            inner,
            group,
            read_delay: None,
            write_delay: None,
        }
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Detaches and returns the wrapped stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(delay) = this.read_delay.as_mut() {
                match delay.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => this.read_delay = None,
                }
            }
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            match this.group.grant(buf.remaining()) {
                Grant::Backoff(dur) => {
                    this.read_delay = Some(Box::pin(sleep(dur)));
                }
                Grant::Ready(allow) => {
                    let mut limited = buf.take(allow);
                    return match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
                        Poll::Ready(Ok(())) => {
                            let got = limited.filled().len();
                            this.group.give_back(allow - got);
                            // Bytes were initialized by the inner read.
                            unsafe { buf.assume_init(got) };
                            buf.advance(got);
                            Poll::Ready(Ok(()))
                        }
                        Poll::Ready(Err(e)) => {
                            this.group.give_back(allow);
                            Poll::Ready(Err(e))
                        }
                        Poll::Pending => {
                            this.group.give_back(allow);
                            Poll::Pending
                        }
                    };
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if let Some(delay) = this.write_delay.as_mut() {
                match delay.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => this.write_delay = None,
                }
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            match this.group.grant(buf.len()) {
                Grant::Backoff(dur) => {
                    this.write_delay = Some(Box::pin(sleep(dur)));
                }
                Grant::Ready(allow) => {
                    return match Pin::new(&mut this.inner).poll_write(cx, &buf[..allow]) {
                        Poll::Ready(Ok(written)) => {
                            this.group.give_back(allow - written);
                            Poll::Ready(Ok(written))
                        }
                        Poll::Ready(Err(e)) => {
                            this.group.give_back(allow);
                            Poll::Ready(Err(e))
                        }
                        Poll::Pending => {
                            this.group.give_back(allow);
                            Poll::Pending
                        }
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
