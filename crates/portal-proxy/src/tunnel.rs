//! Bidirectional byte splicing for CONNECT tunnels.
//!
//! Each direction is an independent `tokio::io::copy`, so a slow reader on
//! one side throttles the writer feeding it. When one direction reaches
//! end of stream the other side's write half is shut down; the tunnel ends
//! once both directions are done.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    /// True if the tunnel was closed by the idle timeout.
    pub timed_out: bool,
}

struct Activity {
    start: Instant,
    last_millis: AtomicU64,
    client_to_upstream: AtomicU64,
    upstream_to_client: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_millis: AtomicU64::new(0),
            client_to_upstream: AtomicU64::new(0),
            upstream_to_client: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_millis.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }

    /// Resolves once nothing moved for `limit`.
    async fn idle(&self, limit: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }

    fn stats(&self, timed_out: bool) -> TunnelStats {
        TunnelStats {
            client_to_upstream: self.client_to_upstream.load(Ordering::Relaxed),
            upstream_to_client: self.upstream_to_client.load(Ordering::Relaxed),
            timed_out,
        }
    }
}

/// Splices `client` and `upstream` until both directions finish, or until
/// no byte moved for `idle_timeout`.
pub async fn splice<A, B>(client: A, upstream: B, idle_timeout: Option<Duration>) -> TunnelStats
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let activity = Activity::new();

    let both = async {
        tokio::join!(
            pump(client_read, upstream_write, &activity, &activity.client_to_upstream),
            pump(upstream_read, client_write, &activity, &activity.upstream_to_client),
        )
    };

    let timed_out = match idle_timeout {
        None => {
            both.await;
            false
        }
        Some(limit) => {
            tokio::select! {
                _ = both => false,
                _ = activity.idle(limit) => true,
            }
        }
    };

    activity.stats(timed_out)
}

/// Counts bytes read and marks the tunnel active.
struct Tracked<'a, R> {
    inner: R,
    activity: &'a Activity,
    counter: &'a AtomicU64,
}

impl<R: AsyncRead + Unpin> AsyncRead for Tracked<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        let n = buf.filled().len() - before;
        if n > 0 {
            this.counter.fetch_add(n as u64, Ordering::Relaxed);
            this.activity.touch();
        }
        poll
    }
}

async fn pump<R, W>(reader: R, mut writer: W, activity: &Activity, counter: &AtomicU64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = Tracked {
        inner: reader,
        activity,
        counter,
    };
    if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
        tracing::debug!("Tunnel direction ended with error: {}", e);
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Failed to shut down tunnel write half: {}", e);
    }
}

/// Waits for the client connection upgrade, then splices it with
/// `upstream` on a background task.
///
/// `upstream` is dropped (closing it) when the tunnel ends or the upgrade
/// fails.
pub fn spawn_tunnel<S>(on_upgrade: OnUpgrade, upstream: S, idle_timeout: Option<Duration>, label: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let stats = splice(TokioIo::new(upgraded), upstream, idle_timeout).await;
                tracing::debug!(
                    "Tunnel to {} closed: {} bytes up, {} bytes down{}",
                    label,
                    stats.client_to_upstream,
                    stats.upstream_to_client,
                    if stats.timed_out { " (idle timeout)" } else { "" }
                );
            }
            Err(e) => tracing::error!("Failed to upgrade client connection for {}: {}", label, e),
        }
    });
}
