//! Staggered parallel connection racing (happy-eyeballs style).
//!
//! One attempt per candidate, launched in ranked order. Attempt *i* is
//! released `i × stagger` after the race starts, or immediately when the
//! previous attempt fails, so no candidate waits out the full stagger
//! behind a predecessor that has already lost and a likely-good first
//! candidate doesn't trigger a simultaneous burst of sockets. First
//! success cancels every other in-flight attempt.

use crate::{policy, resolve, Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for the connection racer.
#[derive(Debug, Clone)]
pub struct RacerConfig {
    /// Delay between consecutive attempt starts.
    pub stagger: Duration,
    /// Overall deadline for the whole race.
    pub deadline: Duration,
    /// Permit loopback/link-local/private targets (disables SSRF filtering).
    pub allow_local: bool,
}

impl Default for RacerConfig {
    fn default() -> Self {
        Self {
            stagger: Duration::from_millis(75),
            deadline: Duration::from_secs(10),
            allow_local: false,
        }
    }
}

impl RacerConfig {
    pub fn stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn allow_local(mut self, allow_local: bool) -> Self {
        self.allow_local = allow_local;
        self
    }
}

/// Races ranked, policy-filtered candidate addresses to a byte stream.
#[derive(Debug, Clone, Default)]
pub struct Racer {
    config: RacerConfig,
}

impl Racer {
    pub fn new(config: RacerConfig) -> Self {
        Self { config }
    }

    /// Resolve `host`, filter candidates under the security policy, and
    /// race the survivors. Policy rejections are logged skips; the race
    /// proceeds with whatever remains.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        let ranked = resolve::resolve_ranked(host, port).await?;

        let mut targets = Vec::with_capacity(ranked.len());
        for addr in ranked {
            if policy::is_connectable(addr, self.config.allow_local) {
                targets.push(SocketAddr::new(addr, port));
            } else {
                warn!(
                    address = %addr,
                    class = ?policy::Locality::classify(addr),
                    "refusing candidate address under security policy"
                );
            }
        }

        if targets.is_empty() {
            return Err(Error::NoRoute(host.to_string()));
        }

        self.race(host, targets, cancel).await
    }

    /// Race explicit targets. `label` only names the race in errors/logs.
    pub async fn race(
        &self,
        label: &str,
        targets: Vec<SocketAddr>,
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        if targets.is_empty() {
            return Err(Error::NoRoute(label.to_string()));
        }

        match timeout(self.config.deadline, self.race_inner(label, targets, cancel)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(label.to_string())),
        }
    }

    async fn race_inner(
        &self,
        label: &str,
        targets: Vec<SocketAddr>,
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        // Every sub-attempt shares one cancellation scope: the winner (or
        // the caller) cancels it and the losers close their sockets
        // silently.
        let scope = cancel.child_token();
        let start = Instant::now();

        let mut attempts = JoinSet::new();
        let mut release: Option<oneshot::Receiver<()>> = None;
        for (i, addr) in targets.into_iter().enumerate() {
            let (fail_tx, fail_rx) = oneshot::channel();
            let scheduled = start + self.config.stagger * i as u32;
            attempts.spawn(attempt(addr, scheduled, release.take(), fail_tx, scope.clone()));
            release = Some(fail_rx);
        }
        drop(release);

        let mut last_err = None;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(stream)) => {
                    scope.cancel();
                    attempts.abort_all();
                    debug!(
                        host = label,
                        address = %stream.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "connection race won"
                    );
                    return Ok(stream);
                }
                Ok(Err(AttemptError::Io { addr, source })) => {
                    debug!(address = %addr, error = %source, "connection attempt failed");
                    last_err = Some(source);
                }
                Ok(Err(AttemptError::Cancelled)) => {}
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => warn!(error = %join_err, "connection attempt panicked"),
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match last_err {
            Some(e) => Err(Error::Connect(e)),
            None => Err(Error::NoRoute(label.to_string())),
        }
    }
}

enum AttemptError {
    Cancelled,
    Io {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

async fn attempt(
    addr: SocketAddr,
    scheduled: Instant,
    release: Option<oneshot::Receiver<()>>,
    release_next: oneshot::Sender<()>,
    scope: CancellationToken,
) -> std::result::Result<TcpStream, AttemptError> {
    // Hold until the scheduled start, unless the predecessor settles first.
    match release {
        Some(rx) => {
            tokio::select! {
                _ = sleep_until(scheduled) => {}
                _ = rx => {}
            }
        }
        None => sleep_until(scheduled).await,
    }

    if scope.is_cancelled() {
        return Err(AttemptError::Cancelled);
    }

    tokio::select! {
        _ = scope.cancelled() => Err(AttemptError::Cancelled),
        res = TcpStream::connect(addr) => match res {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Err(source) => {
                let _ = release_next.send(());
                Err(AttemptError::Io { addr, source })
            }
        }
    }
}
