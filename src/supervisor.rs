use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::types::RetryConfig;

/// Something the supervisor can run over and over
///
/// [`DirconDevice`](crate::DirconDevice) implements this over a streaming
/// [`DirconSession`](crate::DirconSession).
#[async_trait]
pub trait SessionRunner: Send + Sync + 'static {
    /// Run one session to completion
    ///
    /// The run must end once `enabled` turns `false`, including when it
    /// already is. Returns `true` if the session got configured.
    async fn run_once(&self, enabled: watch::Receiver<bool>) -> bool;

    /// Ask a running session to end
    async fn close(&self);
}

#[derive(Debug, Default)]
struct LoopSlot {
    running: bool,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    runner: Arc<dyn SessionRunner>,
    retry: RetryConfig,
    enabled: watch::Sender<bool>,
    slot: Mutex<LoopSlot>,
}

/// Bounded reconnect loop around a [`SessionRunner`]
///
/// While enabled, the supervisor runs the session, waits
/// `retry_interval_ms` and runs it again. After `max_consecutive_failures`
/// failed runs it disables itself; callers observe that through
/// [`enabled_watch`](Supervisor::enabled_watch).
///
/// At most one loop exists at a time: enabling an already running
/// supervisor only keeps it enabled.
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("retry", &self.inner.retry)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a disabled supervisor
    #[must_use]
    pub fn new(runner: Arc<dyn SessionRunner>, retry: RetryConfig) -> Self {
        let (enabled, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                runner,
                retry,
                enabled,
                slot: Mutex::new(LoopSlot::default()),
            }),
        }
    }

    /// Retry policy
    #[must_use]
    pub fn retry_config(&self) -> &RetryConfig {
        &self.inner.retry
    }

    /// Whether the loop is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        *self.inner.enabled.borrow()
    }

    /// Watch the enabled flag, including automatic disabling after too many
    /// failures
    #[must_use]
    pub fn enabled_watch(&self) -> watch::Receiver<bool> {
        self.inner.enabled.subscribe()
    }

    /// Enable the loop, spawning it unless one is already running
    ///
    /// Returns as soon as the loop task is spawned. The loop keeps running
    /// sessions until [`disable`](Supervisor::disable) is called or
    /// `max_consecutive_failures` runs in a row fail. Enabling while a loop
    /// is still winding down after `disable` keeps that loop alive instead of
    /// starting a second one.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use async_trait::async_trait;
    /// use dircon::{RetryConfig, SessionRunner, Supervisor};
    /// use std::sync::Arc;
    /// use tokio::sync::watch;
    ///
    /// struct Noop;
    ///
    /// #[async_trait]
    /// impl SessionRunner for Noop {
    ///     async fn run_once(&self, _enabled: watch::Receiver<bool>) -> bool {
    ///         false
    ///     }
    ///
    ///     async fn close(&self) {}
    /// }
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let supervisor = Supervisor::new(Arc::new(Noop), RetryConfig::default());
    ///     supervisor.enable().await;
    ///
    ///     let mut enabled = supervisor.enabled_watch();
    ///     let _ = enabled.wait_for(|enabled| !*enabled).await;
    ///     println!("gave up after {} failures", supervisor.retry_config().max_consecutive_failures);
    /// }
    /// ```
    pub async fn enable(&self) {
        self.inner.enabled.send_replace(true);

        let mut slot = self.inner.slot.lock().await;
        if slot.running {
            debug!("Reconnect loop already running");
            return;
        }

        info!("Starting reconnect loop");
        slot.running = true;
        let inner = Arc::clone(&self.inner);
        slot.handle = Some(tokio::spawn(async move { inner.run_loop().await }));
    }

    /// Disable the loop and close the current session
    ///
    /// Clears the enabled flag, which interrupts a pending retry delay and
    /// ends a run that has not connected yet, then asks the runner to close
    /// its session and waits for that. The loop task exits once the current
    /// run returns; use [`join`](Supervisor::join) to wait for it.
    pub async fn disable(&self) {
        info!("Stopping reconnect loop");
        self.inner.enabled.send_replace(false);
        self.inner.runner.close().await;
    }

    /// Wait for the loop task to exit
    pub async fn join(&self) {
        let handle = self.inner.slot.lock().await.handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Reconnect loop ended abnormally: {}", e);
            }
        }
    }
}

impl Inner {
    async fn run_loop(self: Arc<Self>) {
        let mut failures: u32 = 0;
        let mut enabled = self.enabled.subscribe();

        loop {
            {
                let mut slot = self.slot.lock().await;
                if !*self.enabled.borrow() {
                    slot.running = false;
                    info!("Reconnect loop stopped");
                    return;
                }
            }

            let configured = self.runner.run_once(self.enabled.subscribe()).await;
            if configured && self.retry.reset_on_success {
                failures = 0;
            } else {
                failures = failures.saturating_add(1);
            }
            debug!(
                "Session run finished, configured: {}, failures: {}/{}",
                configured, failures, self.retry.max_consecutive_failures
            );

            if failures >= self.retry.max_consecutive_failures {
                warn!(
                    "Giving up after {} failed session runs, disabling",
                    failures
                );
                self.enabled.send_replace(false);
                continue;
            }

            let interval = Duration::from_millis(self.retry.retry_interval_ms);
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = disabled(&mut enabled) => debug!("Retry delay interrupted"),
            }
        }
    }
}

/// Resolve once `enabled` is `false`
pub async fn disabled(enabled: &mut watch::Receiver<bool>) {
    let _ = enabled.wait_for(|enabled| !*enabled).await;
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.inner.enabled.send_replace(false);
        if let Ok(mut slot) = self.inner.slot.try_lock() {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
        }
    }
}
