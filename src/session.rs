use bytes::Bytes;
use futures::StreamExt;
use std::{future::Future, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::{watch, Mutex},
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{DirconError, Result},
    listeners::{ListenerHandle, Listeners},
    machine::{Action, RunEnd, SessionMachine},
    protocol::Packet,
    transport,
    types::{RunTargets, SessionConfig, SessionStatus},
};

pub use crate::machine::CharacteristicEvent;

/// One DIRCON connection to a device
///
/// A session owns the TCP connection for the duration of a [`run`], performs
/// service and characteristic discovery, sends the resulting read and notify
/// commands and dispatches every characteristic value to the registered
/// listeners. Errors never escape a run: they are logged, the status drops
/// back to [`SessionStatus::Disconnected`] and `run` reports whether the
/// session got configured.
///
/// A session is reusable: the supervisor calls [`run`] again after a failure.
/// Runs of one session must not overlap.
///
/// # Examples
///
/// ```no_run
/// use dircon::{DirconSession, RunTargets, SessionConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let session = DirconSession::new(SessionConfig::new("192.168.1.40", 36866));
///     session.subscribe_characteristic(|event| {
///         println!("0x{:04X}: {:02X?}", event.uuid, event.payload);
///     });
///
///     let configured = session.run(&RunTargets::capability_probe()).await;
///     println!("configured: {configured}");
/// }
/// ```
///
/// [`run`]: DirconSession::run
pub struct DirconSession {
    config: SessionConfig,
    machine: Mutex<SessionMachine>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    status_tx: watch::Sender<SessionStatus>,
    shutdown: watch::Sender<bool>,
    characteristic_listeners: Listeners<CharacteristicEvent>,
    status_listeners: Listeners<SessionStatus>,
}

impl std::fmt::Debug for DirconSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirconSession")
            .field("address", &self.config.address())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl DirconSession {
    /// Create a disconnected session
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            machine: Mutex::new(SessionMachine::new()),
            writer: Mutex::new(None),
            status_tx,
            shutdown,
            characteristic_listeners: Listeners::new(),
            status_listeners: Listeners::new(),
        }
    }

    /// Connection settings
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Watch status transitions
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Register a characteristic value callback
    ///
    /// Callbacks run on the session task, in registration order, before the
    /// next command is sent. They must not block.
    pub fn subscribe_characteristic<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&CharacteristicEvent) + Send + Sync + 'static,
    {
        self.characteristic_listeners.subscribe(callback)
    }

    /// Remove a characteristic value callback
    pub fn unsubscribe_characteristic(&self, handle: ListenerHandle) -> bool {
        self.characteristic_listeners.unsubscribe(handle)
    }

    /// Register a status transition callback
    pub fn subscribe_status<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&SessionStatus) + Send + Sync + 'static,
    {
        self.status_listeners.subscribe(callback)
    }

    /// Remove a status transition callback
    pub fn unsubscribe_status(&self, handle: ListenerHandle) -> bool {
        self.status_listeners.unsubscribe(handle)
    }

    /// Connect, discover and process traffic until the run ends
    ///
    /// The run discovers services, then the characteristics of each service,
    /// and queues a read for every readable characteristic in
    /// `targets.read` and a notification subscription for every notifiable
    /// one in `targets.notify`. Commands go out one at a time, each after the
    /// previous response.
    ///
    /// # Arguments
    ///
    /// * `targets` - Characteristics to read and subscribe, and whether to
    ///   keep listening once every command has been answered
    ///
    /// # Termination
    ///
    /// With `targets.listen` set the run keeps reading notifications until the
    /// connection fails, the device reports an error or [`close`] is called.
    /// Otherwise it ends once every command has been answered. Reads time out
    /// after `response_timeout_ms` while a response is outstanding and after
    /// `idle_timeout_ms`, if set, while streaming.
    ///
    /// Returns `true` if discovery produced at least one command, even when
    /// the connection failed afterwards.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dircon::{DirconSession, RunTargets, SessionConfig};
    /// use std::sync::Arc;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let session = Arc::new(DirconSession::new(SessionConfig::new("192.168.1.40", 36866)));
    ///
    ///     let runner = Arc::clone(&session);
    ///     let run = tokio::spawn(async move { runner.run(&RunTargets::streaming()).await });
    ///
    ///     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    ///     session.close().await;
    ///     println!("configured: {:?}", run.await);
    /// }
    /// ```
    ///
    /// [`close`]: DirconSession::close
    pub async fn run(&self, targets: &RunTargets) -> bool {
        self.run_until(targets, std::future::pending()).await
    }

    /// [`run`](DirconSession::run) that also ends as soon as `stop` completes
    ///
    /// `stop` is polled alongside connecting and every read, so it can end the
    /// run at any point, including while the TCP connection is still being
    /// established. A `stop` future that is already complete ends the run
    /// before it connects.
    ///
    /// # Arguments
    ///
    /// * `targets` - Same as for [`run`](DirconSession::run)
    /// * `stop` - Future whose completion ends the run
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dircon::{DirconSession, RunTargets, SessionConfig};
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let session = DirconSession::new(SessionConfig::new("192.168.1.40", 36866));
    ///     let stop = tokio::time::sleep(Duration::from_secs(30));
    ///
    ///     let configured = session.run_until(&RunTargets::streaming(), stop).await;
    ///     println!("configured: {configured}");
    /// }
    /// ```
    pub async fn run_until<F>(&self, targets: &RunTargets, stop: F) -> bool
    where
        F: Future<Output = ()>,
    {
        self.shutdown.send_replace(false);

        match self.run_inner(targets, stop).await {
            Ok(()) => info!("Session with {} completed", self.config.address()),
            Err(DirconError::Disconnected) => info!("Session with {} closed", self.config.address()),
            Err(e) if e.is_connection_error() => {
                warn!("Connection to {} failed: {}", self.config.address(), e);
            }
            Err(e) => error!("Session with {} failed: {}", self.config.address(), e),
        }

        self.teardown().await;
        self.machine.lock().await.is_configured()
    }

    async fn run_inner<F>(&self, targets: &RunTargets, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let actions = self.machine.lock().await.start(targets.clone());
        self.perform(actions).await?;

        let mut shutdown = self.shutdown.subscribe();
        let cancelled = async move {
            tokio::select! {
                () = stop => {}
                () = closing(&mut shutdown) => {}
            }
        };
        tokio::pin!(cancelled);

        let stream = tokio::select! {
            biased;
            () = &mut cancelled => return Err(DirconError::Disconnected),
            stream = transport::connect(&self.config) => stream?,
        };

        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        let packets = transport::packet_stream(reader);
        tokio::pin!(packets);

        let mut actions = self.machine.lock().await.connection_opened();
        loop {
            if let Some(end) = self.perform(actions).await? {
                return end.into_result();
            }

            let wait = self.read_timeout().await;
            let next = tokio::select! {
                () = &mut cancelled => return Err(DirconError::Disconnected),
                next = async {
                    match wait {
                        Some(wait) => timeout(wait, packets.next()).await.map_err(|_| {
                            DirconError::Timeout {
                                timeout_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                            }
                        }),
                        None => Ok(packets.next().await),
                    }
                } => next?,
            };

            let packet = match next {
                Some(packet) => packet?,
                None => return Err(DirconError::Disconnected),
            };
            actions = self.machine.lock().await.packet_received(packet);
        }
    }

    async fn read_timeout(&self) -> Option<Duration> {
        if self.machine.lock().await.is_streaming() {
            self.config.idle_timeout_ms.map(Duration::from_millis)
        } else {
            Some(Duration::from_millis(self.config.response_timeout_ms))
        }
    }

    /// Carry out machine actions, stopping at [`Action::Finish`]
    async fn perform(&self, actions: Vec<Action>) -> Result<Option<RunEnd>> {
        for action in actions {
            match action {
                Action::SetStatus(status) => self.publish_status(status),
                Action::Send(packet) => self.send(&packet).await?,
                Action::Dispatch(event) => self.characteristic_listeners.emit(&event),
                Action::Finish(end) => return Ok(Some(end)),
            }
        }
        Ok(None)
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(DirconError::NotConnected)?;
        transport::write_packet(writer, packet).await
    }

    async fn teardown(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Error while closing connection: {}", e);
            }
        }

        let actions = self.machine.lock().await.connection_closed();
        for action in actions {
            if let Action::SetStatus(status) = action {
                self.publish_status(status);
            }
        }
    }

    fn publish_status(&self, status: SessionStatus) {
        info!("Session {} status: {}", self.config.address(), status);
        self.status_listeners.emit(&status);
        self.status_tx.send_replace(status);
    }

    /// Write a characteristic value
    ///
    /// Returns `false` without touching the connection unless the session is
    /// [`SessionStatus::Connected`], or if the write fails.
    pub async fn write(&self, uuid: u32, payload: Bytes) -> bool {
        let Some(packet) = self.machine.lock().await.write_requested(uuid, payload) else {
            warn!("Cannot write 0x{:04X}: session is not connected", uuid);
            return false;
        };

        match self.send(&packet).await {
            Ok(()) => {
                debug!("Wrote characteristic 0x{:04X}", uuid);
                true
            }
            Err(e) => {
                warn!("Failed to write characteristic 0x{:04X}: {}", uuid, e);
                false
            }
        }
    }

    /// End the current run and wait until the session is disconnected
    ///
    /// Does nothing if the session is already disconnected.
    pub async fn close(&self) {
        if self.status() == SessionStatus::Disconnected {
            return;
        }

        info!("Closing session with {}", self.config.address());
        let mut status = self.status_tx.subscribe();
        self.shutdown.send_replace(true);
        if status
            .wait_for(|status| *status == SessionStatus::Disconnected)
            .await
            .is_err()
        {
            warn!("Session dropped while closing");
        }
    }
}

async fn closing(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closing| *closing).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    async fn unused_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_new_session_is_disconnected() {
        let session = DirconSession::new(SessionConfig::new("127.0.0.1", 36866));
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(session.config().port, 36866);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let session = DirconSession::new(SessionConfig::new("127.0.0.1", 36866));
        assert!(!session.write(0x2AD9, Bytes::from_static(&[0x02, 0xCE, 0x04])).await);
    }

    #[tokio::test]
    async fn test_close_when_disconnected_returns() {
        let session = DirconSession::new(SessionConfig::new("127.0.0.1", 36866));
        session.close().await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let port = unused_port().await;
        let session = DirconSession::new(SessionConfig::new("127.0.0.1", port));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        session.subscribe_status(move |status| recorder.lock().unwrap().push(*status));

        let configured = session.run(&RunTargets::streaming()).await;

        assert!(!configured);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SessionStatus::Connecting, SessionStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_status() {
        let session = DirconSession::new(SessionConfig::new("127.0.0.1", unused_port().await));
        let seen = Arc::new(StdMutex::new(0));
        let counter = Arc::clone(&seen);
        let handle = session.subscribe_status(move |_| *counter.lock().unwrap() += 1);
        assert!(session.unsubscribe_status(handle));

        session.run(&RunTargets::streaming()).await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
