// src/session.rs
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::backend::GymBackend;
use crate::config::{Config, ReaderConfig};
use crate::device::{self, CommandSink, ReaderFrame, ReaderStream};
use crate::error::{LookupError, SessionError};
use crate::policy;
use crate::types::{DeviceCommand, Identification, ScanMode, SessionState};

/// Everything a session reports to its consumer.
#[derive(Debug)]
pub enum SessionEvent {
    Identified(Identification),
    /// The scan could not be classified: malformed card number or failed lookup.
    LookupFailed { raw: String, error: LookupError },
    ConnectionLost { reason: String },
}

/// Receiving end of a session's event stream. One consumer per session.
pub struct SessionEvents {
    rx: UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    pub(crate) fn channel() -> (UnboundedSender<SessionEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// `None` once the session is gone and every event has been read.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

/// What `on_scan_event` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDisposition {
    LookupStarted,
    /// A lookup is already running; the frame is a repeat pulse and is dropped.
    DroppedInFlight,
    Ignored,
}

/// State shared by the session handle, its reader task and its lookup task.
pub(crate) struct SessionCore {
    mode: ScanMode,
    backend: Arc<dyn GymBackend>,
    state: Mutex<SessionState>,
    events: UnboundedSender<SessionEvent>,
    device: tokio::sync::Mutex<Option<Box<dyn CommandSink>>>,
}

impl SessionCore {
    pub(crate) fn new(
        mode: ScanMode,
        backend: Arc<dyn GymBackend>,
        device: Box<dyn CommandSink>,
        events: UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mode,
            backend,
            state: Mutex::new(SessionState::Connecting),
            events,
            device: tokio::sync::Mutex::new(Some(device)),
        })
    }

    fn state_guard(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state_guard()
    }

    /// Sends START and begins listening.
    pub(crate) async fn start(&self) -> Result<(), SessionError> {
        let mut device = self.device.lock().await;
        if let Some(sink) = device.as_mut() {
            sink.send_command(DeviceCommand::Start)
                .await
                .map_err(SessionError::Start)?;
        }
        drop(device);

        let mut state = self.state_guard();
        if *state == SessionState::Connecting {
            *state = SessionState::Listening;
        }
        Ok(())
    }

    pub(crate) fn on_scan_event(self: &Arc<Self>, raw: &str) -> ScanDisposition {
        let mut state = self.state_guard();
        match *state {
            SessionState::LookupInFlight => {
                debug!("Lookup in flight, dropping scan {:?}", raw);
                return ScanDisposition::DroppedInFlight;
            }
            SessionState::Connecting | SessionState::Closed => return ScanDisposition::Ignored,
            SessionState::Listening => {}
        }

        let raw = raw.trim();
        if raw.is_empty() {
            return ScanDisposition::Ignored;
        }

        *state = SessionState::LookupInFlight;
        drop(state);

        let core = Arc::clone(self);
        let raw = raw.to_string();
        tokio::spawn(async move {
            let event = match policy::identify(core.backend.as_ref(), &raw).await {
                Ok(identification) => SessionEvent::Identified(identification),
                Err(error) => {
                    warn!("Lookup for scan {:?} failed: {}", raw, error);
                    SessionEvent::LookupFailed { raw, error }
                }
            };
            core.complete_lookup(event).await;
        });

        ScanDisposition::LookupStarted
    }

    async fn complete_lookup(&self, event: SessionEvent) {
        let finished = {
            let mut state = self.state_guard();
            if *state != SessionState::LookupInFlight {
                debug!("Session closed during lookup, discarding {:?}", event);
                return;
            }
            match self.mode {
                ScanMode::Multiple => {
                    *state = SessionState::Listening;
                    false
                }
                ScanMode::Single => {
                    *state = SessionState::Closed;
                    true
                }
            }
        };

        let _ = self.events.send(event);

        if finished {
            self.stop_device().await;
        }
    }

    pub(crate) async fn connection_lost(&self, reason: String) {
        {
            let mut state = self.state_guard();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }

        warn!("Card reader connection lost: {}", reason);
        // Nothing left to send STOP to
        self.device.lock().await.take();
        let _ = self.events.send(SessionEvent::ConnectionLost { reason });
    }

    /// Marks the session closed. Returns false if it already was.
    fn mark_closed(&self) -> bool {
        let mut state = self.state_guard();
        if *state == SessionState::Closed {
            false
        } else {
            *state = SessionState::Closed;
            true
        }
    }

    pub(crate) async fn close(&self) {
        if self.mark_closed() {
            info!("Closing card scan session");
        }
        self.stop_device().await;
    }

    // Taking the sink out guarantees STOP goes out at most once
    async fn stop_device(&self) {
        let Some(mut sink) = self.device.lock().await.take() else {
            return;
        };
        if let Err(err) = sink.send_command(DeviceCommand::Stop).await {
            debug!("Could not send STOP: {}", err);
        }
        if let Err(err) = sink.close().await {
            debug!("Could not close reader connection: {}", err);
        }
    }
}

/// A live connection to one card reader.
///
/// Dropping the session releases the reader the same way `close` does.
pub struct CardScanSession {
    core: Arc<SessionCore>,
    reader: JoinHandle<()>,
}

impl CardScanSession {
    pub async fn open(
        config: &ReaderConfig,
        mode: ScanMode,
        backend: Arc<dyn GymBackend>,
    ) -> Result<(Self, SessionEvents), SessionError> {
        let (sink, stream) = device::connect(config).await?;
        let (tx, events) = SessionEvents::channel();

        let core = SessionCore::new(mode, backend, Box::new(sink), tx);
        core.start().await?;
        info!("Card scan session listening ({:?} mode)", mode);

        let reader = tokio::spawn(read_frames(Arc::clone(&core), stream));
        Ok((Self { core, reader }, events))
    }

    /// Like `open`, reading the reader URL from `config`.
    pub async fn open_configured(
        config: &Config,
        mode: ScanMode,
        backend: Arc<dyn GymBackend>,
    ) -> Result<(Self, SessionEvents), SessionError> {
        let reader = config.reader()?;
        Self::open(reader, mode, backend).await
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn mode(&self) -> ScanMode {
        self.core.mode
    }

    /// Sends STOP and closes the reader connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.core.close().await;
        self.reader.abort();
    }
}

impl Drop for CardScanSession {
    fn drop(&mut self) {
        self.reader.abort();
        if !self.core.mark_closed() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let core = Arc::clone(&self.core);
            handle.spawn(async move { core.stop_device().await });
        }
    }
}

async fn read_frames(core: Arc<SessionCore>, mut stream: ReaderStream) {
    loop {
        match device::next_frame(&mut stream).await {
            ReaderFrame::Scan(raw) => {
                core.on_scan_event(&raw);
            }
            ReaderFrame::Lost(reason) => {
                core.connection_lost(reason).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charge::{ChargeEndpoint, OneTimeEntryPayload};
    use crate::error::{ApiError, ApiResult, DeviceError};
    use crate::types::{IdentificationOutcome, LookupResponse};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Backend whose lookups block until the test releases them.
    struct GatedBackend {
        lookups: AtomicUsize,
        started: Notify,
        release: Notify,
        response: LookupResponse,
    }

    impl GatedBackend {
        fn new(status: &str, user_id: Option<i64>) -> Arc<Self> {
            Arc::new(Self {
                lookups: AtomicUsize::new(0),
                started: Notify::new(),
                release: Notify::new(),
                response: LookupResponse {
                    status: status.to_string(),
                    user_id,
                },
            })
        }
    }

    #[async_trait]
    impl GymBackend for GatedBackend {
        async fn lookup_card(&self, _card_number: u64) -> ApiResult<LookupResponse> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(self.response.clone())
        }

        async fn create_one_time_entries(
            &self,
            _endpoint: ChargeEndpoint,
            _count: u32,
            _payload: &OneTimeEntryPayload,
        ) -> ApiResult<Value> {
            Err(ApiError::InvalidResponse("not used".into()))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        commands: Arc<Mutex<Vec<DeviceCommand>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        async fn send_command(&mut self, command: DeviceCommand) -> Result<(), DeviceError> {
            self.commands.lock().unwrap().push(command);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), DeviceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn listening_core(
        mode: ScanMode,
        backend: Arc<GatedBackend>,
    ) -> (Arc<SessionCore>, SessionEvents, RecordingSink) {
        let sink = RecordingSink::default();
        let (tx, events) = SessionEvents::channel();
        let core = SessionCore::new(mode, backend, Box::new(sink.clone()), tx);
        core.start().await.unwrap();
        (core, events, sink)
    }

    async fn next_event(events: &mut SessionEvents) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.next())
            .await
            .expect("event in time")
            .expect("event stream open")
    }

    #[tokio::test]
    async fn only_first_of_rapid_scans_starts_a_lookup() {
        let backend = GatedBackend::new("ASSIGNED", Some(17));
        let (core, mut events, _sink) = listening_core(ScanMode::Multiple, backend.clone()).await;

        assert_eq!(core.on_scan_event("123"), ScanDisposition::LookupStarted);
        backend.started.notified().await;

        for _ in 0..5 {
            assert_eq!(core.on_scan_event("123"), ScanDisposition::DroppedInFlight);
        }
        assert_eq!(core.on_scan_event("456"), ScanDisposition::DroppedInFlight);
        assert_eq!(core.state(), SessionState::LookupInFlight);

        backend.release.notify_one();
        match next_event(&mut events).await {
            SessionEvent::Identified(identification) => {
                assert_eq!(identification.uid.as_str(), "123");
                assert_eq!(identification.outcome, IdentificationOutcome::Assigned(17));
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(backend.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(core.state(), SessionState::Listening);
        assert!(events.try_next().is_none());
    }

    #[tokio::test]
    async fn blank_frames_are_ignored() {
        let backend = GatedBackend::new("ASSIGNED", Some(1));
        let (core, _events, _sink) = listening_core(ScanMode::Multiple, backend.clone()).await;

        assert_eq!(core.on_scan_event("   \r\n"), ScanDisposition::Ignored);
        assert_eq!(core.state(), SessionState::Listening);
        assert_eq!(backend.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_scan_surfaces_as_lookup_failure() {
        let backend = GatedBackend::new("ASSIGNED", Some(1));
        let (core, mut events, _sink) = listening_core(ScanMode::Multiple, backend.clone()).await;

        assert_eq!(core.on_scan_event(" 04A1B2C3 "), ScanDisposition::LookupStarted);
        match next_event(&mut events).await {
            SessionEvent::LookupFailed { raw, error } => {
                assert_eq!(raw, "04A1B2C3");
                assert!(matches!(error, LookupError::MalformedCard(_)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(backend.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(core.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn completion_after_close_is_a_no_op() {
        let backend = GatedBackend::new("ASSIGNED", Some(3));
        let (core, mut events, sink) = listening_core(ScanMode::Multiple, backend.clone()).await;

        core.on_scan_event("3");
        backend.started.notified().await;
        core.close().await;

        backend.release.notify_one();
        // Give the lookup task a chance to finish
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(events.try_next().is_none());
        assert_eq!(core.state(), SessionState::Closed);
        assert_eq!(
            *sink.commands.lock().unwrap(),
            vec![DeviceCommand::Start, DeviceCommand::Stop]
        );
    }

    #[tokio::test]
    async fn close_twice_sends_one_stop() {
        let backend = GatedBackend::new("ASSIGNED", Some(3));
        let (core, _events, sink) = listening_core(ScanMode::Multiple, backend).await;

        core.close().await;
        core.close().await;

        assert_eq!(
            *sink.commands.lock().unwrap(),
            vec![DeviceCommand::Start, DeviceCommand::Stop]
        );
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_mode_stops_after_first_outcome() {
        let backend = GatedBackend::new("NOT_REGISTERED", None);
        let (core, mut events, sink) = listening_core(ScanMode::Single, backend.clone()).await;

        core.on_scan_event("00123456");
        backend.started.notified().await;
        backend.release.notify_one();

        match next_event(&mut events).await {
            SessionEvent::Identified(identification) => {
                assert_eq!(identification.outcome, IdentificationOutcome::NotRegistered);
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(core.state(), SessionState::Closed);
        assert_eq!(core.on_scan_event("00123456"), ScanDisposition::Ignored);

        // STOP is sent by the lookup task right after the event
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *sink.commands.lock().unwrap(),
            vec![DeviceCommand::Start, DeviceCommand::Stop]
        );

        core.close().await;
        assert_eq!(sink.commands.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn connection_loss_is_reported_once() {
        let backend = GatedBackend::new("ASSIGNED", Some(3));
        let (core, mut events, sink) = listening_core(ScanMode::Multiple, backend).await;

        core.connection_lost("reset".into()).await;
        core.connection_lost("again".into()).await;

        match next_event(&mut events).await {
            SessionEvent::ConnectionLost { reason } => assert_eq!(reason, "reset"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_next().is_none());

        // No STOP towards a reader that is already gone
        core.close().await;
        assert_eq!(*sink.commands.lock().unwrap(), vec![DeviceCommand::Start]);
    }
}
