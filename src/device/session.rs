use std::sync::{Arc, Mutex};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::types::Config;
use crate::device::codec::{self, decode_or_drop, Inbound};
use crate::device::constants::{DISCONNECT_DEADLINE, REQUEST_BUFFER, WRITE_DEADLINE};
use crate::device::settings::SettingsCache;
use crate::device::telemetry::Telemetry;
use crate::device::transport::{FrameStream, Transport};
use crate::device::types::{
    Channel, Command, ConnectionState, DeviceHandle, Frame, HardwareType, Outbound, SettingField, SettingsPatch,
    TransportKind,
};
use crate::error::{DeviceError, ErrorKind};

/// Deadlines and retry budget of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig::from(&Config::default())
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        SessionConfig {
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            health_check_interval: Duration::from_millis(config.health_check_interval_ms.max(1)),
            health_check_timeout: Duration::from_millis(config.health_check_timeout_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_retries: config.max_retries,
        }
    }
}

enum Request {
    Send { frame: Frame, reply: oneshot::Sender<Result<(), DeviceError>> },
    Read { channel: Channel, reply: oneshot::Sender<Result<Vec<u8>, DeviceError>> },
}

impl Request {
    fn reject(self) {
        // the caller may have given up already
        let _ = match self {
            Request::Send { reply, .. } => reply.send(Err(DeviceError::NotConnected)).map_err(|_| ()),
            Request::Read { reply, .. } => reply.send(Err(DeviceError::NotConnected)).map_err(|_| ()),
        };
    }
}

struct Attempt {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    // held while starting or tearing down an attempt, so those never interleave
    attempt: tokio::sync::Mutex<Option<Attempt>>,
    requests: Mutex<Option<mpsc::Sender<Request>>>,
    hardware: Mutex<Option<HardwareType>>,
    telemetry: Telemetry,
    settings: SettingsCache,
}

impl SessionInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!("Connection state: {} -> {}", previous, state);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

/// Owns the connection state machine and the single transport of one process-level link.
///
/// All transport traffic of an established connection goes through one task, which also
/// receives inbound frames, runs the health check and drives reconnects.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        telemetry: Telemetry,
        settings: SettingsCache,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);

        let inner = SessionInner {
            transport,
            config,
            state,
            attempt: tokio::sync::Mutex::new(None),
            requests: Mutex::new(None),
            hardware: Mutex::new(None),
            telemetry,
            settings,
        };
        Session { inner: Arc::new(inner) }
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.inner.telemetry
    }

    pub fn settings_cache(&self) -> &SettingsCache {
        &self.inner.settings
    }

    /// Hardware revision of the connected device, once known.
    pub fn hardware(&self) -> Option<HardwareType> {
        *self.inner.hardware.lock().expect("Failed to lock hardware type")
    }

    /// Starts a connection attempt and waits until it is `Ready` or `Failed`.
    ///
    /// While an attempt is already in flight or established this returns the current state
    /// without starting another one. Returns `Idle` if `disconnect()` intervenes.
    pub async fn connect(&self) -> ConnectionState {
        let mut state_rx = {
            let mut attempt = self.inner.attempt.lock().await;
            let current = self.inner.state();
            if current.is_active() {
                debug!("Connect requested while {}; ignoring", current);
                return current;
            }

            if let Some(previous) = attempt.take() {
                previous.cancel.cancel();
                if let Err(err) = previous.handle.await {
                    warn!("Previous connection task ended abnormally: {:?}", err);
                }
            }

            let (sender, receiver) = mpsc::channel(REQUEST_BUFFER);
            *self.inner.requests.lock().expect("Failed to lock requests") = Some(sender);

            let cancel = CancellationToken::new();
            self.inner.set_state(ConnectionState::Scanning);
            let state_rx = self.inner.state.subscribe();

            let connection = Connection { inner: self.inner.clone(), requests: receiver, unanswered_ping: None };
            let handle = spawn(connection.run(cancel.clone()));
            *attempt = Some(Attempt { cancel, handle });

            state_rx
        };

        let settled = state_rx
            .wait_for(|state| matches!(state, ConnectionState::Ready | ConnectionState::Failed(_) | ConnectionState::Idle))
            .await
            .map(|state| *state);

        match settled {
            Ok(state) => state,
            Err(_) => self.current_state(),
        }
    }

    /// Cancels any attempt or connection and releases the transport. Always ends in `Idle`.
    pub async fn disconnect(&self) {
        let mut attempt = self.inner.attempt.lock().await;

        if let Some(Attempt { cancel, handle }) = attempt.take() {
            cancel.cancel();
            if let Err(err) = handle.await {
                warn!("Connection task ended abnormally: {:?}", err);
                release(&self.inner).await;
            }
        }

        *self.inner.requests.lock().expect("Failed to lock requests") = None;
        *self.inner.hardware.lock().expect("Failed to lock hardware type") = None;
        self.inner.telemetry.reset();
        self.inner.set_state(ConnectionState::Idle);
    }

    /// Encodes and transmits `message`, one frame after another.
    pub async fn send(&self, message: Outbound) -> Result<(), DeviceError> {
        let frames = match message {
            Outbound::Settings(patch) => codec::encode_patch(self.kind(), &patch)?,
            Outbound::Command(command) => codec::encode_command(self.kind(), command)?.into_iter().collect(),
        };

        self.ensure_ready()?;
        for frame in frames {
            self.send_frame(frame).await?;
        }
        Ok(())
    }

    pub async fn send_command(&self, command: Command) -> Result<(), DeviceError> {
        self.send(Outbound::Command(command)).await
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), DeviceError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Send { frame, reply }).await?;
        response.await.unwrap_or(Err(DeviceError::NotConnected))
    }

    pub async fn read(&self, channel: Channel) -> Result<Vec<u8>, DeviceError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Read { channel, reply }).await?;
        response.await.unwrap_or(Err(DeviceError::NotConnected))
    }

    fn ensure_ready(&self) -> Result<(), DeviceError> {
        match self.current_state() {
            ConnectionState::Ready => Ok(()),
            _ => Err(DeviceError::NotConnected),
        }
    }

    async fn request(&self, request: Request) -> Result<(), DeviceError> {
        self.ensure_ready()?;
        let sender = self.inner.requests.lock().expect("Failed to lock requests").clone();
        match sender {
            Some(sender) => sender.send(request).await.map_err(|_| DeviceError::NotConnected),
            None => Err(DeviceError::NotConnected),
        }
    }
}

async fn release(inner: &SessionInner) {
    match timeout(Duration::from_millis(DISCONNECT_DEADLINE), inner.transport.disconnect()).await {
        Ok(Ok(())) => {},
        Ok(Err(err)) => warn!("Failed to release transport: {}", err),
        Err(_) => warn!("Releasing the transport took too long"),
    }
}

/// The task behind one `connect()`: establishes, serves and re-establishes the link.
struct Connection {
    inner: Arc<SessionInner>,
    requests: mpsc::Receiver<Request>,
    // socket only: when a ping went out with no inbound frame since
    unanswered_ping: Option<Instant>,
}

impl Connection {
    async fn run(mut self, cancel: CancellationToken) {
        let failure = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Connection task cancelled");
                None
            },
            kind = self.drive() => Some(kind),
        };

        self.reject_pending();
        release(&self.inner).await;

        if let Some(kind) = failure {
            if !cancel.is_cancelled() {
                self.inner.set_state(ConnectionState::Failed(kind));
            }
        }
    }

    /// Runs until the session fails for good; returns why.
    async fn drive(&mut self) -> ErrorKind {
        let mut frames = match self.establish(false).await {
            Ok(frames) => frames,
            Err(err) => {
                warn!("Connecting failed: {}", err);
                return err.kind();
            },
        };

        loop {
            self.reject_pending();
            self.inner.set_state(ConnectionState::Ready);

            let lost = self.serve(&mut frames).await;
            warn!("Connection lost: {}", lost);

            self.inner.set_state(ConnectionState::Reconnecting);
            self.reject_pending();
            release(&self.inner).await;

            frames = match self.reconnect().await {
                Ok(frames) => frames,
                Err(err) => {
                    warn!("Giving up reconnecting: {}", err);
                    return err.kind();
                },
            };
        }
    }

    async fn reconnect(&mut self) -> Result<FrameStream, DeviceError> {
        let max_retries = self.inner.config.max_retries;
        let mut last_error = DeviceError::ConnectionLost;

        for attempt in 1..=max_retries {
            sleep(self.inner.config.retry_delay).await;
            info!("Reconnecting (attempt {}/{})...", attempt, max_retries);

            match self.establish(true).await {
                Ok(frames) => return Ok(frames),
                Err(err) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, err);
                    release(&self.inner).await;
                    last_error = err;
                },
            }
        }

        Err(last_error)
    }

    async fn establish(&mut self, reconnecting: bool) -> Result<FrameStream, DeviceError> {
        let config = self.inner.config;

        let device = match timeout(config.scan_timeout, self.inner.transport.discover()).await {
            Ok(result) => result?,
            Err(_) => return Err(DeviceError::NotFound),
        };

        if !reconnecting {
            self.inner.set_state(ConnectionState::Connecting);
        }

        match timeout(config.connect_timeout, self.handshake(&device)).await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::Timeout { operation: "Connect" }),
        }
    }

    /// Connects and restores every notification channel before any frame is consumed.
    async fn handshake(&self, device: &DeviceHandle) -> Result<FrameStream, DeviceError> {
        let transport = &self.inner.transport;
        let frames = transport.connect(device).await?;

        for channel in Channel::notifying() {
            match transport.subscribe(channel).await {
                Ok(()) => {},
                Err(err) if channel == Channel::Status => return Err(err),
                Err(err) => warn!("Failed to subscribe to {:?}: {}", channel, err),
            }
        }

        let hardware = match transport.kind() {
            TransportKind::Packet => {
                self.read_settings().await;
                self.read_calibration().await;
                self.detect_hardware().await
            },
            // the socket device pushes its settings on its own after connecting
            TransportKind::Socket => HardwareType::Legacy,
        };
        info!("Hardware type: {:?}", hardware);
        *self.inner.hardware.lock().expect("Failed to lock hardware type") = Some(hardware);

        Ok(frames)
    }

    async fn read_settings(&self) {
        let mut update = SettingsPatch::default();

        for field in SettingField::all() {
            let channel = field.channel();
            let decoded = match self.inner.transport.read(channel).await {
                Ok(payload) => codec::decode_field(channel, &payload).map_err(DeviceError::from),
                Err(err) => Err(err),
            };

            match decoded {
                Ok(patch) => update.extend(&patch),
                Err(err) => warn!("Failed to read {:?}: {}", field, err),
            }
        }

        self.inner.settings.apply_device(&update);
    }

    async fn read_calibration(&self) {
        match self.inner.transport.read(Channel::CalibrationStatus).await {
            Ok(payload) => match codec::decode_calibration(&payload) {
                Ok(calibration) => self.inner.telemetry.publish_calibration(calibration),
                Err(err) => warn!("Dropping calibration record: {}", err),
            },
            Err(err) => warn!("Failed to read initial calibration status: {}", err),
        }
    }

    async fn detect_hardware(&self) -> HardwareType {
        let transport = &self.inner.transport;

        match transport.read(Channel::HardwareVersion).await {
            Ok(payload) => {
                if let Some(hardware) = codec::decode_hardware_version(&payload) {
                    return hardware;
                }
            },
            Err(err) => debug!("Hardware version characteristic not available: {}", err),
        }

        match transport.read(Channel::LedCount).await {
            Ok(payload) => codec::hardware_from_led_count(&payload).unwrap_or(HardwareType::New),
            Err(err) => {
                warn!("Could not detect hardware type, assuming new hardware: {}", err);
                HardwareType::New
            },
        }
    }

    /// Serves requests and inbound frames until the link is lost.
    async fn serve(&mut self, frames: &mut FrameStream) -> DeviceError {
        let period = self.inner.config.health_check_interval;
        let mut health = interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.unanswered_ping = None;

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(frame) => {
                        self.unanswered_ping = None;
                        self.dispatch(&frame);
                    },
                    None => return DeviceError::ConnectionLost,
                },
                Some(request) = self.requests.recv() => {
                    if !self.handle(request).await {
                        if let Err(err) = self.health_check().await {
                            return err;
                        }
                    }
                },
                _ = health.tick() => {
                    if let Err(err) = self.health_check().await {
                        return err;
                    }
                },
            }
        }
    }

    fn dispatch(&self, frame: &Frame) {
        match decode_or_drop(frame) {
            Some(Inbound::Status(status)) => self.inner.telemetry.publish_status(status),
            Some(Inbound::Calibration(calibration)) => self.inner.telemetry.publish_calibration(calibration),
            Some(Inbound::Settings(patch)) => self.inner.settings.apply_device(&patch),
            Some(Inbound::Pong) => debug!("Pong received from device"),
            None => {},
        }
    }

    /// Returns false if the transport rejected the request or did not finish it in time.
    async fn handle(&self, request: Request) -> bool {
        let transport = &self.inner.transport;
        let deadline = Duration::from_millis(WRITE_DEADLINE);

        match request {
            Request::Send { frame, reply } => {
                let result = match timeout(deadline, transport.send(frame)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Write took too long");
                        Err(DeviceError::Timeout { operation: "Write" })
                    },
                };
                let ok = result.is_ok();
                let _ = reply.send(result);
                ok
            },
            Request::Read { channel, reply } => {
                let result = match timeout(deadline, transport.read(channel)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Reading {:?} took too long", channel);
                        Err(DeviceError::Timeout { operation: "Read" })
                    },
                };
                let ok = result.is_ok();
                let _ = reply.send(result);
                ok
            },
        }
    }

    /// A socket ping counts as answered once any frame arrives after it.
    async fn health_check(&mut self) -> Result<(), DeviceError> {
        let config = self.inner.config;

        if let Some(sent) = self.unanswered_ping {
            if sent.elapsed() >= config.health_check_timeout {
                warn!("No answer to ping for {}", humantime::format_duration(sent.elapsed()));
                return Err(DeviceError::Timeout { operation: "Health check" });
            }
        }

        match timeout(config.health_check_timeout, self.inner.transport.health_check()).await {
            Ok(Ok(())) => {
                if self.inner.transport.kind() == TransportKind::Socket && self.unanswered_ping.is_none() {
                    self.unanswered_ping = Some(Instant::now());
                }
                Ok(())
            },
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DeviceError::Timeout { operation: "Health check" }),
        }
    }

    fn reject_pending(&mut self) {
        while let Ok(request) = self.requests.try_recv() {
            request.reject();
        }
    }
}
