#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::future::pending;
use futures::StreamExt;
use tokio::time::Duration;

use afterburner_link::device::session::SessionConfig;
use afterburner_link::device::transport::{FrameStream, Transport};
use afterburner_link::device::types::{Channel, DeviceHandle, Frame, TransportKind};
use afterburner_link::device::DeviceLink;
use afterburner_link::error::DeviceError;

#[derive(Default)]
struct MockState {
    discoverable: bool,
    connect_failures: usize,
    fail_sends_after: Option<usize>,
    stall_sends: bool,
    hang_connects: bool,
    ignore_pings: bool,
    link: Option<UnboundedSender<Frame>>,
    // an inbound stream that stays open although the device is gone
    zombie: Option<UnboundedSender<Frame>>,
    reads: HashMap<Channel, Vec<u8>>,
    sent: Vec<Frame>,
    subscriptions: Vec<Channel>,
    connects: usize,
    disconnects: usize,
}

/// In-memory transport whose device side is driven by the test.
#[derive(Clone)]
pub struct MockTransport {
    kind: TransportKind,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Self {
        let state = MockState { discoverable: true, ..Default::default() };
        MockTransport { kind, state: Arc::new(Mutex::new(state)) }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_discoverable(&self, discoverable: bool) {
        self.state().discoverable = discoverable;
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state().connect_failures = count;
    }

    /// Sends after the first `count` successful ones are rejected.
    pub fn fail_sends_after(&self, count: usize) {
        self.state().fail_sends_after = Some(count);
    }

    /// Sends never complete, like a peer that stopped reading.
    pub fn stall_sends(&self) {
        self.state().stall_sends = true;
    }

    /// `connect` opens the link and then never returns.
    pub fn hang_connects(&self) {
        self.state().hang_connects = true;
    }

    /// The device stops answering socket pings while the link stays up.
    pub fn ignore_pings(&self) {
        self.state().ignore_pings = true;
    }

    pub fn set_read(&self, channel: Channel, payload: Vec<u8>) {
        self.state().reads.insert(channel, payload);
    }

    /// Delivers a frame from the device. Returns false if nothing is connected.
    pub fn push(&self, frame: Frame) -> bool {
        match &self.state().link {
            Some(link) => link.unbounded_send(frame).is_ok(),
            None => false,
        }
    }

    pub fn push_text(&self, text: &str) -> bool {
        self.push(Frame::Text(text.to_string()))
    }

    /// Simulates the device going away: the inbound stream ends.
    pub fn drop_link(&self) {
        self.state().link = None;
    }

    /// The device goes away without the inbound stream noticing.
    pub fn kill_silently(&self) {
        let mut state = self.state();
        state.zombie = state.link.take();
    }

    pub fn is_linked(&self) -> bool {
        self.state().link.is_some()
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.state().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.state().sent.clear();
    }

    pub fn subscriptions(&self) -> Vec<Channel> {
        self.state().subscriptions.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn discover(&self) -> Result<DeviceHandle, DeviceError> {
        loop {
            if self.state().discoverable {
                return Ok(DeviceHandle {
                    id: "mock".to_string(),
                    name: "ABurner".to_string(),
                    address: "00:00:00:00:00:00".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn connect(&self, _device: &DeviceHandle) -> Result<FrameStream, DeviceError> {
        {
            let mut state = self.state();
            state.connects += 1;
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(DeviceError::ConnectionLost);
            }

            let (sender, receiver) = unbounded();
            state.link = Some(sender);
            state.zombie = None;
            if !state.hang_connects {
                return Ok(receiver.boxed());
            }
        }
        pending().await
    }

    async fn subscribe(&self, channel: Channel) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.link.is_none() {
            return Err(DeviceError::NotConnected);
        }
        state.subscriptions.push(channel);
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<(), DeviceError> {
        let stalled = self.state().stall_sends;
        if stalled {
            pending::<()>().await;
        }

        let mut state = self.state();
        if state.link.is_none() {
            return Err(DeviceError::NotConnected);
        }
        if let Some(limit) = state.fail_sends_after {
            if state.sent.len() >= limit {
                return Err(DeviceError::Timeout { operation: "Characteristic write" });
            }
        }
        state.sent.push(frame);
        Ok(())
    }

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, DeviceError> {
        if self.kind == TransportKind::Socket {
            return Err(DeviceError::Unsupported("Reading characteristics"));
        }
        match self.state().reads.get(&channel) {
            Some(payload) => Ok(payload.clone()),
            None => Err(DeviceError::MissingCharacteristic(channel)),
        }
    }

    async fn health_check(&self) -> Result<(), DeviceError> {
        let state = self.state();
        match &state.link {
            Some(link) => {
                if self.kind == TransportKind::Socket && !state.ignore_pings {
                    let _ = link.unbounded_send(Frame::Text("pong".to_string()));
                }
                Ok(())
            },
            None => Err(DeviceError::ConnectionLost),
        }
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.disconnects += 1;
        state.link = None;
        Ok(())
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        scan_timeout: Duration::from_secs(1),
        connect_timeout: Duration::from_secs(1),
        health_check_interval: Duration::from_secs(30),
        health_check_timeout: Duration::from_secs(1),
        retry_delay: Duration::from_millis(100),
        max_retries: 3,
    }
}

pub fn link(kind: TransportKind) -> (DeviceLink, MockTransport) {
    let mock = MockTransport::new(kind);
    let link = DeviceLink::new(Arc::new(mock.clone()), test_config());
    (link, mock)
}

/// A packet mock that reports legacy hardware on read-back.
pub fn legacy_packet_link() -> (DeviceLink, MockTransport) {
    let (link, mock) = link(TransportKind::Packet);
    mock.set_read(Channel::HardwareVersion, vec![1]);
    (link, mock)
}
