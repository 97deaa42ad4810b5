//! The physical link to the controller.
//!
//! A transport only moves [`Frame`]s; everything above it is transport-agnostic apart
//! from the choice of encoding, which follows [`Transport::kind`].

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::device::types::{Channel, DeviceHandle, Frame, TransportKind};
use crate::error::DeviceError;

pub mod packet;
pub mod socket;

/// Inbound frames of one connection. The stream ends when the link is lost.
pub type FrameStream = BoxStream<'static, Frame>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Looks for the controller until it is found. The caller applies the scan deadline
    /// and may drop the future at any point.
    async fn discover(&self) -> Result<DeviceHandle, DeviceError>;

    /// Opens the link to a previously discovered device and completes the handshake.
    async fn connect(&self, device: &DeviceHandle) -> Result<FrameStream, DeviceError>;

    /// Enables notifications on `channel`. Opening an already open channel is a no-op.
    async fn subscribe(&self, channel: Channel) -> Result<(), DeviceError>;

    async fn send(&self, frame: Frame) -> Result<(), DeviceError>;

    async fn read(&self, channel: Channel) -> Result<Vec<u8>, DeviceError>;

    /// Probes the link; an error means the connection is gone.
    async fn health_check(&self) -> Result<(), DeviceError>;

    /// Releases the link. Safe to call when nothing is connected.
    async fn disconnect(&self) -> Result<(), DeviceError>;
}
