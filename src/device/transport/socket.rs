use async_trait::async_trait;
use futures::future::ready;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::device::constants::{PING, POLL_DELAY, WRITE_DEADLINE};
use crate::device::transport::{FrameStream, Transport};
use crate::device::types::{Channel, DeviceHandle, Frame, TransportKind};
use crate::error::DeviceError;

type Sink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket link to the controller's access point. Every message is one JSON text frame.
pub struct SocketTransport {
    url: String,
    sink: Mutex<Option<Sink>>,
}

impl SocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        SocketTransport { url: url.into(), sink: Mutex::new(None) }
    }

    /// `host:port` of the endpoint, used to probe reachability while scanning.
    fn authority(&self) -> Result<String, DeviceError> {
        let request = self.url.as_str().into_client_request()?;
        let uri = request.uri();
        match uri.host() {
            Some(host) => Ok(format!("{}:{}", host, uri.port_u16().unwrap_or(80))),
            None => Err(DeviceError::NotFound),
        }
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn discover(&self) -> Result<DeviceHandle, DeviceError> {
        let authority = self.authority()?;
        info!("Waiting for {} to become reachable...", authority);

        loop {
            match TcpStream::connect(&authority).await {
                Ok(_) => {
                    info!("Using socket endpoint {}", self.url);
                    return Ok(DeviceHandle {
                        id: self.url.clone(),
                        name: authority.clone(),
                        address: authority,
                    });
                },
                Err(err) => debug!("{} is not reachable yet: {}", authority, err),
            }
            sleep(Duration::from_millis(POLL_DELAY)).await;
        }
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<FrameStream, DeviceError> {
        info!("Connecting to WebSocket {}...", device.id);
        let (stream, _response) = connect_async(device.id.as_str()).await?;
        let (sink, stream) = stream.split();

        let frames = stream
            .take_while(|message| {
                let open = match message {
                    Ok(Message::Close(frame)) => {
                        info!("WebSocket closed by device: {:?}", frame);
                        false
                    },
                    Ok(_) => true,
                    Err(err) => {
                        warn!("WebSocket receive failed: {}", err);
                        false
                    },
                };
                ready(open)
            })
            .filter_map(|message| {
                ready(match message {
                    Ok(Message::Text(text)) => Some(Frame::Text(text.as_str().to_owned())),
                    _ => None,
                })
            })
            .boxed();

        *self.sink.lock().await = Some(sink);
        info!("WebSocket connected");
        Ok(frames)
    }

    async fn subscribe(&self, _channel: Channel) -> Result<(), DeviceError> {
        // the device pushes status and settings to every client
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<(), DeviceError> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Packet { .. } => return Err(DeviceError::Unsupported("Characteristic writes")),
        };

        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => {
                debug!("Sending {}", text);
                tokio::select! {
                    _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                        warn!("Sending to the WebSocket took too long");
                        Err(DeviceError::Timeout { operation: "WebSocket send" })
                    }
                    result = sink.send(Message::Text(text.into())) => Ok(result?),
                }
            },
            None => Err(DeviceError::NotConnected),
        }
    }

    async fn read(&self, _channel: Channel) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::Unsupported("Reading characteristics"))
    }

    async fn health_check(&self) -> Result<(), DeviceError> {
        self.send(Frame::Text(PING.to_string())).await
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            info!("Closing WebSocket");
            sink.close().await?;
        }
        Ok(())
    }
}
