use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{Stream, StreamExt};
use indexmap::IndexMap;
use log::debug;
use tokio::spawn;

use crate::device::constants::SUBSCRIBER_BUFFER;
use crate::device::types::{CalibrationState, DeviceStatus};

struct RegistryInner<T> {
    next_id: u64,
    subscribers: IndexMap<u64, Sender<T>>,
    latest: Option<T>,
}

/// Fan-out of one inbound channel to any number of subscribers.
///
/// Publishing never waits: a subscriber whose buffer is full misses the update.
pub struct Registry<T> {
    name: &'static str,
    inner: Arc<Mutex<RegistryInner<T>>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Registry { name: self.name, inner: self.inner.clone() }
    }
}

impl<T: Clone + Send + 'static> Registry<T> {
    pub fn new(name: &'static str) -> Self {
        let inner = RegistryInner { next_id: 0, subscribers: IndexMap::new(), latest: None };
        Registry { name, inner: Arc::new(Mutex::new(inner)) }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (sender, receiver) = channel::<T>(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().expect("Failed to lock registry");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, sender);

        let closed = Arc::new(AtomicBool::new(false));
        let registry: Weak<Mutex<RegistryInner<T>>> = Arc::downgrade(&self.inner);
        let unsubscribe = Unsubscribe::new({
            let closed = closed.clone();
            move || {
                // updates still buffered are never delivered
                closed.store(true, Ordering::SeqCst);
                if let Some(registry) = registry.upgrade() {
                    let mut inner = registry.lock().expect("Failed to lock registry");
                    if let Some(mut sender) = inner.subscribers.shift_remove(&id) {
                        sender.close_channel();
                    }
                }
            }
        });

        Subscription { receiver, closed, unsubscribe }
    }

    /// Calls `callback` for every update on a separate task, until unsubscribed.
    /// Must be called from within a tokio runtime.
    pub fn subscribe_with<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(T) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let unsubscribe = subscription.handle();

        spawn(async move {
            while let Some(value) = subscription.next().await {
                callback(value);
            }
        });

        unsubscribe
    }

    pub fn publish(&self, value: T) {
        let mut inner = self.inner.lock().expect("Failed to lock registry");
        inner.latest = Some(value.clone());

        let name = self.name;
        inner.subscribers.retain(|id, sender| match sender.try_send(value.clone()) {
            Ok(()) => true,
            Err(err) if err.is_full() => {
                debug!("{} subscriber {} is lagging, dropping update", name, id);
                true
            },
            Err(_) => false,
        });
    }

    pub fn latest(&self) -> Option<T> {
        self.inner.lock().expect("Failed to lock registry").latest.clone()
    }

    pub fn clear_latest(&self) {
        self.inner.lock().expect("Failed to lock registry").latest = None;
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("Failed to lock registry").subscribers.len()
    }
}

/// Removes a subscription. Calling it more than once, or after the session is gone, does nothing.
#[derive(Clone)]
pub struct Unsubscribe {
    remove: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl Unsubscribe {
    fn new<F: FnOnce() + Send + 'static>(remove: F) -> Self {
        Unsubscribe { remove: Arc::new(Mutex::new(Some(Box::new(remove)))) }
    }

    pub fn unsubscribe(&self) {
        let remove = self.remove.lock().expect("Failed to lock unsubscribe").take();
        if let Some(remove) = remove {
            remove();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe").finish_non_exhaustive()
    }
}

/// A stream of updates for one subscriber.
pub struct Subscription<T> {
    receiver: Receiver<T>,
    closed: Arc<AtomicBool>,
    unsubscribe: Unsubscribe,
}

impl<T> Subscription<T> {
    pub fn handle(&self) -> Unsubscribe {
        self.unsubscribe.clone()
    }

    pub fn unsubscribe(&self) {
        self.unsubscribe.unsubscribe();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if self.closed.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

/// Status and calibration updates of the current session.
///
/// Subscribers survive reconnects: the session keeps publishing into the same registries.
#[derive(Clone)]
pub struct Telemetry {
    status: Registry<DeviceStatus>,
    calibration: Registry<CalibrationState>,
}

impl Telemetry {
    pub fn new() -> Self {
        Telemetry {
            status: Registry::new("status"),
            calibration: Registry::new("calibration"),
        }
    }

    pub fn subscribe_status<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(DeviceStatus) + Send + 'static,
    {
        self.status.subscribe_with(callback)
    }

    pub fn subscribe_calibration<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(CalibrationState) + Send + 'static,
    {
        self.calibration.subscribe_with(callback)
    }

    pub fn status_updates(&self) -> Subscription<DeviceStatus> {
        self.status.subscribe()
    }

    pub fn calibration_updates(&self) -> Subscription<CalibrationState> {
        self.calibration.subscribe()
    }

    pub fn latest_status(&self) -> Option<DeviceStatus> {
        self.status.latest()
    }

    pub fn latest_calibration(&self) -> Option<CalibrationState> {
        self.calibration.latest()
    }

    pub(crate) fn publish_status(&self, status: DeviceStatus) {
        self.status.publish(status);
    }

    pub(crate) fn publish_calibration(&self, calibration: CalibrationState) {
        self.calibration.publish(calibration);
    }

    /// Forgets the last values at the end of a session. Subscribers are kept.
    pub(crate) fn reset(&self) {
        self.status.clear_latest();
        self.calibration.clear_latest();
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Telemetry::new()
    }
}
