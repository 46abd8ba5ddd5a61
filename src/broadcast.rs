//! Per-build publish/subscribe for build log lines.
//!
//! Each build id owns a `tokio::sync::broadcast` channel. Channels appear on
//! first publish or subscribe. A channel is evicted once no build for its id is
//! running, nobody is subscribed and the grace period has passed without output.
//! Eviction is checked after [`BuildLogBroadcaster::release`] and whenever a
//! [`BuildLogStream`] is dropped.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

const BUILD_START: &str = "[BUILD_START]";
const BUILD_ERROR: &str = "[BUILD_ERROR]";
const BUILD_COMPLETE: &str = "[BUILD_COMPLETE]";
const CONTAINER_ID_PREFIX: &str = "ContainerId-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildLogEvent {
    Start,
    Error,
    Complete,
    /// Runtime id of the container created by a successful build.
    ContainerId(String),
    Line(String),
}

impl BuildLogEvent {
    pub fn line(text: impl Into<String>) -> Self {
        Self::Line(text.into())
    }
}

impl std::fmt::Display for BuildLogEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => f.write_str(BUILD_START),
            Self::Error => f.write_str(BUILD_ERROR),
            Self::Complete => f.write_str(BUILD_COMPLETE),
            Self::ContainerId(id) => write!(f, "{CONTAINER_ID_PREFIX}{id}"),
            Self::Line(text) => f.write_str(text),
        }
    }
}

struct BuildChannel {
    sender: broadcast::Sender<BuildLogEvent>,
    last_publish: Instant,
    /// Set between [`BuildLogBroadcaster::begin`] and [`BuildLogBroadcaster::release`].
    building: bool,
}

impl BuildChannel {
    fn is_idle(&self, grace: Duration) -> bool {
        !self.building
            && self.sender.receiver_count() == 0
            && self.last_publish.elapsed() >= grace
    }
}

pub struct BuildLogBroadcaster {
    channels: Mutex<HashMap<String, BuildChannel>>,
    capacity: usize,
}

impl BuildLogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, BuildChannel>> {
        self.channels.lock().expect("Poisoned mutex")
    }

    fn open(&self) -> BuildChannel {
        let (sender, _) = broadcast::channel(self.capacity);
        BuildChannel {
            sender,
            last_publish: Instant::now(),
            building: false,
        }
    }

    /// Mark a build for `build_id` as running. Its channel is kept until the
    /// matching [`release`](Self::release).
    pub fn begin(&self, build_id: &str) {
        self.channels()
            .entry(build_id.to_string())
            .or_insert_with(|| self.open())
            .building = true;
    }

    /// Receive every event published for `build_id` from now on.
    pub fn subscribe(&self, build_id: &str) -> broadcast::Receiver<BuildLogEvent> {
        let mut channels = self.channels();
        if !channels.contains_key(build_id) {
            channels.insert(build_id.to_string(), self.open());
        }
        channels[build_id].sender.subscribe()
    }

    /// Subscribe to `build_id` as a stream. Dropping the stream schedules the
    /// channel for eviction after `grace`.
    pub fn stream(self: &Arc<Self>, build_id: &str, grace: Duration) -> BuildLogStream {
        BuildLogStream {
            inner: BroadcastStream::new(self.subscribe(build_id)),
            broadcaster: Arc::clone(self),
            build_id: build_id.to_string(),
            grace,
        }
    }

    /// Deliver `event` to the current subscribers of `build_id`, if any.
    pub fn publish(&self, build_id: &str, event: BuildLogEvent) {
        log::debug!("[{build_id}] {event}");
        let mut channels = self.channels();
        let channel = channels
            .entry(build_id.to_string())
            .or_insert_with(|| self.open());
        channel.last_publish = Instant::now();
        // No receivers is not an error: nobody is watching this build.
        let _ = channel.sender.send(event);
    }

    /// Publish `[BUILD_ERROR]` followed by a readable explanation.
    pub fn publish_error(&self, build_id: &str, message: impl Into<String>) {
        self.publish(build_id, BuildLogEvent::Error);
        self.publish(build_id, BuildLogEvent::Line(message.into()));
    }

    pub fn subscriber_count(&self, build_id: &str) -> usize {
        self.channels()
            .get(build_id)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    /// Mark the build for `build_id` as settled and evict its channel once it
    /// has been idle for `grace`.
    pub fn release(self: &Arc<Self>, build_id: &str, grace: Duration) {
        if let Some(channel) = self.channels().get_mut(build_id) {
            channel.building = false;
        }
        self.schedule_eviction(build_id, grace);
    }

    fn schedule_eviction(self: &Arc<Self>, build_id: &str, grace: Duration) {
        // Streams can be dropped after the runtime is gone.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let this = Arc::clone(self);
        let build_id = build_id.to_string();
        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            this.evict_idle(&build_id, grace);
        });
    }

    fn evict_idle(&self, build_id: &str, grace: Duration) -> bool {
        let mut channels = self.channels();
        match channels.get(build_id) {
            Some(channel) if channel.is_idle(grace) => {
                channels.remove(build_id);
                log::debug!("Released build log channel for {build_id}");
                true
            }
            _ => false,
        }
    }
}

/// Live events for one build id, as returned by [`BuildLogBroadcaster::stream`].
pub struct BuildLogStream {
    inner: BroadcastStream<BuildLogEvent>,
    broadcaster: Arc<BuildLogBroadcaster>,
    build_id: String,
    grace: Duration,
}

impl Stream for BuildLogStream {
    type Item = Result<BuildLogEvent, BroadcastStreamRecvError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for BuildLogStream {
    fn drop(&mut self) {
        self.broadcaster.schedule_eviction(&self.build_id, self.grace);
    }
}
