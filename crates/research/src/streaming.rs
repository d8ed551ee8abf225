//! Streaming emitter
//!
//! Push-based progress delivery. The [`EventBus`] keeps one broadcast
//! channel per key (a stream id, and the session id once known).
//! A [`StreamEmitter`] publishes one run's events and remembers enough
//! partial state to send a degraded completion if it is dropped before
//! completing. Subscribers wrap their receiver in [`completion_fallback`] so
//! a closed channel still ends in a `completed` event; [`EventBus::follow`]
//! does both and drops the channel when its last subscriber goes away.

use futures::stream::{self, Stream, StreamExt};
use quarry_common::models::{CitationRef, Stage, StreamEvent, Tier};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publish/subscribe hub keyed by stream or session id
pub struct EventBus {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<StreamEvent>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to `key`, creating its channel if needed
    pub fn subscribe(&self, key: Uuid) -> broadcast::Receiver<StreamEvent> {
        let mut channels = lock(&self.channels);
        channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Returns the number of subscribers reached
    pub fn publish(&self, key: Uuid, event: StreamEvent) -> usize {
        let channels = lock(&self.channels);
        match channels.get(&key) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the channel; subscribers drain buffered events, then see it closed
    pub fn close(&self, key: Uuid) {
        lock(&self.channels).remove(&key);
    }

    /// Drop the channel only if nobody is listening
    pub fn close_if_idle(&self, key: Uuid) {
        let mut channels = lock(&self.channels);
        if channels.get(&key).is_some_and(|s| s.receiver_count() == 0) {
            channels.remove(&key);
        }
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    /// Subscribe to `key` through [`completion_fallback`]. When the returned
    /// stream ends or is dropped, the channel is removed if no other
    /// subscriber remains.
    pub fn follow(
        self: &Arc<Self>,
        key: Uuid,
        session_id: Option<Uuid>,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let rx = self.subscribe(key);
        let release = ChannelRelease {
            bus: Arc::clone(self),
            key,
        };
        subscription_stream(rx, session_id, Some(release))
    }

    /// Emitter publishing to `stream_id`
    pub fn emitter(self: &Arc<Self>, stream_id: Uuid) -> StreamEmitter {
        StreamEmitter {
            bus: Arc::clone(self),
            stream_id,
            state: Mutex::new(PartialState::default()),
        }
    }
}

#[derive(Default)]
struct PartialState {
    session_id: Option<Uuid>,
    tier: Option<Tier>,
    stage: Option<Stage>,
    tokens: String,
    citations: Vec<CitationRef>,
    completed: bool,
}

/// Publishes one run's events
pub struct StreamEmitter {
    bus: Arc<EventBus>,
    stream_id: Uuid,
    state: Mutex<PartialState>,
}

impl StreamEmitter {
    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    pub fn session_id(&self) -> Option<Uuid> {
        lock(&self.state).session_id
    }

    /// Also publish to the session's channel from now on
    pub fn attach_session(&self, session_id: Uuid) {
        lock(&self.state).session_id = Some(session_id);
    }

    fn emit(&self, event: StreamEvent) {
        let session_id = lock(&self.state).session_id;
        self.bus.publish(self.stream_id, event.clone());
        if let Some(session_id) = session_id.filter(|id| *id != self.stream_id) {
            self.bus.publish(session_id, event);
        }
    }

    pub fn tier(&self, tier: Tier) {
        lock(&self.state).tier = Some(tier);
        self.emit(StreamEvent::TierSelected { tier });
    }

    pub fn stage(&self, stage: Stage, round: Option<u32>, message: impl Into<String>) {
        lock(&self.state).stage = Some(stage);
        self.emit(StreamEvent::stage(stage, round, message));
    }

    pub fn token(&self, text: &str) {
        lock(&self.state).tokens.push_str(text);
        self.emit(StreamEvent::Token {
            text: text.to_string(),
        });
    }

    pub fn citations(&self, citations: &[CitationRef]) {
        lock(&self.state).citations = citations.to_vec();
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(StreamEvent::Error {
            message: message.into(),
        });
    }

    /// Publish the terminal event. Only the first call has any effect.
    pub fn complete(&self, answer: impl Into<String>, citations: Vec<CitationRef>, degraded: bool) {
        let session_id = {
            let mut state = lock(&self.state);
            if state.completed {
                return;
            }
            state.completed = true;
            state.session_id
        };
        self.emit(StreamEvent::Completed {
            session_id,
            answer: answer.into(),
            citations,
            degraded,
            fallback: false,
        });
    }

    fn fallback_completion(&self) -> Option<StreamEvent> {
        let mut state = lock(&self.state);
        if state.completed {
            return None;
        }
        state.completed = true;
        debug!(
            stream_id = %self.stream_id,
            tier = ?state.tier,
            stage = ?state.stage,
            "Emitter dropped before completion, sending fallback"
        );
        Some(StreamEvent::Completed {
            session_id: state.session_id,
            answer: std::mem::take(&mut state.tokens),
            citations: std::mem::take(&mut state.citations),
            degraded: true,
            fallback: true,
        })
    }
}

impl Drop for StreamEmitter {
    fn drop(&mut self) {
        if let Some(event) = self.fallback_completion() {
            self.emit(event);
        }
        self.bus.close(self.stream_id);
        if let Some(session_id) = lock(&self.state).session_id {
            self.bus.close_if_idle(session_id);
        }
    }
}

/// Closes an idle channel when its subscription goes away
struct ChannelRelease {
    bus: Arc<EventBus>,
    key: Uuid,
}

impl Drop for ChannelRelease {
    fn drop(&mut self) {
        self.bus.close_if_idle(self.key);
    }
}

// Field order matters: the receiver must drop before the release runs.
struct Subscription {
    inner: BroadcastStream<StreamEvent>,
    session_id: Option<Uuid>,
    tokens: String,
    done: bool,
    _release: Option<ChannelRelease>,
}

/// Events from `rx` up to and including the first `completed`. If the
/// channel closes first, a degraded completion is synthesized from the
/// tokens seen so far.
pub fn completion_fallback(
    rx: broadcast::Receiver<StreamEvent>,
    session_id: Option<Uuid>,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    subscription_stream(rx, session_id, None)
}

fn subscription_stream(
    rx: broadcast::Receiver<StreamEvent>,
    session_id: Option<Uuid>,
    release: Option<ChannelRelease>,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    let subscription = Subscription {
        inner: BroadcastStream::new(rx),
        session_id,
        tokens: String::new(),
        done: false,
        _release: release,
    };

    stream::unfold(subscription, |mut sub| async move {
        if sub.done {
            return None;
        }
        loop {
            match sub.inner.next().await {
                Some(Ok(event)) => {
                    match &event {
                        StreamEvent::Token { text } => sub.tokens.push_str(text),
                        StreamEvent::Completed { .. } => sub.done = true,
                        _ => {}
                    }
                    return Some((event, sub));
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "Subscriber lagged, events dropped");
                }
                None => {
                    sub.done = true;
                    let event = StreamEvent::Completed {
                        session_id: sub.session_id,
                        answer: std::mem::take(&mut sub.tokens),
                        citations: Vec::new(),
                        degraded: true,
                        fallback: true,
                    };
                    return Some((event, sub));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(64))
    }

    async fn collect(rx: broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        completion_fallback(rx, None).collect().await
    }

    #[tokio::test]
    async fn test_completed_run_ends_stream() {
        let bus = bus();
        let id = Uuid::new_v4();
        let rx = bus.subscribe(id);

        let emitter = bus.emitter(id);
        emitter.tier(Tier::DeepResearch);
        emitter.stage(Stage::Fetching, Some(1), "Fetching sources");
        emitter.token("Hello ");
        emitter.complete("Hello world", Vec::new(), false);
        drop(emitter);

        let events = collect(rx).await;
        assert_eq!(events.len(), 4);
        match events.last().unwrap() {
            StreamEvent::Completed { fallback, degraded, answer, .. } => {
                assert!(!fallback);
                assert!(!degraded);
                assert_eq!(answer, "Hello world");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_emitter_sends_fallback_from_partial_state() {
        let bus = bus();
        let id = Uuid::new_v4();
        let rx = bus.subscribe(id);

        let emitter = bus.emitter(id);
        emitter.stage(Stage::Synthesizing, None, "Writing answer");
        emitter.token("Partial ");
        emitter.token("answer");
        drop(emitter);

        let events = collect(rx).await;
        match events.last().unwrap() {
            StreamEvent::Completed { fallback, degraded, answer, .. } => {
                assert!(fallback);
                assert!(degraded);
                assert_eq!(answer, "Partial answer");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_synthesizes_completion() {
        let bus = bus();
        let id = Uuid::new_v4();
        let rx = bus.subscribe(id);
        bus.publish(id, StreamEvent::Token { text: "abc".into() });
        bus.close(id);

        let session_id = Uuid::new_v4();
        let events: Vec<StreamEvent> = completion_fallback(rx, Some(session_id)).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::Completed {
                session_id: Some(session_id),
                answer: "abc".into(),
                citations: vec![],
                degraded: true,
                fallback: true,
            }
        );
    }

    #[tokio::test]
    async fn test_session_subscribers_receive_attached_events() {
        let bus = bus();
        let stream_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let session_rx = bus.subscribe(session_id);

        let emitter = bus.emitter(stream_id);
        emitter.token("not seen");
        emitter.attach_session(session_id);
        emitter.token("seen");
        emitter.complete("seen", Vec::new(), false);
        drop(emitter);
        bus.close(session_id);

        let events = collect(session_rx).await;
        assert_eq!(events[0], StreamEvent::Token { text: "seen".into() });
        assert!(matches!(
            events[1],
            StreamEvent::Completed { session_id: Some(id), .. } if id == session_id
        ));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = bus();
        assert_eq!(bus.publish(Uuid::new_v4(), StreamEvent::Token { text: "x".into() }), 0);
        assert_eq!(bus.channel_count(), 0);
    }

    #[test]
    fn test_complete_only_once() {
        let bus = bus();
        let id = Uuid::new_v4();
        let mut rx = bus.subscribe(id);
        let emitter = bus.emitter(id);
        emitter.complete("a", Vec::new(), false);
        emitter.complete("b", Vec::new(), true);
        drop(emitter);

        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Completed { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_follower_releases_idle_channel() {
        let bus = bus();
        let session_id = Uuid::new_v4();

        let first = bus.follow(session_id, Some(session_id));
        let second = bus.follow(session_id, Some(session_id));
        assert_eq!(bus.channel_count(), 1);

        drop(first);
        assert_eq!(bus.channel_count(), 1);
        drop(second);
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_follower_releases_channel() {
        let bus = bus();
        let session_id = Uuid::new_v4();
        let events = bus.follow(session_id, Some(session_id));

        let emitter = bus.emitter(Uuid::new_v4());
        emitter.attach_session(session_id);
        emitter.token("done");
        emitter.complete("done", Vec::new(), false);

        let events: Vec<StreamEvent> = events.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(bus.channel_count(), 0);
        drop(emitter);
        assert_eq!(bus.channel_count(), 0);
    }
}
