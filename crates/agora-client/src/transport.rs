//! Streaming turn submission with a single synchronous fallback.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::api::{require_id, stream_turn_path, AgoraApi};
use crate::cache::{lock_or_recover, CacheKey, QueryCache};
use crate::events::{EventInterpreter, StreamEvent, TurnDone};
use crate::http::transport_error;
use crate::{AgoraError, Turn, TurnRequest};

/// Observer invoked synchronously, in arrival order, for every stream event.
pub type StreamEventHandler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `TurnPhase` values.
pub enum TurnPhase {
    #[default]
    Idle,
    Sending,
    Streaming,
    Completed,
    Failed,
}

impl TurnPhase {
    pub fn is_active(self) -> bool {
        matches!(self, TurnPhase::Sending | TurnPhase::Streaming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDelivery {
    Streamed,
    /// The stream failed and the synchronous endpoint produced the turn.
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
/// Result of a completed turn.
pub struct TurnOutcome {
    pub session_id: String,
    pub text: String,
    pub done: Option<TurnDone>,
    /// Server record, present when the turn completed through the fallback.
    pub turn: Option<Turn>,
    pub delivery: TurnDelivery,
}

#[derive(Debug, Default)]
struct ActiveTurn {
    phase: TurnPhase,
    draft: String,
}

#[derive(Debug, Clone, Default)]
/// Per-session turn phases and in-progress drafts.
pub struct TurnRegistry {
    turns: Arc<Mutex<HashMap<String, ActiveTurn>>>,
}

impl TurnRegistry {
    pub fn phase(&self, session_id: &str) -> TurnPhase {
        lock_or_recover(&self.turns)
            .get(session_id)
            .map(|turn| turn.phase)
            .unwrap_or_default()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.phase(session_id).is_active()
    }

    /// Accumulated text of the session's current or most recent turn.
    pub fn draft(&self, session_id: &str) -> Option<String> {
        lock_or_recover(&self.turns)
            .get(session_id)
            .map(|turn| turn.draft.clone())
    }

    /// Drops the session's phase and draft unless a turn is still running.
    pub fn forget(&self, session_id: &str) {
        let mut turns = lock_or_recover(&self.turns);
        if turns
            .get(session_id)
            .is_some_and(|turn| !turn.phase.is_active())
        {
            turns.remove(session_id);
        }
    }

    fn claim(&self, session_id: &str, cache: Arc<QueryCache>) -> Result<TurnClaim, AgoraError> {
        {
            let mut turns = lock_or_recover(&self.turns);
            let turn = turns.entry(session_id.to_string()).or_default();
            if turn.phase.is_active() {
                return Err(AgoraError::TurnInFlight {
                    session_id: session_id.to_string(),
                });
            }
            turn.phase = TurnPhase::Sending;
            turn.draft.clear();
        }

        cache.suspend(&CacheKey::session_messages(session_id));
        tracing::debug!(session_id, "turn sending");
        Ok(TurnClaim {
            registry: self.clone(),
            cache,
            session_id: session_id.to_string(),
            final_phase: TurnPhase::Failed,
        })
    }

    fn with_turn(&self, session_id: &str, update: impl FnOnce(&mut ActiveTurn)) {
        if let Some(turn) = lock_or_recover(&self.turns).get_mut(session_id) {
            update(turn);
        }
    }
}

/// Exclusive right to run one turn on a session.
///
/// While held, background message reads for the session are suspended.
/// Dropping the claim records the final phase, resumes polling and marks the
/// session's messages and turns stale.
struct TurnClaim {
    registry: TurnRegistry,
    cache: Arc<QueryCache>,
    session_id: String,
    final_phase: TurnPhase,
}

impl TurnClaim {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn mark_streaming(&self) {
        self.registry.with_turn(&self.session_id, |turn| {
            if turn.phase == TurnPhase::Sending {
                turn.phase = TurnPhase::Streaming;
                tracing::debug!(session_id = %self.session_id, "turn streaming");
            }
        });
    }

    fn append_draft(&self, delta: &str) {
        self.registry
            .with_turn(&self.session_id, |turn| turn.draft.push_str(delta));
    }

    fn replace_draft(&self, text: &str) {
        self.registry.with_turn(&self.session_id, |turn| {
            turn.draft.clear();
            turn.draft.push_str(text);
        });
    }

    fn finish(mut self, phase: TurnPhase) {
        self.final_phase = phase;
    }
}

impl Drop for TurnClaim {
    fn drop(&mut self) {
        let phase = self.final_phase;
        self.registry
            .with_turn(&self.session_id, |turn| turn.phase = phase);
        let messages = CacheKey::session_messages(&self.session_id);
        self.cache.resume(&messages);
        self.cache.invalidate(&messages);
        self.cache
            .invalidate(&CacheKey::session_turns(&self.session_id));
        tracing::debug!(session_id = %self.session_id, ?phase, "turn finished");
    }
}

#[derive(Debug)]
/// Item of a spawned turn's update sequence.
pub enum TurnUpdate {
    Event(StreamEvent),
    Completed(TurnOutcome),
    Failed(AgoraError),
}

impl TurnUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnUpdate::Event(_))
    }
}

#[derive(Debug)]
/// Ordered updates of a turn running on a background task.
///
/// Dropping the stream cancels the turn.
pub struct TurnStream {
    updates: mpsc::UnboundedReceiver<TurnUpdate>,
    cancel: Option<oneshot::Sender<()>>,
}

impl TurnStream {
    pub async fn recv(&mut self) -> Option<TurnUpdate> {
        self.updates.recv().await
    }

    /// Requests cancellation. The sequence still ends with `Failed(Cancelled)`
    /// unless the turn had already finished.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    /// Drains the sequence and returns the terminal result.
    pub async fn finish(mut self) -> Result<TurnOutcome, AgoraError> {
        while let Some(update) = self.updates.recv().await {
            match update {
                TurnUpdate::Event(_) => continue,
                TurnUpdate::Completed(outcome) => return Ok(outcome),
                TurnUpdate::Failed(error) => return Err(error),
            }
        }
        Err(AgoraError::Cancelled)
    }
}

impl Stream for TurnStream {
    type Item = TurnUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_recv(cx)
    }
}

#[derive(Clone)]
/// Runs turns against the streaming endpoint, falling back once to the
/// synchronous endpoint when the stream fails.
pub struct TurnTransport {
    api: AgoraApi,
    cache: Arc<QueryCache>,
    registry: TurnRegistry,
}

impl TurnTransport {
    pub fn new(api: AgoraApi, cache: Arc<QueryCache>) -> Self {
        Self {
            api,
            cache,
            registry: TurnRegistry::default(),
        }
    }

    pub fn registry(&self) -> &TurnRegistry {
        &self.registry
    }

    pub fn phase(&self, session_id: &str) -> TurnPhase {
        self.registry.phase(session_id)
    }

    pub fn draft(&self, session_id: &str) -> Option<String> {
        self.registry.draft(session_id)
    }

    pub async fn stream_turn(
        &self,
        session_id: &str,
        request: &TurnRequest,
        observer: Option<StreamEventHandler>,
    ) -> Result<TurnOutcome, AgoraError> {
        require_id("session", session_id)?;
        request.validate()?;
        let claim = self.registry.claim(session_id, Arc::clone(&self.cache))?;
        let observer = match observer {
            Some(observer) => observer,
            None => Arc::new(|_event: &StreamEvent| {}) as StreamEventHandler,
        };

        let result = self.run(&claim, request, &observer).await;
        claim.finish(terminal_phase(&result));
        result
    }

    /// Starts the turn on a background task. A concurrent turn on the same
    /// session is refused before anything is spawned.
    pub fn spawn_turn(
        &self,
        session_id: &str,
        request: TurnRequest,
    ) -> Result<TurnStream, AgoraError> {
        require_id("session", session_id)?;
        request.validate()?;
        let claim = self.registry.claim(session_id, Arc::clone(&self.cache))?;
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let transport = self.clone();

        tokio::spawn(async move {
            let event_tx = updates_tx.clone();
            let observer: StreamEventHandler = Arc::new(move |event: &StreamEvent| {
                let _ = event_tx.send(TurnUpdate::Event(event.clone()));
            });

            let result = tokio::select! {
                result = transport.run(&claim, &request, &observer) => result,
                _ = cancel_rx => {
                    tracing::debug!(session_id = %claim.session_id(), "turn cancelled");
                    Err(AgoraError::Cancelled)
                }
            };
            claim.finish(terminal_phase(&result));

            let update = match result {
                Ok(outcome) => TurnUpdate::Completed(outcome),
                Err(error) => TurnUpdate::Failed(error),
            };
            let _ = updates_tx.send(update);
        });

        Ok(TurnStream {
            updates: updates_rx,
            cancel: Some(cancel_tx),
        })
    }

    async fn run(
        &self,
        claim: &TurnClaim,
        request: &TurnRequest,
        observer: &StreamEventHandler,
    ) -> Result<TurnOutcome, AgoraError> {
        let stream_error = match self.stream_once(claim, request, observer).await {
            Ok(outcome) => return Ok(outcome),
            Err(error) => error,
        };

        let session_id = claim.session_id();
        tracing::warn!(
            session_id,
            error = %stream_error,
            "turn stream failed; retrying once through synchronous endpoint"
        );

        match self.api.submit_turn(session_id, request).await {
            Ok(turn) => {
                claim.replace_draft(&turn.assistant_output);
                Ok(TurnOutcome {
                    session_id: session_id.to_string(),
                    text: turn.assistant_output.clone(),
                    done: Some(TurnDone::from_turn(&turn)),
                    turn: Some(turn),
                    delivery: TurnDelivery::Fallback,
                })
            }
            Err(fallback_error) => {
                tracing::warn!(
                    session_id,
                    error = %fallback_error,
                    "synchronous turn fallback failed"
                );
                Err(AgoraError::TurnFailed {
                    input: request.clone(),
                    stream: Box::new(stream_error),
                    fallback: Box::new(fallback_error),
                })
            }
        }
    }

    async fn stream_once(
        &self,
        claim: &TurnClaim,
        request: &TurnRequest,
        observer: &StreamEventHandler,
    ) -> Result<TurnOutcome, AgoraError> {
        let path = stream_turn_path(claim.session_id());
        let timeout_ms = self.api.config().stream_timeout_ms;
        let response = self.api.http().open_stream(&path, request).await?;

        let deliver = |event: &StreamEvent| {
            if let StreamEvent::Chunk { delta } = event {
                claim.append_draft(delta);
            }
            observer(event);
        };

        let mut body = response.bytes_stream();
        let mut interpreter = EventInterpreter::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|error| transport_error(error, &path, timeout_ms))?;
            claim.mark_streaming();
            for event in interpreter.push_bytes(chunk.as_ref()) {
                deliver(&event);
            }
            if interpreter.is_done() {
                break;
            }
        }
        for event in interpreter.finish() {
            deliver(&event);
        }

        let accumulator = interpreter.into_accumulator();
        if accumulator.unknown_count() > 0 {
            tracing::debug!(
                session_id = %claim.session_id(),
                unknown = accumulator.unknown_count(),
                "turn stream carried unrecognised events"
            );
        }
        let (text, done) = accumulator.into_parts();
        Ok(TurnOutcome {
            session_id: claim.session_id().to_string(),
            text,
            done,
            turn: None,
            delivery: TurnDelivery::Streamed,
        })
    }
}

fn terminal_phase<T>(result: &Result<T, AgoraError>) -> TurnPhase {
    if result.is_ok() {
        TurnPhase::Completed
    } else {
        TurnPhase::Failed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{TurnPhase, TurnRegistry, TurnUpdate};
    use crate::cache::{CacheKey, QueryCache};
    use crate::events::StreamEvent;
    use crate::AgoraError;

    #[test]
    fn claim_refuses_second_turn_and_suspends_message_reads() {
        let registry = TurnRegistry::default();
        let cache = Arc::new(QueryCache::new());
        let messages = CacheKey::session_messages("s1");

        let claim = registry
            .claim("s1", Arc::clone(&cache))
            .expect("first claim");
        assert_eq!(registry.phase("s1"), TurnPhase::Sending);
        assert!(cache.is_suspended(&messages));

        let error = registry
            .claim("s1", Arc::clone(&cache))
            .err()
            .expect("second claim refused");
        assert!(matches!(error, AgoraError::TurnInFlight { ref session_id } if session_id == "s1"));

        let other = registry
            .claim("s2", Arc::clone(&cache))
            .expect("other session unaffected");
        other.finish(TurnPhase::Completed);

        claim.mark_streaming();
        claim.append_draft("Hel");
        claim.append_draft("lo");
        assert_eq!(registry.phase("s1"), TurnPhase::Streaming);
        assert_eq!(registry.draft("s1").as_deref(), Some("Hello"));

        claim.finish(TurnPhase::Completed);
        assert_eq!(registry.phase("s1"), TurnPhase::Completed);
        assert!(!cache.is_suspended(&messages));
        assert!(cache.is_stale(&CacheKey::session_turns("s1")));
        assert_eq!(registry.draft("s1").as_deref(), Some("Hello"));
    }

    #[test]
    fn dropped_claim_records_failure_and_allows_retry() {
        let registry = TurnRegistry::default();
        let cache = Arc::new(QueryCache::new());
        drop(registry.claim("s1", Arc::clone(&cache)).expect("claim"));
        assert_eq!(registry.phase("s1"), TurnPhase::Failed);
        assert!(!registry.is_active("s1"));

        let retry = registry.claim("s1", cache).expect("retry allowed");
        assert_eq!(registry.draft("s1").as_deref(), Some(""));
        retry.finish(TurnPhase::Completed);
    }

    #[test]
    fn forget_keeps_running_turns_and_drops_finished_ones() {
        let registry = TurnRegistry::default();
        let cache = Arc::new(QueryCache::new());
        let claim = registry.claim("s1", Arc::clone(&cache)).expect("claim");
        claim.append_draft("partial");

        registry.forget("s1");
        assert!(registry.is_active("s1"));
        assert_eq!(registry.draft("s1").as_deref(), Some("partial"));

        claim.finish(TurnPhase::Completed);
        registry.forget("s1");
        assert_eq!(registry.phase("s1"), TurnPhase::Idle);
        assert!(registry.draft("s1").is_none());
    }

    #[test]
    fn unknown_session_is_idle() {
        let registry = TurnRegistry::default();
        assert_eq!(registry.phase("missing"), TurnPhase::Idle);
        assert!(registry.draft("missing").is_none());
    }

    #[test]
    fn only_event_updates_are_non_terminal() {
        assert!(!TurnUpdate::Event(StreamEvent::Chunk {
            delta: "x".to_string()
        })
        .is_terminal());
        assert!(TurnUpdate::Failed(AgoraError::Cancelled).is_terminal());
    }
}
