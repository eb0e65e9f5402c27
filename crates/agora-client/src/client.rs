use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::AgoraApi;
use crate::cache::{decode_collection, lock_or_recover, CacheKey, QueryCache, ReadOutcome};
use crate::mutation::{
    optimistic_placeholder, refresh_collection, CollectionSource, MutationCoordinator,
    OptimisticChange,
};
use crate::poll::MessagePoller;
use crate::transport::{StreamEventHandler, TurnOutcome, TurnStream, TurnTransport};
use crate::{
    Agent, AgentDraft, AgoraClientConfig, AgoraError, Message, Room, RoomAgent, RoomAgentDraft,
    RoomDraft, RoomMode, Session, SessionDraft, Turn, TurnRequest,
};

/// High-level Agora client: REST calls with optimistic cache updates,
/// streamed turns and message polling over one shared cache.
#[derive(Clone)]
pub struct AgoraClient {
    api: AgoraApi,
    cache: Arc<QueryCache>,
    mutations: MutationCoordinator,
    transport: TurnTransport,
    selected_session: Arc<Mutex<Option<String>>>,
}

impl AgoraClient {
    pub fn new(config: AgoraClientConfig) -> Result<Self, AgoraError> {
        let api = AgoraApi::new(config)?;
        let cache = Arc::new(QueryCache::new());
        let source: Arc<dyn CollectionSource> = Arc::new(api.clone());
        Ok(Self {
            mutations: MutationCoordinator::new(Arc::clone(&cache), source),
            transport: TurnTransport::new(api.clone(), Arc::clone(&cache)),
            api,
            cache,
            selected_session: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &AgoraClientConfig {
        self.api.config()
    }

    pub fn api(&self) -> &AgoraApi {
        &self.api
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn transport(&self) -> &TurnTransport {
        &self.transport
    }

    async fn load<T: DeserializeOwned>(&self, key: CacheKey) -> Result<Vec<T>, AgoraError> {
        let ticket = self.cache.begin_read(&key);
        let items = self.api.fetch_collection(&key).await?;
        let decoded = decode_collection(&items)?;
        let outcome = self.cache.complete_read(ticket, items);
        if outcome != ReadOutcome::Applied {
            tracing::debug!(cache_key = %key, ?outcome, "fresh list not written to cache");
        }
        Ok(decoded)
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>, AgoraError> {
        self.load(CacheKey::Rooms).await
    }

    pub async fn create_room(&self, draft: &RoomDraft) -> Result<Room, AgoraError> {
        draft.validate()?;
        let mut placeholder = optimistic_placeholder(draft)?;
        placeholder["current_mode"] = Value::from(RoomMode::default().as_str());
        self.mutations
            .create(CacheKey::Rooms, placeholder, self.api.create_room(draft))
            .await
    }

    pub async fn delete_room(&self, room_id: &str) -> Result<(), AgoraError> {
        self.mutations
            .delete(CacheKey::Rooms, "id", room_id, self.api.delete_room(room_id))
            .await
    }

    /// The cached room changes only once the server acknowledges the new mode.
    pub async fn set_room_mode(&self, room_id: &str, mode: RoomMode) -> Result<Room, AgoraError> {
        self.mutations
            .acknowledged(
                CacheKey::Rooms,
                self.api.set_room_mode(room_id, mode),
                |room: &Room| {
                    Ok(OptimisticChange::Upsert {
                        id_field: "id",
                        id: room.id.clone(),
                        value: serde_json::to_value(room)?,
                    })
                },
            )
            .await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, AgoraError> {
        self.load(CacheKey::Agents).await
    }

    pub async fn create_agent(&self, draft: &AgentDraft) -> Result<Agent, AgoraError> {
        draft.validate()?;
        let placeholder = optimistic_placeholder(draft)?;
        self.mutations
            .create(CacheKey::Agents, placeholder, self.api.create_agent(draft))
            .await
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<(), AgoraError> {
        self.mutations
            .delete(CacheKey::Agents, "id", agent_id, self.api.delete_agent(agent_id))
            .await
    }

    pub async fn list_room_agents(&self, room_id: &str) -> Result<Vec<RoomAgent>, AgoraError> {
        self.load(CacheKey::room_agents(room_id)).await
    }

    pub async fn assign_agent(
        &self,
        room_id: &str,
        draft: &RoomAgentDraft,
    ) -> Result<RoomAgent, AgoraError> {
        let mut placeholder = optimistic_placeholder(draft)?;
        placeholder["room_id"] = Value::from(room_id);
        self.mutations
            .create(
                CacheKey::room_agents(room_id),
                placeholder,
                self.api.assign_agent(room_id, draft),
            )
            .await
    }

    pub async fn unassign_agent(&self, room_id: &str, agent_id: &str) -> Result<(), AgoraError> {
        self.mutations
            .delete(
                CacheKey::room_agents(room_id),
                "agent_id",
                agent_id,
                self.api.unassign_agent(room_id, agent_id),
            )
            .await
    }

    pub async fn list_sessions(&self, room_id: &str) -> Result<Vec<Session>, AgoraError> {
        self.load(CacheKey::room_sessions(room_id)).await
    }

    pub async fn create_session(
        &self,
        room_id: &str,
        draft: &SessionDraft,
    ) -> Result<Session, AgoraError> {
        let mut placeholder = optimistic_placeholder(draft)?;
        placeholder["room_id"] = Value::from(room_id);
        self.mutations
            .create(
                CacheKey::room_sessions(room_id),
                placeholder,
                self.api.create_session(room_id, draft),
            )
            .await
    }

    pub async fn delete_session(&self, room_id: &str, session_id: &str) -> Result<(), AgoraError> {
        self.mutations
            .delete(
                CacheKey::room_sessions(room_id),
                "id",
                session_id,
                self.api.delete_session(session_id),
            )
            .await?;
        if !self.transport.registry().is_active(session_id) {
            self.transport.registry().forget(session_id);
            self.cache.remove(&CacheKey::session_messages(session_id));
            self.cache.remove(&CacheKey::session_turns(session_id));
        }
        let mut selected = lock_or_recover(&self.selected_session);
        if selected.as_deref() == Some(session_id) {
            *selected = None;
        }
        Ok(())
    }

    /// Returns the room's session for `agent_id` (the room-wide session when
    /// `None`), creating it on demand, and selects it.
    pub async fn ensure_session(
        &self,
        room_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Session, AgoraError> {
        let existing = self
            .list_sessions(room_id)
            .await?
            .into_iter()
            .find(|session| session.agent_id.as_deref() == agent_id);
        let session = match existing {
            Some(session) => session,
            None => {
                let draft = SessionDraft {
                    agent_id: agent_id.map(str::to_string),
                };
                self.create_session(room_id, &draft).await?
            }
        };
        self.select_session(Some(session.id.clone()));
        Ok(session)
    }

    /// Selects at most one session; `None` clears the selection.
    pub fn select_session(&self, session_id: Option<String>) {
        *lock_or_recover(&self.selected_session) = session_id;
    }

    pub fn selected_session(&self) -> Option<String> {
        lock_or_recover(&self.selected_session).clone()
    }

    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, AgoraError> {
        self.load(CacheKey::session_messages(session_id)).await
    }

    pub async fn list_turns(&self, session_id: &str) -> Result<Vec<Turn>, AgoraError> {
        self.load(CacheKey::session_turns(session_id)).await
    }

    /// Streams a turn, then refreshes the session's messages and turns.
    pub async fn send_turn(
        &self,
        session_id: &str,
        request: &TurnRequest,
        observer: Option<StreamEventHandler>,
    ) -> Result<TurnOutcome, AgoraError> {
        let outcome = self
            .transport
            .stream_turn(session_id, request, observer)
            .await?;
        self.refresh_session(session_id).await;
        Ok(outcome)
    }

    pub fn spawn_turn(
        &self,
        session_id: &str,
        request: TurnRequest,
    ) -> Result<TurnStream, AgoraError> {
        self.transport.spawn_turn(session_id, request)
    }

    /// In-progress text of the session's current or most recent turn.
    pub fn turn_draft(&self, session_id: &str) -> Option<String> {
        self.transport.draft(session_id)
    }

    pub fn message_poller(&self) -> MessagePoller {
        MessagePoller::new(
            Arc::new(self.api.clone()),
            Arc::clone(&self.cache),
            Duration::from_millis(self.config().poll_interval_ms),
        )
    }

    async fn refresh_session(&self, session_id: &str) {
        for key in [
            CacheKey::session_messages(session_id),
            CacheKey::session_turns(session_id),
        ] {
            if let Err(error) = refresh_collection(&self.cache, &self.api, &key).await {
                tracing::warn!(cache_key = %key, error = %error, "post-turn refresh failed");
            }
        }
    }
}
