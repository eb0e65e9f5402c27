use async_trait::async_trait;
use serde_json::{json, Value};

use crate::cache::CacheKey;
use crate::http::HttpCore;
use crate::mutation::CollectionSource;
use crate::{
    Agent, AgentDraft, AgoraClientConfig, AgoraError, Message, Room, RoomAgent, RoomAgentDraft,
    RoomDraft, RoomMode, Session, SessionDraft, Turn, TurnRequest,
};

pub(crate) fn stream_turn_path(session_id: &str) -> String {
    format!("/sessions/{session_id}/turns/stream")
}

pub(crate) fn sync_turn_path(session_id: &str) -> String {
    format!("/sessions/{session_id}/turns")
}

pub(crate) fn require_id(kind: &str, id: &str) -> Result<(), AgoraError> {
    if id.trim().is_empty() {
        return Err(AgoraError::Validation(format!("{kind} id must not be empty")));
    }
    Ok(())
}

#[derive(Debug, Clone)]
/// Typed wrappers over the Agora REST endpoints. No caching happens here.
pub struct AgoraApi {
    http: HttpCore,
}

impl AgoraApi {
    pub fn new(config: AgoraClientConfig) -> Result<Self, AgoraError> {
        Ok(Self {
            http: HttpCore::new(config)?,
        })
    }

    pub(crate) fn http(&self) -> &HttpCore {
        &self.http
    }

    pub fn config(&self) -> &AgoraClientConfig {
        self.http.config()
    }

    pub async fn list_rooms(&self) -> Result<Vec<Room>, AgoraError> {
        self.http.get_json(&CacheKey::Rooms.collection_path()).await
    }

    pub async fn create_room(&self, draft: &RoomDraft) -> Result<Room, AgoraError> {
        draft.validate()?;
        self.http.post_json("/rooms", draft).await
    }

    pub async fn delete_room(&self, room_id: &str) -> Result<(), AgoraError> {
        require_id("room", room_id)?;
        self.http.delete(&format!("/rooms/{room_id}")).await
    }

    pub async fn set_room_mode(&self, room_id: &str, mode: RoomMode) -> Result<Room, AgoraError> {
        require_id("room", room_id)?;
        self.http
            .patch_json(&format!("/rooms/{room_id}/mode"), &json!({ "mode": mode }))
            .await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, AgoraError> {
        self.http.get_json(&CacheKey::Agents.collection_path()).await
    }

    pub async fn create_agent(&self, draft: &AgentDraft) -> Result<Agent, AgoraError> {
        draft.validate()?;
        self.http.post_json("/agents", draft).await
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<(), AgoraError> {
        require_id("agent", agent_id)?;
        self.http.delete(&format!("/agents/{agent_id}")).await
    }

    pub async fn list_room_agents(&self, room_id: &str) -> Result<Vec<RoomAgent>, AgoraError> {
        require_id("room", room_id)?;
        self.http
            .get_json(&CacheKey::room_agents(room_id).collection_path())
            .await
    }

    pub async fn assign_agent(
        &self,
        room_id: &str,
        draft: &RoomAgentDraft,
    ) -> Result<RoomAgent, AgoraError> {
        require_id("room", room_id)?;
        require_id("agent", &draft.agent_id)?;
        self.http
            .post_json(&format!("/rooms/{room_id}/agents"), draft)
            .await
    }

    pub async fn unassign_agent(&self, room_id: &str, agent_id: &str) -> Result<(), AgoraError> {
        require_id("room", room_id)?;
        require_id("agent", agent_id)?;
        self.http
            .delete(&format!("/rooms/{room_id}/agents/{agent_id}"))
            .await
    }

    pub async fn list_sessions(&self, room_id: &str) -> Result<Vec<Session>, AgoraError> {
        require_id("room", room_id)?;
        self.http
            .get_json(&CacheKey::room_sessions(room_id).collection_path())
            .await
    }

    pub async fn create_session(
        &self,
        room_id: &str,
        draft: &SessionDraft,
    ) -> Result<Session, AgoraError> {
        require_id("room", room_id)?;
        self.http
            .post_json(&format!("/rooms/{room_id}/sessions"), draft)
            .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), AgoraError> {
        require_id("session", session_id)?;
        self.http.delete(&format!("/sessions/{session_id}")).await
    }

    pub async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, AgoraError> {
        require_id("session", session_id)?;
        self.http
            .get_json(&CacheKey::session_messages(session_id).collection_path())
            .await
    }

    pub async fn list_turns(&self, session_id: &str) -> Result<Vec<Turn>, AgoraError> {
        require_id("session", session_id)?;
        self.http
            .get_json(&CacheKey::session_turns(session_id).collection_path())
            .await
    }

    /// Synchronous turn submission, bounded by the stream deadline.
    pub async fn submit_turn(
        &self,
        session_id: &str,
        request: &TurnRequest,
    ) -> Result<Turn, AgoraError> {
        require_id("session", session_id)?;
        request.validate()?;
        self.http
            .post_json_with_timeout(
                &sync_turn_path(session_id),
                request,
                self.config().stream_timeout_ms,
            )
            .await
    }
}

#[async_trait]
impl CollectionSource for AgoraApi {
    async fn fetch_collection(&self, key: &CacheKey) -> Result<Vec<Value>, AgoraError> {
        self.http.get_json(&key.collection_path()).await
    }
}
