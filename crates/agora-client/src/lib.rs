//! Client library for the Agora multi-agent chat service.
mod api;
mod cache;
mod client;
mod config;
mod events;
mod http;
mod mutation;
mod poll;
mod sse;
mod transport;
mod types;

pub use api::AgoraApi;
pub use cache::{CacheKey, QueryCache, ReadOutcome, ReadTicket};
pub use client::AgoraClient;
pub use config::{
    AgoraClientConfig, DEFAULT_POLL_INTERVAL_MS, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_STREAM_TIMEOUT_MS,
};
pub use events::{EventInterpreter, RoundMarkerKind, StreamEvent, TurnAccumulator, TurnDone};
pub use http::{extract_error_detail, is_temporary_id, REQUEST_ID_HEADER};
pub use mutation::{
    optimistic_placeholder, refresh_collection, CollectionSource, MutationCoordinator,
    MutationTransaction, OptimisticChange,
};
pub use poll::{MessagePoller, PollerHandle};
pub use sse::{decode_frames, flush_frames, FrameDecoder, RawFrame};
pub use transport::{
    StreamEventHandler, TurnDelivery, TurnOutcome, TurnPhase, TurnRegistry, TurnStream,
    TurnTransport, TurnUpdate,
};
pub use types::{
    Agent, AgentDraft, AgoraError, Message, MessageRole, Room, RoomAgent, RoomAgentDraft,
    RoomDraft, RoomMode, Session, SessionDraft, Turn, TurnRequest,
};
