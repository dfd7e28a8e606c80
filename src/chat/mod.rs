//! チャット機能
//!
//! メッセージモデル、ストリーム制御、再実行、サービス本体。

pub mod events;
pub mod models;
pub mod rewinder;
pub mod service;
pub mod stream_controller;
pub mod ticker;

pub use events::{ChatBroadcaster, ChatEvent, TurnReport};
pub use models::{
    AssistantMessage, ChatMessage, ChatSession, MessageRole, SessionMetadata, SystemMessage,
    UserMessage,
};
pub use rewinder::{RewindPlan, RollbackReference};
pub use service::{ChatContext, ChatService, StreamControl, StreamControlHandle};
pub use stream_controller::{
    ChunkOutcome, StreamController, StreamPhase, StreamSnapshot, StreamState, TerminalChunk,
    TurnContext,
};
pub use ticker::FlushTicker;
