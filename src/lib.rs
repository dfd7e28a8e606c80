pub mod api;
pub mod chat;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod logging;

// Re-export the main error types for convenience
pub use error::{TabchatError, TabchatResult};
pub use api::TransportError;
pub use database::StorageError;

// Re-export the transport layer
pub use api::{
    ChunkData, MessageChannel, StreamEvent, StreamId, Transport, TransportRequest,
    TransportResponse,
};
#[cfg(any(test, feature = "testing"))]
pub use api::{ScriptedCoordinator, StreamScript};

// Re-export chat modules
pub use chat::{ChatContext, ChatEvent, ChatMessage, ChatService, ChatSession, StreamPhase};

// Re-export persistence
pub use database::{open_storage, ChatSessionStore, MemoryStorage, SqliteStorage, StorageBackend};

// Re-export token accounting
pub use ledger::{
    calculate_context_status, calculate_cost, estimate_tokens, ContextStatus, RateCard,
    TokenLedger, TokenStatistics, WarningLevel,
};

pub use config::{AppConfig, ConfigManager};
pub use logging::init_logging;
