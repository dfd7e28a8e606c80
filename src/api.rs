#[cfg(any(test, feature = "testing"))]
pub mod coordinator; // インプロセスのバックエンドコーディネーター（テスト用）
pub mod protocol; // リクエスト・ストリームチャンクの型
pub mod transport; // リトライ付きTransport

#[cfg(any(test, feature = "testing"))]
pub use coordinator::{ScriptedCoordinator, StreamScript};
pub use protocol::{
    actions, ChunkData, HistoryEntry, StreamEvent, StreamId, TransportRequest, TransportResponse,
};
pub use transport::{ChannelError, MessageChannel, RetryConfig, Transport, TransportError};
