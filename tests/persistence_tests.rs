//! 永続化テスト
//!
//! 保存失敗時に最後に保存された状態へ戻ること、
//! SQLiteバックエンドでセッションと統計が再起動後も残ることを確認する。

use std::sync::Arc;
use tabchat::api::{actions, ChannelError, ScriptedCoordinator, StreamScript};
use tabchat::chat::{ChatContext, ChatEvent, ChatMessage, ChatService};
use tabchat::{
    ChatSessionStore, MemoryStorage, RateCard, SqliteStorage, StorageBackend, StorageError,
    TabchatError, Transport,
};
use tempfile::tempdir;

fn context() -> ChatContext {
    ChatContext {
        platform_id: Some("anthropic".to_string()),
        model_id: Some("claude-sonnet".to_string()),
        has_credentials: true,
        rate_card: Some(RateCard::new(3.0, 15.0)),
        context_window: Some(200_000),
        ..Default::default()
    }
}

fn service_on(
    storage: Arc<dyn StorageBackend>,
) -> (ChatService<Arc<ScriptedCoordinator>>, Arc<ScriptedCoordinator>) {
    let (coordinator, receiver) = ScriptedCoordinator::new();
    let coordinator = Arc::new(coordinator);
    let service = ChatService::new(
        Transport::new(coordinator.clone()),
        receiver,
        storage,
        context(),
    );
    (service, coordinator)
}

#[tokio::test]
async fn test_quota_failure_before_send_reloads_last_saved_state() {
    let storage = Arc::new(MemoryStorage::new());
    let (mut service, coordinator) = service_on(storage.clone());
    service.new_chat("tab-1").unwrap();
    coordinator.enqueue_script(StreamScript::completing(&["Hello"], None));

    service.send("Hi").await.unwrap();
    service.run_stream().await.unwrap();
    let saved = service.session().messages.clone();

    storage.set_quota(Some(storage.used_bytes()));
    let mut events = service.subscribe();

    let err = service.send("Tell me more").await.unwrap_err();

    assert!(matches!(
        err,
        TabchatError::Storage(StorageError::QuotaExceeded { .. })
    ));
    assert_eq!(service.session().messages, saved);
    assert!(!service.is_streaming());
    assert_eq!(
        coordinator
            .requests_with_action(actions::SEND_CHAT_MESSAGE)
            .len(),
        1
    );

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ChatEvent::PersistenceFailed { .. }) {
            saw_failure = true;
        }
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn test_quota_failure_at_turn_end_leaves_consistent_session() {
    let storage = Arc::new(MemoryStorage::new());
    let (mut service, coordinator) = service_on(storage.clone());
    coordinator.enqueue_script(StreamScript::completing(&["A fairly long answer"], None));

    service.send("Hi").await.unwrap();
    storage.set_quota(Some(storage.used_bytes()));

    let err = service.run_stream().await.unwrap_err();

    assert!(matches!(err, TabchatError::Storage(_)));
    assert!(!service.is_streaming());
    // 読み直した状態にストリーミング中のメッセージは残らない
    assert_eq!(service.session().messages.len(), 2);
    assert_eq!(service.session().streaming_count(), 0);

    // 容量が戻れば続けられる
    storage.set_quota(None);
    coordinator.enqueue_script(StreamScript::completing(&["ok"], None));
    service.send("Retry").await.unwrap();
    assert!(service.run_stream().await.unwrap().is_some());
}

#[tokio::test]
async fn test_sqlite_backed_session_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("tabchat.db");

    let session_id = {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(&db_path).unwrap());
        let (mut service, coordinator) = service_on(storage);
        coordinator.enqueue_script(StreamScript::completing(&["Persisted ", "answer"], None));

        service.send("Remember me").await.unwrap();
        service.run_stream().await.unwrap();
        service.session().id().to_string()
    };

    let storage: Arc<dyn StorageBackend> = Arc::new(SqliteStorage::new(&db_path).unwrap());
    let (mut service, _) = service_on(storage.clone());

    assert!(service.load_session(&session_id).unwrap());
    let messages = &service.session().messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content(), "Remember me");
    assert_eq!(messages[1].content(), "Persisted answer");

    let stats = service.statistics().unwrap();
    assert!(stats.is_calculated);
    assert!(stats.accumulated_cost > 0.0);

    let store = ChatSessionStore::new(storage);
    assert_eq!(store.list_session_ids().unwrap(), vec![session_id]);
}

#[tokio::test]
async fn test_clear_conversation_removes_record_and_statistics() {
    let storage = Arc::new(MemoryStorage::new());
    let (mut service, coordinator) = service_on(storage.clone());
    coordinator.enqueue_script(StreamScript::completing(&["Hello"], None));
    service.send("Hi").await.unwrap();
    service.run_stream().await.unwrap();
    let session_id = service.session().id().to_string();

    service.clear_conversation().unwrap();

    assert!(service.session().is_empty());
    assert!(!service.statistics().unwrap().is_calculated);
    let store = ChatSessionStore::new(storage);
    assert!(store.load(&session_id).unwrap().is_none());
    assert!(store.list_session_ids().unwrap().is_empty());
}

#[tokio::test]
async fn test_load_unknown_session_starts_empty() {
    let (mut service, _) = service_on(Arc::new(MemoryStorage::new()));

    assert!(!service.load_session("never-saved").unwrap());
    assert_eq!(service.session().id(), "never-saved");
    assert!(service.session().is_empty());
}

#[tokio::test]
async fn test_invalidated_context_leaves_no_blank_turn_in_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let (mut service, coordinator) = service_on(storage.clone());
    coordinator.fail_next(1, ChannelError::ContextInvalidated);

    assert!(service.send("Hi").await.unwrap().is_none());

    let messages = &service.session().messages;
    assert_eq!(messages.len(), 1);
    assert!(matches!(messages[0], ChatMessage::User(_)));

    // 別の画面が読み直しても空のアシスタントは見えない
    let persisted = ChatSessionStore::new(storage)
        .load(service.session().id())
        .unwrap()
        .unwrap();
    assert_eq!(&persisted.messages, messages);
    assert_eq!(persisted.streaming_count(), 0);
}
