//! End-to-end runs of the engine against the concrete stores and the
//! in-process broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use runloop_core::agent::{Agent, AgentEngine, AgentInput, EngineConfig};
use runloop_core::conversation::{
    BoxSummarizer, ConversationRunManager, LlmSummarizer, SummarizationPolicy,
};
use runloop_core::llm::{ChunkStream, LlmProvider};
use runloop_core::repository::ConversationPersistence;
use runloop_core::stream::{InProcessBroker, StreamBroker, forward_to_broker};
use runloop_infra::memory::InMemoryConversationStore;
use runloop_infra::sqlite::{DatabasePool, SqliteConversationStore};
use runloop_types::agent::AgentStatus;
use runloop_types::chunk::{Chunk, OutputContent, OutputItem};
use runloop_types::llm::{LlmRequest, Usage};
use runloop_types::message::{Message, Meta};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Answers every request with `reply {n}`.
#[derive(Default)]
struct CountingLlm {
    calls: AtomicUsize,
}

impl LlmProvider for CountingLlm {
    fn name(&self) -> &str {
        "counting"
    }

    fn stream(&self, _request: LlmRequest) -> ChunkStream {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let chunks = vec![
            Chunk::ResponseCreated {
                response_id: format!("resp_{n}"),
            },
            Chunk::OutputItemDone {
                output_index: 0,
                item: OutputItem::Message {
                    id: format!("item_{n}"),
                    content: vec![OutputContent::OutputText {
                        text: format!("reply {n}"),
                    }],
                },
            },
            Chunk::ResponseCompleted {
                response_id: format!("resp_{n}"),
                usage: Usage::new(10, 5),
            },
        ];
        Box::pin(futures_util::stream::iter(chunks.into_iter().map(Ok)))
    }
}

fn agent() -> Arc<Agent> {
    Arc::new(Agent::new("assistant", "test-model", Arc::new(CountingLlm::default())))
}

fn texts(messages: &[Message]) -> Vec<String> {
    messages.iter().map(Message::to_text).collect()
}

async fn branching_scenario<P: ConversationPersistence + 'static>(store: Arc<P>) {
    let engine = AgentEngine::new(Arc::clone(&store), EngineConfig::default());
    let agent = agent();
    let cancel = CancellationToken::new();

    let first = engine
        .execute(agent.clone(), AgentInput::new("ns", vec![Message::user("one")]), &cancel)
        .await
        .unwrap();
    assert_eq!(first.status, AgentStatus::Completed);

    let second = engine
        .execute(
            agent.clone(),
            AgentInput::new("ns", vec![Message::user("two")]).continuing(&first.run_id),
            &cancel,
        )
        .await
        .unwrap();

    // Continuing from the first run again forks the thread.
    let branch = engine
        .execute(
            agent.clone(),
            AgentInput::new("ns", vec![Message::user("two, differently")]).continuing(&first.run_id),
            &cancel,
        )
        .await
        .unwrap();

    let main = store.load_messages("ns", Some(&second.run_id)).await.unwrap();
    let forked = store.load_messages("ns", Some(&branch.run_id)).await.unwrap();

    let main_texts: Vec<String> = main.records.iter().flat_map(|r| texts(&r.messages)).collect();
    let forked_texts: Vec<String> = forked.records.iter().flat_map(|r| texts(&r.messages)).collect();
    assert_eq!(
        main_texts,
        vec!["user: one", "assistant: reply 1", "user: two", "assistant: reply 2"]
    );
    assert_eq!(
        forked_texts,
        vec![
            "user: one",
            "assistant: reply 1",
            "user: two, differently",
            "assistant: reply 3",
        ]
    );
    assert_ne!(main.records[1].thread_id, forked.records[1].thread_id);
    assert_eq!(main.records[0].message_id, forked.records[0].message_id);
}

#[tokio::test]
async fn test_branching_with_in_memory_store() {
    branching_scenario(Arc::new(InMemoryConversationStore::new())).await;
}

#[tokio::test]
async fn test_branching_with_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("runloop.db").display());
    let pool = DatabasePool::new(&url).await.unwrap();
    branching_scenario(Arc::new(SqliteConversationStore::new(pool))).await;
}

/// Two compactions in one run that forked a branch both land on the branch.
async fn compaction_on_branch_scenario<P: ConversationPersistence + 'static>(store: Arc<P>) {
    let meta = Meta::new();
    store
        .save_messages("ns", "r1", None, "conv_1", &[Message::user("one")], &meta)
        .await
        .unwrap();
    let main_thread = store
        .save_messages("ns", "r2", Some("r1"), "conv_1", &[Message::user("two")], &meta)
        .await
        .unwrap();
    store
        .save_messages("ns", "r3", Some("r2"), "conv_1", &[Message::user("three")], &meta)
        .await
        .unwrap();

    let summarizer = BoxSummarizer::new(LlmSummarizer::new(
        Arc::new(CountingLlm::default()),
        "summary-model",
        SummarizationPolicy {
            token_threshold: 5,
            keep_recent_runs: 1,
        },
    ));
    let mut manager = ConversationRunManager::new_run(
        Arc::clone(&store),
        Some(summarizer),
        "ns",
        Some("r2"),
        vec![Message::user("two, again")],
    )
    .await
    .unwrap();
    let run_id = manager.run_id().to_string();
    assert_eq!(manager.thread_id(), Some(main_thread.as_str()));

    // First compaction folds r1; the save forks off r2.
    manager.add_messages(vec![], Some(Usage::new(10, 0)));
    let context = manager.get_messages().await;
    assert!(context[0].to_text().contains("reply 1"));
    manager.add_messages(vec![Message::assistant("out_1", "first answer")], None);
    manager.save_messages(Meta::new()).await.unwrap();
    let branch_thread = manager.thread_id().unwrap().to_string();
    assert_ne!(branch_thread, main_thread);

    // Second compaction folds r2.
    manager.add_messages(vec![], Some(Usage::new(10, 0)));
    let context = manager.get_messages().await;
    assert!(context[0].to_text().contains("reply 2"));
    manager.run_state_mut().transition_to_complete().unwrap();
    manager.save_messages(Meta::new()).await.unwrap();

    let branch = store.load_messages("ns", Some(&run_id)).await.unwrap();
    let summary = branch.summary.unwrap();
    assert_eq!(summary.thread_id, branch_thread);
    assert_eq!(summary.last_summarized_message_id, "r2");
    assert!(summary.summary_message.to_text().contains("reply 2"));
    assert_eq!(branch.records.len(), 1);
    assert_eq!(branch.records[0].message_id, run_id);

    // The thread the run branched from never saw either summary.
    let main = store.load_messages("ns", Some("r3")).await.unwrap();
    assert!(main.summary.is_none());
    assert_eq!(main.records.len(), 3);
}

#[tokio::test]
async fn test_compaction_on_branch_with_in_memory_store() {
    compaction_on_branch_scenario(Arc::new(InMemoryConversationStore::new())).await;
}

#[tokio::test]
async fn test_compaction_on_branch_with_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("runloop.db").display());
    let pool = DatabasePool::new(&url).await.unwrap();
    compaction_on_branch_scenario(Arc::new(SqliteConversationStore::new(pool))).await;
}

#[tokio::test]
async fn test_run_stream_reaches_broker_subscriber() {
    let store = Arc::new(InMemoryConversationStore::new());
    let engine = AgentEngine::new(store, EngineConfig::default());
    let broker = InProcessBroker::default();
    let (tx, mut rx) = mpsc::channel::<Chunk>(64);

    let run = tokio::spawn(async move {
        engine
            .execute(
                agent(),
                AgentInput::new("ns", vec![Message::user("Hello!")]).with_callback(tx),
                &CancellationToken::new(),
            )
            .await
    });

    // Hold the first chunk until the subscriber is in place.
    let first = rx.recv().await.unwrap();
    let run_id = first.run_event().unwrap().run_id.clone();
    let mut sub = broker.subscribe(&run_id, CancellationToken::new()).await.unwrap();

    let (relay_tx, relay_rx) = mpsc::channel(64);
    relay_tx.send(first).await.unwrap();
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if relay_tx.send(chunk).await.is_err() {
                break;
            }
        }
    });
    let forward_broker = broker.clone();
    let forwarder = tokio::spawn(async move { forward_to_broker(&forward_broker, relay_rx).await });

    let mut received = Vec::new();
    while let Some(chunk) = sub.recv().await {
        received.push(chunk.event_type().to_string());
    }
    assert_eq!(received.first().map(String::as_str), Some("run.created"));
    assert_eq!(received.last().map(String::as_str), Some("run.completed"));

    let output = run.await.unwrap().unwrap();
    assert_eq!(output.run_id, run_id);
    assert_eq!(forwarder.await.unwrap().as_deref(), Some(run_id.as_str()));

    // The key is closed now: a late subscriber gets a finished handle.
    let mut late = broker.subscribe(&run_id, CancellationToken::new()).await.unwrap();
    assert!(late.recv().await.is_none());
}
