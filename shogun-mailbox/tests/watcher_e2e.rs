//! End-to-end mailbox watcher tests: claim, process, archive, and
//! crash recovery, all in polling mode against a temp directory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use shogun_core::types::{AgentId, Message};
use shogun_mailbox::{
    MailboxHandler, MailboxWatcher, MailboxWatcherConfig, MessageWriter, Tier,
};
use shogun_store::{HistoryStore, Ledger, LedgerStatus, StateStore};

struct RecordingHandler {
    seen: Mutex<Vec<Message>>,
    attempts: Mutex<u32>,
    fail: AtomicBool,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
            fail: AtomicBool::new(false),
        })
    }

    fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }

    fn attempts(&self) -> u32 {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl MailboxHandler for RecordingHandler {
    async fn handle(
        &self,
        message: Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        *self.attempts.lock().unwrap() += 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err("handler rejected the message".into());
        }
        self.seen.lock().unwrap().push(message);
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    history_root: std::path::PathBuf,
    ledger: Arc<Ledger>,
    history: Arc<HistoryStore>,
    state: Arc<StateStore>,
}

async fn make_fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join(".shogun");
    let history_root = root.join("history");
    let ledger = Arc::new(
        Ledger::open(root.join("message_ledger.json"))
            .await
            .unwrap(),
    );
    let history = Arc::new(HistoryStore::new(&history_root));
    let state = Arc::new(StateStore::open(root.join("state.json")).await.unwrap());
    Fixture {
        _dir: dir,
        root,
        history_root,
        ledger,
        history,
        state,
    }
}

impl Fixture {
    async fn spawn_watcher(&self, handler: Arc<RecordingHandler>) -> MailboxWatcher {
        MailboxWatcher::spawn(
            MailboxWatcherConfig::for_tests(&self.root, &self.history_root),
            self.ledger.clone(),
            self.history.clone(),
            self.state.clone(),
            handler,
        )
        .await
        .unwrap()
    }
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn wait_for_ledger(ledger: &Ledger, key: &str, status: LedgerStatus) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if ledger.reached(key, status).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    ledger.reached(key, status).await
}

async fn dir_md_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
                found.push(path);
            }
        }
    }
    found
}

#[tokio::test]
async fn test_pending_file_is_delivered_and_archived() {
    let fixture = make_fixture().await;
    let handler = RecordingHandler::new();
    let watcher = fixture.spawn_watcher(handler.clone()).await;

    let writer = MessageWriter::new(&fixture.root);
    let path = writer
        .write("t1", &AgentId::King, &AgentId::Shogun, "task", "調査して")
        .await
        .unwrap();
    let stem = path.file_stem().unwrap().to_str().unwrap().to_string();

    assert!(
        wait_until(Duration::from_secs(5), || handler.seen().len() == 1).await,
        "message never reached the handler"
    );

    let seen = handler.seen();
    assert_eq!(seen[0].id, stem);
    assert_eq!(seen[0].thread_id, "t1");
    assert_eq!(seen[0].from, AgentId::King);
    assert_eq!(seen[0].to, AgentId::Shogun);
    assert_eq!(seen[0].body, "調査して");

    // Archived out of both queue tiers...
    let key = format!("message_to/shogun/from/king/{stem}.md");
    assert!(wait_for_ledger(&fixture.ledger, &key, LedgerStatus::Done).await);
    assert!(dir_md_files(&fixture.root.join("message_to")).await.is_empty());
    assert!(dir_md_files(&fixture.root.join("message_processing"))
        .await
        .is_empty());

    // ...into history/{threadId}/message_to/...
    let archive = fixture
        .history_root
        .join("t1/message_to/shogun/from/king")
        .join(format!("{stem}.md"));
    assert!(tokio::fs::try_exists(&archive).await.unwrap());

    // History JSONL carries the message.
    let listed = fixture.history.list("t1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, stem);

    watcher.shutdown().await;
}

#[tokio::test]
async fn test_processing_tier_recovered_on_startup() {
    let fixture = make_fixture().await;

    // A file stranded mid-flight by a crash.
    let stranded = fixture
        .root
        .join("message_processing/karou/from/shogun/t9__2025-01-01T00-00-00-000Z-abc123__sub.md");
    tokio::fs::create_dir_all(stranded.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&stranded, "stranded work").await.unwrap();

    let handler = RecordingHandler::new();
    let watcher = fixture.spawn_watcher(handler.clone()).await;

    assert!(wait_until(Duration::from_secs(5), || handler.seen().len() == 1).await);
    let seen = handler.seen();
    assert_eq!(seen[0].thread_id, "t9");
    assert_eq!(seen[0].title, "sub");
    assert_eq!(seen[0].body, "stranded work");

    watcher.shutdown().await;
}

#[tokio::test]
async fn test_history_not_duplicated_after_partial_crash() {
    let fixture = make_fixture().await;

    // Simulate a crash after the history append but before the
    // handler: history holds the message, ledger says `history`, and
    // the file still sits in the processing tier.
    let stem = "t5__2025-01-01T00-00-00-000Z-abc123__task";
    let stranded = fixture
        .root
        .join("message_processing/shogun/from/king")
        .join(format!("{stem}.md"));
    tokio::fs::create_dir_all(stranded.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&stranded, "body").await.unwrap();

    let meta = tokio::fs::metadata(&stranded).await.unwrap();
    let message = Message {
        id: stem.to_string(),
        thread_id: "t5".to_string(),
        from: AgentId::King,
        to: AgentId::Shogun,
        title: "task".to_string(),
        body: "body".to_string(),
        created_at: meta.modified().unwrap().into(),
    };
    fixture.history.append(&message).await.unwrap();
    let key = format!("message_to/shogun/from/king/{stem}.md");
    fixture
        .ledger
        .mark(&key, LedgerStatus::History)
        .await
        .unwrap();

    let handler = RecordingHandler::new();
    let watcher = fixture.spawn_watcher(handler.clone()).await;

    assert!(wait_until(Duration::from_secs(5), || handler.attempts() == 1).await);
    assert!(wait_for_ledger(&fixture.ledger, &key, LedgerStatus::Done).await);

    // Exactly one handler invocation, exactly one history entry.
    assert_eq!(handler.attempts(), 1);
    let listed = fixture.history.list("t5").await.unwrap();
    assert_eq!(listed.len(), 1);

    watcher.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_leaves_file_for_retry() {
    let fixture = make_fixture().await;
    let handler = RecordingHandler::new();
    handler.fail.store(true, Ordering::SeqCst);

    let watcher = fixture.spawn_watcher(handler.clone()).await;

    let writer = MessageWriter::new(&fixture.root);
    writer
        .write("t1", &AgentId::King, &AgentId::Shogun, "doomed", "x")
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || handler.attempts() >= 1).await);
    watcher.shutdown().await;

    // The file survived in processing; the ledger stopped at history.
    let processing = dir_md_files(&fixture.root.join("message_processing")).await;
    assert_eq!(processing.len(), 1);
    let stem = processing[0].file_stem().unwrap().to_str().unwrap();
    let key = format!("message_to/shogun/from/king/{stem}.md");
    assert_eq!(
        fixture.ledger.status(&key).await,
        Some(LedgerStatus::History)
    );

    // A new watcher (fresh process) retries and succeeds.
    handler.fail.store(false, Ordering::SeqCst);
    let watcher = fixture.spawn_watcher(handler.clone()).await;
    assert!(wait_until(Duration::from_secs(5), || handler.seen().len() == 1).await);
    watcher.shutdown().await;

    // History still holds a single entry: the append from the failed
    // round was not repeated.
    let listed = fixture.history.list("t1").await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_files_outside_grammar_are_ignored() {
    let fixture = make_fixture().await;
    let handler = RecordingHandler::new();
    let watcher = fixture.spawn_watcher(handler.clone()).await;

    let bad = fixture.root.join("message_to/wizard/from/king/x.md");
    tokio::fs::create_dir_all(bad.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&bad, "nope").await.unwrap();

    let wrong_depth = fixture.root.join("message_to/shogun/x.md");
    tokio::fs::create_dir_all(wrong_depth.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&wrong_depth, "nope").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handler.seen().is_empty());
    assert!(tokio::fs::try_exists(&bad).await.unwrap());

    watcher.shutdown().await;
}

#[tokio::test]
async fn test_missing_thread_id_falls_back_to_last_active() {
    let fixture = make_fixture().await;
    let thread = fixture.state.create_thread("active work").await.unwrap();

    let handler = RecordingHandler::new();
    let watcher = fixture.spawn_watcher(handler.clone()).await;

    // Single-token stem: no thread id in the filename.
    let orphan = fixture.root.join("message_to/shogun/from/king/quick-note.md");
    tokio::fs::create_dir_all(orphan.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&orphan, "untagged").await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || handler.seen().len() == 1).await);
    let seen = handler.seen();
    assert_eq!(seen[0].thread_id, thread.id);
    assert_eq!(seen[0].title, "quick-note");

    watcher.shutdown().await;
}

#[tokio::test]
async fn test_tier_enum_segments() {
    assert_eq!(Tier::Pending.segment(), "message_to");
    assert_eq!(Tier::Processing.segment(), "message_processing");
}
