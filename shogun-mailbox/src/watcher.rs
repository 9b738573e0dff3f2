//! Crash-safe mailbox watcher.
//!
//! Two-phase file queue with a monotonic ledger:
//!
//! 1. **Claim**: a file observed in `message_to/` is renamed to the
//!    mirror path under `message_processing/`. No other side effect.
//! 2. **Process**: a file observed in `message_processing/` is read,
//!    parsed, appended to history, handed to the application handler,
//!    and archived. Every step is gated on the ledger, so repeating
//!    the sequence after a crash repeats no completed work.
//!
//! A handler error leaves the file in the processing tier and the
//! ledger at `history`; the startup recovery scan re-delivers it.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{EventKind, RecursiveMode, Watcher as _};
use shogun_core::types::Message;
use shogun_store::{HistoryStore, Ledger, LedgerStatus, StateStore};
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::MailboxError;
use crate::paths::{parse_tier_path, MailboxAddress, Tier};
use crate::stem::parse_stem;

/// Environment toggle forcing polling mode.
pub const FORCE_POLL_ENV: &str = "SHOGUN_FORCE_POLL";

/// Application-side message handler.
///
/// Returning `Err` marks the delivery as incomplete: the ledger stays
/// below `job_done` and the file is re-processed on the next startup.
#[async_trait]
pub trait MailboxHandler: Send + Sync {
    async fn handle(
        &self,
        message: Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Watcher tuning. The defaults match the production cadence; tests
/// shrink the intervals.
#[derive(Debug, Clone)]
pub struct MailboxWatcherConfig {
    /// Mailbox base directory.
    pub root: PathBuf,
    /// Archive root (`history/{threadId}/...` lands here).
    pub history_root: PathBuf,
    /// Poll instead of native filesystem events.
    pub force_poll: bool,
    /// Scan cadence in polling mode.
    pub poll_interval: Duration,
    /// How long a file's (mtime, size) must hold still before it is
    /// read.
    pub stability_threshold: Duration,
    /// Re-stat cadence while waiting for stability.
    pub stability_poll: Duration,
}

impl MailboxWatcherConfig {
    pub fn new(root: impl Into<PathBuf>, history_root: impl Into<PathBuf>) -> Self {
        let force_poll = std::env::var(FORCE_POLL_ENV)
            .map(|v| v == "1")
            .unwrap_or(false);
        Self {
            root: root.into(),
            history_root: history_root.into(),
            force_poll,
            poll_interval: Duration::from_millis(50),
            stability_threshold: Duration::from_millis(200),
            stability_poll: Duration::from_millis(50),
        }
    }

    /// Polling mode with near-zero latencies, for tests.
    pub fn for_tests(root: impl Into<PathBuf>, history_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            history_root: history_root.into(),
            force_poll: true,
            poll_interval: Duration::from_millis(10),
            stability_threshold: Duration::ZERO,
            stability_poll: Duration::from_millis(5),
        }
    }
}

struct WatcherInner {
    config: MailboxWatcherConfig,
    ledger: Arc<Ledger>,
    history: Arc<HistoryStore>,
    state: Arc<StateStore>,
    handler: Arc<dyn MailboxHandler>,
    inflight: StdMutex<HashSet<PathBuf>>,
}

/// Running watcher; dropping it without [`shutdown`] leaves the
/// background tasks to die with the runtime.
///
/// [`shutdown`]: MailboxWatcher::shutdown
pub struct MailboxWatcher {
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _fs_watcher: Option<notify::RecommendedWatcher>,
}

impl MailboxWatcher {
    /// Create the directory skeleton, run the recovery scan, and start
    /// observing both tiers.
    pub async fn spawn(
        config: MailboxWatcherConfig,
        ledger: Arc<Ledger>,
        history: Arc<HistoryStore>,
        state: Arc<StateStore>,
        handler: Arc<dyn MailboxHandler>,
    ) -> Result<Self, MailboxError> {
        for tier in [Tier::Pending, Tier::Processing] {
            fs::create_dir_all(config.root.join(tier.segment())).await?;
        }
        fs::create_dir_all(&config.history_root).await?;

        let inner = Arc::new(WatcherInner {
            config: config.clone(),
            ledger,
            history,
            state,
            handler,
            inflight: StdMutex::new(HashSet::new()),
        });

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let fs_watcher = if config.force_poll {
            tasks.push(tokio::spawn(poll_loop(
                inner.clone(),
                tx.clone(),
                cancel.clone(),
            )));
            None
        } else {
            // Native events, with one synthetic event per existing
            // file so work interrupted by a crash resumes.
            scan_and_send(&inner.config.root, &tx).await;
            Some(spawn_native_watcher(&config.root, tx.clone())?)
        };

        tasks.push(tokio::spawn(dispatch_loop(inner, rx, cancel.clone())));

        Ok(Self {
            cancel,
            tasks,
            _fs_watcher: fs_watcher,
        })
    }

    /// Stop observing. In-flight file tasks run to completion on the
    /// runtime; the ledger makes any interruption safe.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn spawn_native_watcher(
    root: &Path,
    tx: mpsc::UnboundedSender<PathBuf>,
) -> Result<notify::RecommendedWatcher, notify::Error> {
    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "mailbox filesystem watcher error");
            }
        })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

async fn dispatch_loop(
    inner: Arc<WatcherInner>,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(path) => path,
                None => break,
            },
        };

        let Some(addr) = parse_tier_path(&inner.config.root, &path) else {
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                tracing::warn!(path = %path.display(), "ignoring file outside the mailbox grammar");
            }
            continue;
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            match addr.tier {
                Tier::Pending => inner.claim_and_process(addr).await,
                Tier::Processing => inner.process(addr).await,
            }
        });
    }
}

/// Polling observer: the first scan doubles as the startup recovery
/// pass, subsequent scans emit only new or rewritten files.
async fn poll_loop(
    inner: Arc<WatcherInner>,
    tx: mpsc::UnboundedSender<PathBuf>,
    cancel: CancellationToken,
) {
    let mut seen: HashMap<PathBuf, SystemTime> = HashMap::new();
    loop {
        let mut found = Vec::new();
        for tier in [Tier::Pending, Tier::Processing] {
            collect_files(&inner.config.root.join(tier.segment()), &mut found).await;
        }

        let live: HashSet<PathBuf> = found.iter().map(|(p, _)| p.clone()).collect();
        seen.retain(|path, _| live.contains(path));

        for (path, mtime) in found {
            if seen.get(&path) != Some(&mtime) {
                seen.insert(path.clone(), mtime);
                let _ = tx.send(path);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }
}

async fn scan_and_send(root: &Path, tx: &mpsc::UnboundedSender<PathBuf>) {
    let mut found = Vec::new();
    for tier in [Tier::Pending, Tier::Processing] {
        collect_files(&root.join(tier.segment()), &mut found).await;
    }
    for (path, _) in found {
        let _ = tx.send(path);
    }
}

/// Walk `dir` collecting every regular file with its mtime.
async fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, SystemTime)>) {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => stack.push(path),
                Ok(ft) if ft.is_file() => {
                    if let Ok(meta) = entry.metadata().await {
                        if let Ok(mtime) = meta.modified() {
                            out.push((path, mtime));
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl WatcherInner {
    /// Claim phase: rename pending → processing. `ENOENT` means
    /// another actor already claimed; nothing else happens here.
    async fn claim_and_process(self: Arc<Self>, mut addr: MailboxAddress) {
        let pending = addr.tier_path_under(&self.config.root, Tier::Pending);
        if self.wait_for_stable(&pending).await.is_none() {
            return;
        }

        let processing = addr.tier_path_under(&self.config.root, Tier::Processing);
        if let Some(parent) = processing.parent() {
            if let Err(err) = fs::create_dir_all(parent).await {
                tracing::warn!(path = %processing.display(), error = %err, "failed to prepare processing dir");
                return;
            }
        }
        match fs::rename(&pending, &processing).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!(path = %pending.display(), error = %err, "claim rename failed");
                return;
            }
        }

        addr.tier = Tier::Processing;
        self.process(addr).await;
    }

    /// Process phase, deduplicated per absolute path.
    async fn process(self: Arc<Self>, addr: MailboxAddress) {
        let path = addr.tier_path_under(&self.config.root, Tier::Processing);
        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            if !inflight.insert(path.clone()) {
                return;
            }
        }

        let result = self.process_inner(&addr, &path).await;

        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(&path);

        if let Err(err) = result {
            tracing::error!(
                message_id = %addr.stem,
                path = %path.display(),
                error = %err,
                "mailbox processing failed; file left for retry"
            );
        }
    }

    async fn process_inner(
        &self,
        addr: &MailboxAddress,
        path: &Path,
    ) -> Result<(), MailboxError> {
        // A vanished file was claimed or archived by someone else.
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let created_at: DateTime<Utc> = meta
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());

        let body = match fs::read_to_string(path).await {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let parsed = parse_stem(&addr.stem);
        let thread_id = match parsed.thread_id {
            Some(thread_id) => thread_id,
            None => match self.state.last_active_thread().await {
                Some(thread_id) => thread_id,
                None => {
                    tracing::warn!(
                        message_id = %addr.stem,
                        "filename has no thread id and no thread is active"
                    );
                    return Ok(());
                }
            },
        };

        let message = Message {
            id: addr.stem.clone(),
            thread_id: thread_id.clone(),
            from: addr.from,
            to: addr.to,
            title: parsed.title,
            body,
            created_at,
        };
        let key = addr.ledger_key();

        if !self.ledger.reached(&key, LedgerStatus::History).await {
            self.history.append(&message).await?;
            self.ledger.mark(&key, LedgerStatus::History).await?;
        }

        if !self.ledger.reached(&key, LedgerStatus::JobDone).await {
            self.handler
                .handle(message)
                .await
                .map_err(|err| MailboxError::Handler(err.to_string()))?;
            self.ledger.mark(&key, LedgerStatus::JobDone).await?;
        }

        let archive = addr.archive_path(&self.config.history_root, &thread_id);
        if let Some(parent) = archive.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::try_exists(&archive).await.unwrap_or(false) {
            // Crash landed between the ledger write and the archive
            // rename on a previous run; the copy in the archive wins.
            let _ = fs::remove_file(path).await;
        } else {
            match fs::rename(path, &archive).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.ledger.mark(&key, LedgerStatus::Done).await?;
        Ok(())
    }

    /// Gate on write-finish: (mtime, size) must hold still for the
    /// configured threshold. `None` means the file vanished.
    async fn wait_for_stable(&self, path: &Path) -> Option<std::fs::Metadata> {
        let mut last: Option<(u64, SystemTime)> = None;
        let mut stable_for = Duration::ZERO;
        loop {
            let meta = fs::metadata(path).await.ok()?;
            let sig = (meta.len(), meta.modified().ok()?);
            if last == Some(sig) {
                stable_for += self.config.stability_poll;
            } else {
                last = Some(sig);
                stable_for = Duration::ZERO;
            }
            if stable_for >= self.config.stability_threshold {
                return Some(meta);
            }
            tokio::time::sleep(self.config.stability_poll).await;
        }
    }
}
