//! Restart-request watcher.
//!
//! Same two-phase shape as the mailbox watcher, over a flat queue of
//! JSON files: `tmp/restart/requests/*.json` is claimed into
//! `tmp/restart/processing/`, handed to the restart handler, then
//! archived into `tmp/restart/history/`. A separate ledger keeps the
//! handler at-most-once per request across crashes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{EventKind, RecursiveMode, Watcher as _};
use serde::Deserialize;
use shogun_store::{Ledger, LedgerStatus};
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::MailboxError;

const REQUESTS: &str = "requests";
const PROCESSING: &str = "processing";
const HISTORY: &str = "history";

/// A parsed restart request.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartRequest {
    pub id: String,
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Optional JSON body of a request file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    requested_at: Option<DateTime<Utc>>,
}

/// Receives restart requests; expected to stop the fleet and arrange
/// process exit with the restart code.
#[async_trait]
pub trait RestartHandler: Send + Sync {
    async fn handle(
        &self,
        request: RestartRequest,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Watcher tuning; see [`MailboxWatcherConfig`] for the semantics.
///
/// [`MailboxWatcherConfig`]: crate::watcher::MailboxWatcherConfig
#[derive(Debug, Clone)]
pub struct RestartWatcherConfig {
    /// Restart queue root, conventionally `{baseDir}/tmp/restart`.
    pub dir: PathBuf,
    pub force_poll: bool,
    pub poll_interval: Duration,
    pub stability_threshold: Duration,
    pub stability_poll: Duration,
}

impl RestartWatcherConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let force_poll = std::env::var(crate::watcher::FORCE_POLL_ENV)
            .map(|v| v == "1")
            .unwrap_or(false);
        Self {
            dir: dir.into(),
            force_poll,
            poll_interval: Duration::from_millis(50),
            stability_threshold: Duration::from_millis(200),
            stability_poll: Duration::from_millis(50),
        }
    }

    pub fn for_tests(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            force_poll: true,
            poll_interval: Duration::from_millis(10),
            stability_threshold: Duration::ZERO,
            stability_poll: Duration::from_millis(5),
        }
    }
}

struct RestartInner {
    config: RestartWatcherConfig,
    ledger: Arc<Ledger>,
    handler: Arc<dyn RestartHandler>,
    inflight: StdMutex<HashSet<PathBuf>>,
}

/// Running restart watcher.
pub struct RestartWatcher {
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _fs_watcher: Option<notify::RecommendedWatcher>,
}

impl RestartWatcher {
    pub async fn spawn(
        config: RestartWatcherConfig,
        ledger: Arc<Ledger>,
        handler: Arc<dyn RestartHandler>,
    ) -> Result<Self, MailboxError> {
        for tier in [REQUESTS, PROCESSING, HISTORY] {
            fs::create_dir_all(config.dir.join(tier)).await?;
        }

        let inner = Arc::new(RestartInner {
            config: config.clone(),
            ledger,
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
            scan_and_send(&config.dir, &tx).await;
            Some(spawn_native_watcher(&config.dir, tx.clone())?)
        };

        tasks.push(tokio::spawn(dispatch_loop(inner, rx, cancel.clone())));

        Ok(Self {
            cancel,
            tasks,
            _fs_watcher: fs_watcher,
        })
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn spawn_native_watcher(
    dir: &Path,
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
                tracing::error!(error = %err, "restart filesystem watcher error");
            }
        })?;
    watcher.watch(dir, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Which queue tier a path belongs to, with its file name.
fn classify(dir: &Path, path: &Path) -> Option<(&'static str, String)> {
    let rel = path.strip_prefix(dir).ok()?;
    let mut components = rel.components();
    let tier = components.next()?.as_os_str().to_str()?;
    let file = components.next()?.as_os_str().to_str()?.to_string();
    if components.next().is_some() || !file.ends_with(".json") {
        return None;
    }
    match tier {
        REQUESTS => Some((REQUESTS, file)),
        PROCESSING => Some((PROCESSING, file)),
        _ => None,
    }
}

async fn dispatch_loop(
    inner: Arc<RestartInner>,
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

        let Some((tier, file)) = classify(&inner.config.dir, &path) else {
            continue;
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            match tier {
                REQUESTS => inner.claim_and_process(file).await,
                _ => inner.process(file).await,
            }
        });
    }
}

async fn poll_loop(
    inner: Arc<RestartInner>,
    tx: mpsc::UnboundedSender<PathBuf>,
    cancel: CancellationToken,
) {
    let mut seen: HashMap<PathBuf, SystemTime> = HashMap::new();
    loop {
        let mut found = Vec::new();
        for tier in [REQUESTS, PROCESSING] {
            collect_flat(&inner.config.dir.join(tier), &mut found).await;
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

async fn scan_and_send(dir: &Path, tx: &mpsc::UnboundedSender<PathBuf>) {
    let mut found = Vec::new();
    for tier in [REQUESTS, PROCESSING] {
        collect_flat(&dir.join(tier), &mut found).await;
    }
    for (path, _) in found {
        let _ = tx.send(path);
    }
}

async fn collect_flat(dir: &Path, out: &mut Vec<(PathBuf, SystemTime)>) {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if meta.is_file() {
                if let Ok(mtime) = meta.modified() {
                    out.push((entry.path(), mtime));
                }
            }
        }
    }
}

impl RestartInner {
    fn ledger_key(file: &str) -> String {
        format!("{REQUESTS}/{file}")
    }

    async fn claim_and_process(self: Arc<Self>, file: String) {
        let pending = self.config.dir.join(REQUESTS).join(&file);
        if self.wait_for_stable(&pending).await.is_none() {
            return;
        }
        let processing = self.config.dir.join(PROCESSING).join(&file);
        match fs::rename(&pending, &processing).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::warn!(path = %pending.display(), error = %err, "restart claim failed");
                return;
            }
        }
        self.process(file).await;
    }

    async fn process(self: Arc<Self>, file: String) {
        let path = self.config.dir.join(PROCESSING).join(&file);
        {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            if !inflight.insert(path.clone()) {
                return;
            }
        }

        let result = self.process_inner(&file, &path).await;

        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(&path);

        if let Err(err) = result {
            tracing::error!(file, error = %err, "restart request processing failed");
        }
    }

    async fn process_inner(&self, file: &str, path: &Path) -> Result<(), MailboxError> {
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        // Non-JSON bodies are malformed input, not fatal: fall back to
        // the filename and mtime.
        let body: RequestBody = serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!(file, error = %err, "restart request body is not JSON");
            RequestBody::default()
        });
        let stem = file.strip_suffix(".json").unwrap_or(file);
        let request = RestartRequest {
            id: body.id.unwrap_or_else(|| stem.to_string()),
            reason: body.reason,
            requested_at: body.requested_at.unwrap_or_else(|| {
                meta.modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now())
            }),
        };

        let key = Self::ledger_key(file);
        if !self.ledger.reached(&key, LedgerStatus::JobDone).await {
            self.handler
                .handle(request)
                .await
                .map_err(|err| MailboxError::Handler(err.to_string()))?;
            self.ledger.mark(&key, LedgerStatus::JobDone).await?;
        }

        let archive = self.config.dir.join(HISTORY).join(file);
        if fs::try_exists(&archive).await.unwrap_or(false) {
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
