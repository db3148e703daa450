//! Long-running history walks, driven one step per iteration by the task
//! manager.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use vox_common::{Result, VoxError};

use crate::router::Router;
use crate::session::SessionClient;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_RETRIES: u32 = 10;
const IDLE_SLEEP: Duration = Duration::from_secs(10);
const DEFAULT_PAGE_LIMIT: usize = 100;
/// Remaining distance to the lower bound below which a walk counts as done.
const DELTA: i64 = 3;

#[async_trait]
pub trait Task: Send + Sync {
    fn id(&self) -> &str;
    /// Percentage of the range covered so far.
    fn progress(&self) -> f64;
    fn finished(&self) -> bool;
    async fn step(&mut self) -> Result<()>;
}

pub(crate) struct TaskEntry {
    task: Box<dyn Task>,
    retries: u32,
}

impl TaskEntry {
    pub(crate) fn new(task: Box<dyn Task>) -> Self {
        Self { task, retries: 0 }
    }

    pub(crate) fn failed(&self) -> bool {
        self.retries >= MAX_RETRIES
    }

    pub(crate) fn done(&self) -> bool {
        self.failed() || self.task.finished()
    }

    fn id(&self) -> &str {
        self.task.id()
    }

    /// One bounded step; transient failures count against the retry budget.
    pub(crate) async fn drive(&mut self) {
        if self.failed() {
            return;
        }

        let outcome = match tokio::time::timeout(STEP_TIMEOUT, self.task.step()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(VoxError::Timeout(format!("step of task {}", self.task.id()))),
        };

        if let Err(err) = outcome {
            self.retries += 1;
            if self.failed() {
                error!(
                    "max retries reached for task {} ({:.1}%): {err}",
                    self.task.id(),
                    self.task.progress()
                );
            } else {
                warn!(
                    "failed to process step for task {} ({:.1}%): {err}",
                    self.task.id(),
                    self.task.progress()
                );
            }
        }
    }
}

/// Process-wide task table: at most one live task per identity.
pub struct TaskManager {
    ids: StdMutex<HashSet<String>>,
    pending: StdMutex<Vec<TaskEntry>>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            ids: StdMutex::new(HashSet::new()),
            pending: StdMutex::new(Vec::new()),
        }
    }

    pub fn add_task(&self, task: Box<dyn Task>) {
        let id = task.id().to_string();

        let mut ids = self.ids.lock().unwrap();
        if !ids.insert(id.clone()) {
            info!("already processing task {id}");
            return;
        }
        drop(ids);

        info!("new task {id}");
        self.pending.lock().unwrap().push(TaskEntry::new(task));
    }

    pub fn live_count(&self) -> usize {
        self.ids.lock().unwrap().len()
    }

    /// Advances every live task one step per iteration, drops the done ones
    /// and sleeps while the table is empty.
    pub async fn run(self: Arc<Self>) {
        let mut active: HashMap<String, TaskEntry> = HashMap::new();

        loop {
            for entry in self.pending.lock().unwrap().drain(..) {
                active.insert(entry.id().to_string(), entry);
            }

            if active.is_empty() {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }

            join_all(active.values_mut().map(|entry| entry.drive())).await;

            let done: Vec<String> = active
                .iter()
                .filter(|(_, entry)| entry.done())
                .map(|(id, _)| id.clone())
                .collect();
            for id in done {
                active.remove(&id);
                self.ids.lock().unwrap().remove(&id);
                debug!("task {id} removed");
            }
        }
    }
}

/// Walks a chat's history from `start` down to `end` (Telegram-style reverse
/// paging), replaying every page through the message router as if it had
/// arrived live.
pub struct HistoryTask {
    router: Arc<Router>,
    session: Arc<SessionClient>,
    chat_id: i64,
    start: i64,
    end: i64,
    limit: usize,
    current_offset: i64,
    count: u64,
    exhausted: bool,
    id: String,
}

impl HistoryTask {
    pub fn new(
        router: Arc<Router>,
        session: Arc<SessionClient>,
        chat_id: i64,
        start_id: i64,
        end_id: i64,
    ) -> Self {
        Self {
            router,
            session,
            chat_id,
            start: start_id,
            end: end_id,
            limit: DEFAULT_PAGE_LIMIT,
            current_offset: start_id,
            count: 0,
            exhausted: false,
            id: format!("{chat_id}_{start_id}_{end_id}"),
        }
    }

    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    fn total(&self) -> i64 {
        self.start - self.end
    }
}

#[async_trait]
impl Task for HistoryTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn progress(&self) -> f64 {
        if self.total() == 0 {
            return 100.0;
        }
        (self.start - self.current_offset) as f64 / self.total() as f64 * 100.0
    }

    fn finished(&self) -> bool {
        if self.exhausted {
            return true;
        }
        // An open-ended walk has no bound to compare against until the first
        // page resolves `start`.
        if self.start == 0 && self.end == 0 {
            return false;
        }
        self.current_offset - self.end < DELTA
    }

    async fn step(&mut self) -> Result<()> {
        let messages = self
            .session
            .get_history(self.chat_id, self.current_offset, self.end, self.limit)
            .await?;

        if messages.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        if self.start == 0 {
            self.start = messages[0].id;
        }

        for message in &messages {
            self.count += 1;
            self.router.process_message(&self.session, message).await?;
            self.current_offset = message.id;
        }

        Ok(())
    }
}
