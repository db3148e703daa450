//! Tracing layer that mirrors log records into the `logs` table.
//!
//! Records go through a bounded queue (overflow is dropped, not blocked) and
//! are flushed in batches by a background task. Flush failures are reported on
//! stderr: routing them through `tracing` would feed them straight back into
//! this layer.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::models::LogRow;
use crate::Store;

const QUEUE_CAPACITY: usize = 100_000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct StoreLogLayer {
    tx: mpsc::Sender<LogRow>,
    shard: u32,
    hostname: String,
}

impl StoreLogLayer {
    /// Spawns the flush task; must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn Store>, shard: u32) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(flush_loop(store, rx));

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self { tx, shard, hostname }
    }
}

async fn flush_loop(store: Arc<dyn Store>, mut rx: mpsc::Receiver<LogRow>) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        interval.tick().await;

        let mut batch = Vec::new();
        while let Ok(row) = rx.try_recv() {
            batch.push(row);
        }

        if batch.is_empty() {
            continue;
        }

        if let Err(err) = store.insert_logs(&batch).await {
            eprintln!("failed to flush {} log records: {err}", batch.len());
        }
    }
}

impl<S: Subscriber> Layer<S> for StoreLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();

        let mut visitor = RenderVisitor::default();
        event.record(&mut visitor);

        let row = LogRow {
            created: Utc::now(),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.into_message(),
            shard: self.shard,
            hostname: self.hostname.clone(),
        };

        // Bounded queue: drop on overflow rather than stall the caller.
        let _ = self.tx.try_send(row);
    }
}

#[derive(Default)]
struct RenderVisitor {
    message: String,
    fields: String,
}

impl RenderVisitor {
    fn into_message(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for RenderVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
