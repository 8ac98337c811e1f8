//! Rate-limited batch delivery of one subscriber's lines to a sink.
//!
//! ```text
//! loop while active {
//!   cache non-empty && interval elapsed ─► sink.send_batch(cache), clear
//!   buffer empty                        ─► sleep(poll_interval)
//!   otherwise                           ─► cache += pop() + "\n"
//! }
//! ```
//!
//! `stop` flips the flag and joins with a bound. Whatever is still cached at
//! that point is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::broadcast::Subscriber;
use crate::config::DispatchSettings;

/// Destination for batched log text.
pub trait LogSink: Send + Sync + 'static {
    fn send_batch(&self, batch: &str) -> anyhow::Result<()>;
}

impl<F> LogSink for F
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn send_batch(&self, batch: &str) -> anyhow::Result<()> {
        self(batch)
    }
}

pub struct LogSubscription {
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
    settings: DispatchSettings,
}

impl LogSubscription {
    /// Starts the dispatch loop on its own task. Must be called from within
    /// a tokio runtime.
    pub fn spawn(subscriber: Subscriber, sink: Arc<dyn LogSink>, settings: DispatchSettings) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(dispatch(
            subscriber,
            sink,
            active.clone(),
            settings.clone(),
        ));
        Self {
            active,
            task: Some(task),
            settings,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
            && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stops the loop, waiting at most `join_timeout` for it to exit.
    pub async fn stop(mut self) {
        self.active.store(false, Ordering::Release);
        let Some(task) = self.task.take() else {
            return;
        };
        let abort = task.abort_handle();
        if tokio::time::timeout(self.settings.join_timeout, task)
            .await
            .is_err()
        {
            debug!(event = "log_subscription_join_timeout");
            abort.abort();
        }
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

async fn dispatch(
    subscriber: Subscriber,
    sink: Arc<dyn LogSink>,
    active: Arc<AtomicBool>,
    settings: DispatchSettings,
) {
    let mut cache = String::new();
    let mut last_flush: Option<Instant> = None;

    while active.load(Ordering::Acquire) {
        let due = last_flush.map_or(true, |at| at.elapsed() >= settings.interval);
        if due && !cache.is_empty() {
            if let Err(err) = sink.send_batch(&cache) {
                debug!(event = "log_sink_failed", subscriber = subscriber.id(), error = %err);
            }
            cache.clear();
            last_flush = Some(Instant::now());
        }

        match subscriber.pop() {
            Some(line) => {
                cache.push_str(&line);
                cache.push('\n');
            }
            None => tokio::time::sleep(settings.poll_interval).await,
        }
    }
}
