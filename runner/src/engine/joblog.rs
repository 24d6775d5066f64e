//! Job log fan-out: every line goes to the bus and the in-memory buffer, and
//! the buffer reaches the store through a debounced flush.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::LogBus;
use crate::core::stage::Stage;
use crate::core::stream::AgentCallbacks;
use crate::core::tool_summary::summarize_tool_use;
use crate::core::types::JobId;
use crate::io::store::JobStore;

/// Pending flush timers, one per job at most.
#[derive(Debug)]
pub struct FlushScheduler {
    interval: Duration,
    pending: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl FlushScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Arrange for `buffer` to be written within one interval.
    ///
    /// While a timer is pending for `job` further calls are absorbed, so the
    /// store sees at most one log write per job per interval.
    pub fn schedule(
        self: &Arc<Self>,
        job: JobId,
        store: Arc<dyn JobStore>,
        buffer: Arc<Mutex<String>>,
    ) {
        let mut pending = self.pending.lock();
        if pending.contains_key(&job) {
            return;
        }
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(scheduler.interval).await;
            scheduler.pending.lock().remove(&job);
            let snapshot = buffer.lock().clone();
            if let Err(err) = store.update_log(job, &snapshot).await {
                warn!(job = %job, err = %err, "periodic log flush failed");
            }
        });
        pending.insert(job, handle);
    }

    /// Drop the job's pending timer, if any.
    pub fn cancel(&self, job: JobId) {
        if let Some(handle) = self.pending.lock().remove(&job) {
            handle.abort();
            debug!(job = %job, "pending log flush cancelled");
        }
    }

    #[cfg(test)]
    fn is_pending(&self, job: JobId) -> bool {
        self.pending.lock().contains_key(&job)
    }
}

/// Log writer for one job.
#[derive(Clone)]
pub struct JobLog {
    job: JobId,
    bus: Arc<LogBus>,
    store: Arc<dyn JobStore>,
    flusher: Arc<FlushScheduler>,
    buffer: Arc<Mutex<String>>,
}

impl JobLog {
    pub fn new(
        job: JobId,
        bus: Arc<LogBus>,
        store: Arc<dyn JobStore>,
        flusher: Arc<FlushScheduler>,
    ) -> Self {
        Self {
            job,
            bus,
            store,
            flusher,
            buffer: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Append text; each line is published separately. Empty text is one
    /// empty line.
    pub fn line(&self, text: impl AsRef<str>) {
        let text = text.as_ref().trim_end_matches(['\r', '\n']);
        {
            let mut buffer = self.buffer.lock();
            for line in text.split('\n') {
                let line = line.strip_suffix('\r').unwrap_or(line);
                buffer.push_str(line);
                buffer.push('\n');
                self.bus.publish(self.job, line);
            }
        }
        self.flusher
            .schedule(self.job, Arc::clone(&self.store), Arc::clone(&self.buffer));
    }

    pub fn stage(&self, stage: Stage) {
        self.line(stage.banner());
    }

    pub fn snapshot(&self) -> String {
        self.buffer.lock().clone()
    }
}

impl AgentCallbacks for JobLog {
    fn on_tool_use(&self, tool: &str, input: &Value) {
        self.line(summarize_tool_use(tool, input));
    }

    fn on_text(&self, text: &str) {
        self.line(text);
    }
}
