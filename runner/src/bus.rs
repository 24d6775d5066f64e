//! Per-job log broadcast.
//!
//! Each job gets one topic. Lines published while the job runs fan out to
//! every live subscriber; once the job settles a single [`LogEvent::Done`] is
//! published and the topic is dropped. The bus remembers the status of the
//! last [`SETTLED_RETAINED`] settled jobs so late subscribers get the done
//! event immediately; older jobs are answered from the store. Mid-flight
//! subscribers see only future lines unless the bus keeps a replay ring
//! (`replay_lines > 0`).

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::core::types::{JobId, JobStatus};
use crate::io::config::LogConfig;

/// Settled jobs whose final status the bus still hands to late subscribers.
pub const SETTLED_RETAINED: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Line(String),
    Done(JobStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("job {job} already has {limit} log subscribers")]
    TooManySubscribers { job: JobId, limit: usize },
    #[error("no log stream for job {0}")]
    UnknownJob(JobId),
}

#[derive(Debug)]
struct Topic {
    tx: broadcast::Sender<LogEvent>,
    history: VecDeque<String>,
}

#[derive(Debug, Default)]
struct Topics {
    live: HashMap<JobId, Topic>,
    /// Oldest first, at most [`SETTLED_RETAINED`] entries.
    settled: VecDeque<(JobId, JobStatus)>,
}

impl Topics {
    fn settled_status(&self, job: JobId) -> Option<JobStatus> {
        self.settled
            .iter()
            .find(|(id, _)| *id == job)
            .map(|(_, status)| *status)
    }
}

#[derive(Debug)]
pub struct LogBus {
    topics: Mutex<Topics>,
    capacity: usize,
    max_subscribers: usize,
    replay_lines: usize,
}

impl LogBus {
    pub fn new(capacity: usize, max_subscribers: usize, replay_lines: usize) -> Self {
        Self {
            topics: Mutex::new(Topics::default()),
            capacity: capacity.max(1),
            max_subscribers,
            replay_lines,
        }
    }

    pub fn from_config(config: &LogConfig) -> Self {
        Self::new(config.bus_capacity, config.max_subscribers, config.replay_lines)
    }

    /// Create the topic for a starting job. Opening twice is a no-op.
    pub fn open(&self, job: JobId) {
        let mut topics = self.topics.lock();
        topics.live.entry(job).or_insert_with(|| {
            let (tx, _) = broadcast::channel(self.capacity);
            Topic {
                tx,
                history: VecDeque::new(),
            }
        });
    }

    /// Publish one line. Dropped silently when nobody listens or the job settled.
    pub fn publish(&self, job: JobId, line: impl Into<String>) {
        let mut topics = self.topics.lock();
        let Some(topic) = topics.live.get_mut(&job) else {
            return;
        };
        let line = line.into();
        if self.replay_lines > 0 {
            if topic.history.len() == self.replay_lines {
                topic.history.pop_front();
            }
            topic.history.push_back(line.clone());
        }
        // No receivers is the common case for unobserved jobs.
        let _ = topic.tx.send(LogEvent::Line(line));
    }

    /// Publish the terminal event and drop the topic. Returns false if the job
    /// already finished.
    pub fn finish(&self, job: JobId, status: JobStatus) -> bool {
        let mut topics = self.topics.lock();
        if topics.settled_status(job).is_some() {
            return false;
        }
        if let Some(topic) = topics.live.remove(&job) {
            let _ = topic.tx.send(LogEvent::Done(status));
        }
        if topics.settled.len() == SETTLED_RETAINED {
            topics.settled.pop_front();
        }
        topics.settled.push_back((job, status));
        debug!(job = %job, status = %status, "log stream finished");
        true
    }

    /// Subscribe to a job's stream.
    pub fn subscribe(&self, job: JobId) -> Result<Subscription, BusError> {
        let topics = self.topics.lock();
        let Some(topic) = topics.live.get(&job) else {
            return match topics.settled_status(job) {
                Some(status) => Ok(Subscription::Finished {
                    status,
                    delivered: false,
                }),
                None => Err(BusError::UnknownJob(job)),
            };
        };
        if topic.tx.receiver_count() >= self.max_subscribers {
            return Err(BusError::TooManySubscribers {
                job,
                limit: self.max_subscribers,
            });
        }
        Ok(Subscription::Live {
            rx: topic.tx.subscribe(),
            replay: topic.history.clone(),
        })
    }

    #[cfg(test)]
    fn live_topics(&self) -> usize {
        self.topics.lock().live.len()
    }
}

/// A subscriber's view of one job's stream.
#[derive(Debug)]
pub enum Subscription {
    Live {
        rx: broadcast::Receiver<LogEvent>,
        replay: VecDeque<String>,
    },
    Finished {
        status: JobStatus,
        delivered: bool,
    },
}

impl Subscription {
    /// Next event; `None` after the stream ended.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        match self {
            Subscription::Live { rx, replay } => {
                if let Some(line) = replay.pop_front() {
                    return Some(LogEvent::Line(line));
                }
                loop {
                    match rx.recv().await {
                        Ok(event) => return Some(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "log subscriber lagged, lines dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
            Subscription::Finished { status, delivered } => {
                if *delivered {
                    None
                } else {
                    *delivered = true;
                    Some(LogEvent::Done(*status))
                }
            }
        }
    }
}
