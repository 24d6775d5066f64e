//! Process-wide registry of running jobs' cancellation tokens.
//!
//! Every git command and agent process a job starts is bound to its token, so
//! firing it stops whatever is running (`SIGTERM`, then `SIGKILL` after the
//! grace period) and the job unwinds to cleanup.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::types::JobId;

/// One job's entry in the registry.
///
/// Re-registering a job id issues a new generation, so a settling job can
/// only remove the entry it was given.
#[derive(Debug, Clone)]
pub struct Registration {
    job: JobId,
    generation: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Debug, Default)]
struct Entries {
    next_generation: u64,
    tokens: HashMap<JobId, (u64, CancellationToken)>,
}

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: Mutex<Entries>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `job`.
    pub fn register(&self, job: JobId) -> Registration {
        let token = CancellationToken::new();
        let mut entries = self.entries.lock();
        let generation = entries.next_generation;
        entries.next_generation += 1;
        if let Some((_, stale)) = entries.tokens.insert(job, (generation, token.clone())) {
            warn!(job = %job, "job registered twice, cancelling the stale entry");
            stale.cancel();
        }
        Registration {
            job,
            generation,
            token,
        }
    }

    /// Fire and remove the job's token. Returns false if it was not running.
    pub fn cancel(&self, job: JobId) -> bool {
        let Some((_, token)) = self.entries.lock().tokens.remove(&job) else {
            return false;
        };
        debug!(job = %job, "cancelling job");
        token.cancel();
        true
    }

    /// Drop the entry without cancelling (the job settled on its own).
    ///
    /// A newer registration for the same job id is left in place.
    pub fn remove(&self, registration: &Registration) -> bool {
        let mut entries = self.entries.lock();
        match entries.tokens.get(&registration.job) {
            Some((generation, _)) if *generation == registration.generation => {
                entries.tokens.remove(&registration.job);
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, job: JobId) -> bool {
        self.entries.lock().tokens.contains_key(&job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_token_and_removes_entry() {
        let registry = CancellationRegistry::new();
        let registration = registry.register(JobId(1));
        assert!(registry.is_active(JobId(1)));

        assert!(registry.cancel(JobId(1)));
        assert!(registration.token().is_cancelled());
        assert!(!registry.is_active(JobId(1)));
        assert!(!registry.cancel(JobId(1)));
    }

    #[test]
    fn remove_leaves_token_untouched() {
        let registry = CancellationRegistry::new();
        let registration = registry.register(JobId(2));
        assert!(registry.remove(&registration));
        assert!(!registration.token().is_cancelled());
        assert!(!registry.is_active(JobId(2)));
        assert!(!registry.remove(&registration));
    }

    #[test]
    fn re_registering_cancels_the_stale_token() {
        let registry = CancellationRegistry::new();
        let stale = registry.register(JobId(3));
        let fresh = registry.register(JobId(3));
        assert!(stale.token().is_cancelled());
        assert!(!fresh.token().is_cancelled());
        assert!(registry.is_active(JobId(3)));
    }

    #[test]
    fn stale_registration_cannot_remove_its_successor() {
        let registry = CancellationRegistry::new();
        let stale = registry.register(JobId(4));
        let fresh = registry.register(JobId(4));

        assert!(!registry.remove(&stale));
        assert!(registry.is_active(JobId(4)));
        assert!(registry.cancel(JobId(4)));
        assert!(fresh.token().is_cancelled());
    }
}
