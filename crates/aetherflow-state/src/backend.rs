//! State store trait definition.
//!
//! [`StateStore`] is the storage contract for the three durable record
//! kinds: job runs, step runs, and TTL locks. All operations are atomic
//! single-row upserts; a crashed run leaves no row for an incomplete step,
//! so resume re-executes it.

use aetherflow_types::state::{JobStatus, StepStatus};

use crate::error;

/// Storage contract for run state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateStore>`.
pub trait StateStore: Send + Sync {
    /// Read the status of a job within a run.
    ///
    /// Returns `Ok(None)` when the job has not been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_job_status(&self, job_id: &str, run_id: &str) -> error::Result<Option<JobStatus>>;

    /// Upsert the status of a job within a run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn set_job_status(&self, job_id: &str, run_id: &str, status: JobStatus) -> error::Result<()>;

    /// Read the status of a completed step. Absence means the step did not
    /// complete and will run again on resume.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_step_status(
        &self,
        job_id: &str,
        run_id: &str,
        step_id: &str,
    ) -> error::Result<Option<StepStatus>>;

    /// Upsert the status of a completed step. Re-setting the same value is
    /// idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn set_step_status(
        &self,
        job_id: &str,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
    ) -> error::Result<()>;

    /// Try to acquire a keyed TTL lock.
    ///
    /// Returns `true` when the row is absent, expired, or already owned by
    /// `owner` (refreshing `expires_at` in the same atomic step). Returns
    /// `false` when a different owner holds a live row.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn try_acquire_lock(&self, key: &str, owner: &str, ttl_seconds: u64) -> error::Result<bool>;

    /// Release a lock if and only if it is owned by `owner`; a no-op
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn release_lock(&self, key: &str, owner: &str) -> error::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify the trait is object-safe (can be used as `dyn StateStore`).
    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn StateStore) {}
    }
}
