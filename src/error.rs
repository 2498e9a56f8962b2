//! Error kinds produced by the core.

use crate::executor::UsageEntry;

/// Errors surfaced to callers of [`crate::Limiter`].
///
/// Reservation and coordination failures are recovered from internally (retried,
/// rerouted to the next model) and never reach this enum — only the kinds a caller
/// actually needs to react to do.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// `jobType` was not present in the limiter's configuration.
    ///
    /// Raised before any reservation is attempted.
    #[error("unknown job type: {job_type}")]
    UnknownJobType {
        /// The job-type id that was requested.
        job_type: String,
    },

    /// Every model in the escalation order was tried and rejected, twice in a row,
    /// with no successful reservation in between.
    #[error("all models in the escalation order are exhausted")]
    AllModelsExhausted {
        /// Usage accumulated across every attempted model before giving up.
        usage: Vec<UsageEntry>,
    },

    /// The user job returned without reporting an [`crate::executor::Outcome`].
    #[error("job {job_id} returned without resolving or rejecting")]
    JobProtocolViolation {
        /// The job id which violated the protocol.
        job_id: String,
    },

    /// The user job panicked or returned an application error.
    #[error("job {job_id} failed: {message}")]
    UserJobError {
        /// The job id that failed.
        job_id: String,
        /// A description of the failure, if one was provided.
        message: String,
        /// Usage accumulated across every attempt, including the failing one.
        usage: Vec<UsageEntry>,
    },

    /// The caller's cancellation token fired before the job completed.
    #[error("job {job_id} cancelled")]
    Cancelled {
        /// The job id that was cancelled.
        job_id: String,
    },

    /// The coordination back-end was unreachable for long enough that the local
    /// estimate could not safely satisfy the job.
    #[error("coordination backend unavailable: {reason}")]
    CoordinationUnavailable {
        /// A description of the underlying failure.
        reason: String,
    },
}

/// A programming error: the caller referenced a model id that isn't configured.
///
/// Not a recoverable [`LimiterError`] — invalid configuration references are bugs in
/// the caller, not runtime conditions, so this aborts via panic at the call site rather
/// than threading through `Result`.
#[track_caller]
pub(crate) fn abort_unknown_model(model_id: &str) -> ! {
    panic!("quota-relay: unknown model id '{model_id}' — this is a programming error");
}
