use crate::worker::WorkerSharedState;
use forge_core::job_error;

/// Releases finished, non-daemon jobs back to the job pool. Run from the thread
/// that owns the `JobSystem` (mirrors `kibble`'s garbage collector, which asserts
/// it only ever runs on the main thread) so pool slots are freed deterministically
/// rather than the moment the last worker touches them.
///
/// A job whose kernel panicked and whose exception nobody ever read via its
/// `SharedFuture` is logged here instead of being silently dropped.
pub(crate) fn collect(state: &WorkerSharedState) {
    while let Some(handle) = state.dead_jobs.pop() {
        if let Some(job) = state.jobs.get(handle) {
            if let Some(error) = job.exception.lock().take() {
                job_error!("job {} finished with an unread exception: {}", job.metadata.label, error);
            }
        }
        state.jobs.remove(handle);
    }
}
