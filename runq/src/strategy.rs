use crate::registry::RunnerCandidate;
use crate::runner::EnvironmentId;

/// Picks one runner among the candidates eligible for a run.
///
/// Implementations receive an immutable snapshot taken from the registry and
/// must not assume it is still current; they never mutate candidate state.
pub trait RunnerSelectionStrategy: Send + Sync {
    fn choose(
        &self,
        environment: &EnvironmentId,
        candidates: &[RunnerCandidate],
    ) -> Option<RunnerCandidate>;
}

/// Prefers the runner idle the longest; never-used runners come first, ties
/// are broken by registration order.
#[derive(Clone, Copy, Debug, Default)]
pub struct LeastRecentlyUsed;

impl RunnerSelectionStrategy for LeastRecentlyUsed {
    fn choose(
        &self,
        environment: &EnvironmentId,
        candidates: &[RunnerCandidate],
    ) -> Option<RunnerCandidate> {
        candidates
            .iter()
            .filter(|candidate| candidate.descriptor().supports(environment))
            // `None` sorts before any timestamp, so unused runners win.
            .min_by_key(|candidate| (candidate.last_used_at, candidate.registration_order))
            .cloned()
    }
}

/// Always takes the earliest registered eligible runner.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstRegistered;

impl RunnerSelectionStrategy for FirstRegistered {
    fn choose(
        &self,
        environment: &EnvironmentId,
        candidates: &[RunnerCandidate],
    ) -> Option<RunnerCandidate> {
        candidates
            .iter()
            .filter(|candidate| candidate.descriptor().supports(environment))
            .min_by_key(|candidate| candidate.registration_order)
            .cloned()
    }
}
