//! Worker selection policies

use serde::{Deserialize, Serialize};

/// How the pool picks a worker for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalancingPolicy {
    /// Pure rotation over live workers
    RoundRobin,
    /// Fewest pending requests
    LeastLoaded,
    /// Prefer a worker that already has the document, then least loaded
    #[default]
    DocumentAffinity,
}

impl BalancingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalancingPolicy::RoundRobin => "round_robin",
            BalancingPolicy::LeastLoaded => "least_loaded",
            BalancingPolicy::DocumentAffinity => "document_affinity",
        }
    }
}

/// Snapshot of a live worker taken at dispatch time
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub index: usize,
    pub pending: usize,
    pub has_document: bool,
}

/// Picks a worker index from `candidates`, or `None` if there are none.
///
/// `rotation` is a monotonically increasing counter owned by the pool.
pub(crate) fn select(policy: BalancingPolicy, candidates: &[Candidate], rotation: usize) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }

    match policy {
        BalancingPolicy::RoundRobin => Some(candidates[rotation % candidates.len()].index),
        BalancingPolicy::LeastLoaded => least_loaded(candidates.iter()),
        BalancingPolicy::DocumentAffinity => {
            least_loaded(candidates.iter().filter(|c| c.has_document))
                .or_else(|| least_loaded(candidates.iter()))
        }
    }
}

fn least_loaded<'a>(candidates: impl Iterator<Item = &'a Candidate>) -> Option<usize> {
    candidates
        .min_by_key(|c| (c.pending, c.index))
        .map(|c| c.index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(pending: &[usize], with_doc: &[usize]) -> Vec<Candidate> {
        pending
            .iter()
            .enumerate()
            .map(|(index, &pending)| Candidate {
                index,
                pending,
                has_document: with_doc.contains(&index),
            })
            .collect()
    }

    #[test]
    fn round_robin_rotates() {
        let c = candidates(&[5, 0, 0], &[]);
        let picks: Vec<_> = (0..4)
            .map(|r| select(BalancingPolicy::RoundRobin, &c, r))
            .collect();
        assert_eq!(picks, vec![Some(0), Some(1), Some(2), Some(0)]);
    }

    #[test]
    fn least_loaded_breaks_ties_by_index() {
        let c = candidates(&[3, 1, 1], &[]);
        assert_eq!(select(BalancingPolicy::LeastLoaded, &c, 0), Some(1));
    }

    #[test]
    fn affinity_prefers_document_holder() {
        let c = candidates(&[0, 4, 0], &[1]);
        assert_eq!(select(BalancingPolicy::DocumentAffinity, &c, 0), Some(1));
    }

    #[test]
    fn affinity_picks_least_loaded_holder() {
        let c = candidates(&[0, 4, 2], &[1, 2]);
        assert_eq!(select(BalancingPolicy::DocumentAffinity, &c, 0), Some(2));
    }

    #[test]
    fn affinity_falls_back_to_least_loaded() {
        let c = candidates(&[2, 1, 3], &[]);
        assert_eq!(select(BalancingPolicy::DocumentAffinity, &c, 0), Some(1));
    }

    #[test]
    fn no_candidates() {
        assert_eq!(select(BalancingPolicy::LeastLoaded, &[], 0), None);
    }
}
