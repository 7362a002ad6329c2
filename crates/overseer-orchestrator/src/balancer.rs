use crate::types::{AgentRecord, AgentStatus};
use std::cmp::Ordering;

/// Stateless agent selection.
///
/// Picks the healthiest READY agent. Ties go to the agent idle the longest,
/// then to the smallest id, so the same input always yields the same pick.
pub struct LoadBalancer;

impl LoadBalancer {
    /// Whether an agent may receive work at all.
    pub fn is_eligible(agent: &AgentRecord) -> bool {
        agent.status == AgentStatus::Ready && agent.health_score > 0
    }

    /// Total order over candidates, best first.
    pub fn rank(a: &AgentRecord, b: &AgentRecord) -> Ordering {
        b.health_score
            .cmp(&a.health_score)
            .then_with(|| Self::status_rank(a.status).cmp(&Self::status_rank(b.status)))
            .then_with(|| a.idle_since.cmp(&b.idle_since))
            .then_with(|| a.id.cmp(&b.id))
    }

    fn status_rank(status: AgentStatus) -> u8 {
        match status {
            AgentStatus::Ready => 0,
            _ => 1,
        }
    }

    /// Best eligible candidate, or `None` when nobody can take work.
    pub fn select(candidates: &[AgentRecord]) -> Option<&AgentRecord> {
        candidates
            .iter()
            .filter(|a| Self::is_eligible(a))
            .min_by(|a, b| Self::rank(a, b))
    }

    /// Eligible candidates in preference order.
    pub fn ranked(candidates: &[AgentRecord]) -> Vec<&AgentRecord> {
        let mut eligible: Vec<&AgentRecord> =
            candidates.iter().filter(|a| Self::is_eligible(a)).collect();
        eligible.sort_by(|a, b| Self::rank(a, b));
        eligible
    }
}
