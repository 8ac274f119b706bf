//! Consensus gating for risky tasks

use crate::backend::{AgentHandle, Vote, Voter};
use crate::models::{Task, TaskPriority};
use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

fn risk_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(security|secure|auth\w*|deploy\w*|production|release|architecture|architectural|delete|remove|drop|migrat\w*)\b").ok()
    })
    .as_ref()
}

/// High priority, a risky keyword, or a crowded session
pub fn requires_consensus(task: &Task, agent_count: usize) -> bool {
    task.priority == TaskPriority::High
        || agent_count > 3
        || risk_re().map_or(false, |re| re.is_match(&task.description))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusOutcome {
    Approved,
    Rejected,
    /// Not enough votes either way yet
    Undecided,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusDecision {
    pub approvals: usize,
    pub rejections: usize,
    pub respondents: usize,
    pub outcome: ConsensusOutcome,
}

impl ConsensusDecision {
    pub fn approved(&self) -> bool {
        self.outcome == ConsensusOutcome::Approved
    }
}

/// Decide from the votes that arrived. Approval needs `threshold` of the
/// respondents; rejection needs more than `1 - threshold`.
pub fn tally(votes: &[Vote], threshold: f64) -> ConsensusDecision {
    let approvals = votes.iter().filter(|v| **v == Vote::Approve).count();
    let rejections = votes.len() - approvals;
    let respondents = votes.len();

    let outcome = if respondents == 0 {
        ConsensusOutcome::Undecided
    } else if approvals as f64 / respondents as f64 >= threshold {
        ConsensusOutcome::Approved
    } else if rejections as f64 / respondents as f64 > 1.0 - threshold {
        ConsensusOutcome::Rejected
    } else {
        ConsensusOutcome::Undecided
    };

    ConsensusDecision {
        approvals,
        rejections,
        respondents,
        outcome,
    }
}

/// Decision reachable before every voter answered, measured against the full electorate
fn early_decision(votes: &[Vote], electorate: usize, threshold: f64) -> Option<ConsensusOutcome> {
    let approvals = votes.iter().filter(|v| **v == Vote::Approve).count() as f64;
    let rejections = (votes.len() as f64) - approvals;
    let electorate = electorate as f64;
    if approvals / electorate >= threshold {
        Some(ConsensusOutcome::Approved)
    } else if rejections / electorate > 1.0 - threshold {
        Some(ConsensusOutcome::Rejected)
    } else {
        None
    }
}

/// Ask every agent concurrently. Stops early once the outcome cannot
/// change; at the deadline it decides with whatever arrived, and no
/// respondents at all means rejection.
pub async fn collect_votes(
    voter: &dyn Voter,
    voters: &[AgentHandle],
    task: &Task,
    threshold: f64,
    timeout: Duration,
) -> ConsensusDecision {
    let mut pending: FuturesUnordered<_> = voters.iter().map(|h| voter.cast_vote(h, task)).collect();
    let mut votes: Vec<Vote> = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match tokio::time::timeout_at(deadline, pending.next()).await {
            Ok(Some(Some(vote))) => {
                votes.push(vote);
                if early_decision(&votes, voters.len(), threshold).is_some() {
                    break;
                }
            }
            Ok(Some(None)) => {}
            Ok(None) => break,
            Err(_) => {
                log::info!(
                    "[Consensus] Voting on task {} timed out with {}/{} vote(s)",
                    task.id,
                    votes.len(),
                    voters.len()
                );
                break;
            }
        }
    }

    let mut decision = tally(&votes, threshold);
    if decision.outcome == ConsensusOutcome::Undecided {
        decision.outcome = ConsensusOutcome::Rejected;
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTask;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Votes from a fixed table; agents not in the table never answer
    struct TableVoter(HashMap<String, Option<Vote>>);

    #[async_trait]
    impl Voter for TableVoter {
        async fn cast_vote(&self, handle: &AgentHandle, _task: &Task) -> Option<Vote> {
            match self.0.get(&handle.agent_id) {
                Some(vote) => *vote,
                None => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    None
                }
            }
        }
    }

    fn handles(names: &[&str]) -> Vec<AgentHandle> {
        names
            .iter()
            .map(|n| AgentHandle {
                id: format!("h-{}", n),
                agent_id: n.to_string(),
                workspace_path: PathBuf::from("/tmp"),
            })
            .collect()
    }

    fn task(desc: &str) -> Task {
        Task::from_new(NewTask::new("s1", "a", desc), 3)
    }

    #[test]
    fn test_requires_consensus() {
        assert!(requires_consensus(&task("Deploy to production"), 2));
        assert!(requires_consensus(&task("rework the auth flow"), 2));
        assert!(requires_consensus(&task("fix typo"), 4));
        let mut high = task("fix typo");
        high.priority = TaskPriority::High;
        assert!(requires_consensus(&high, 1));
        assert!(!requires_consensus(&task("fix typo"), 3));
    }

    #[test]
    fn test_tally() {
        use Vote::*;
        assert_eq!(tally(&[Approve, Approve, Reject], 0.66).outcome, ConsensusOutcome::Approved);
        assert_eq!(tally(&[Approve, Reject], 0.66).outcome, ConsensusOutcome::Rejected);
        assert_eq!(tally(&[], 0.66).outcome, ConsensusOutcome::Undecided);
        assert_eq!(tally(&[Approve, Reject], 0.5).outcome, ConsensusOutcome::Approved);
    }

    #[tokio::test]
    async fn test_collect_votes_approves() {
        let voter = TableVoter(HashMap::from([
            ("a".to_string(), Some(Vote::Approve)),
            ("b".to_string(), Some(Vote::Approve)),
            ("c".to_string(), Some(Vote::Reject)),
        ]));
        let decision =
            collect_votes(&voter, &handles(&["a", "b", "c"]), &task("x"), 0.66, Duration::from_secs(5)).await;
        assert!(decision.approved());
        assert!(decision.approvals >= 2);
    }

    #[tokio::test]
    async fn test_collect_votes_times_out_with_partial_votes() {
        let voter = TableVoter(HashMap::from([("a".to_string(), Some(Vote::Approve))]));
        let decision = collect_votes(
            &voter,
            &handles(&["a", "silent-1", "silent-2"]),
            &task("x"),
            0.66,
            Duration::from_millis(100),
        )
        .await;
        // One approval out of one respondent
        assert!(decision.approved());
        assert_eq!(decision.respondents, 1);
    }

    #[tokio::test]
    async fn test_no_respondents_rejects() {
        let voter = TableVoter(HashMap::from([("a".to_string(), None)]));
        let decision =
            collect_votes(&voter, &handles(&["a"]), &task("x"), 0.66, Duration::from_millis(100)).await;
        assert_eq!(decision.outcome, ConsensusOutcome::Rejected);
        assert_eq!(decision.respondents, 0);
    }
}
