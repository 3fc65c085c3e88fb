//! Job lifecycle state machine.
//!
//! Enforces the legal status edges and validates recorded transition
//! histories.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::scheduler::job::{JobId, JobStatus};

/// A single status change as recorded by a job store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    /// Store-wide monotonically increasing sequence number.
    pub sequence: u64,
}

/// Manages job status transitions.
pub struct LifecycleManager {
    valid_transitions: HashMap<JobStatus, Vec<JobStatus>>,
}

impl LifecycleManager {
    /// Creates a lifecycle manager with the pipeline transition rules.
    ///
    /// Valid transitions:
    /// - Pending -> Producing (admission)
    /// - Pending -> Publishing (admission with an existing artifact)
    /// - Producing -> Assembling -> Publishing -> Completed (stage success)
    /// - Producing | Assembling | Publishing -> Pending (retry after backoff)
    /// - any non-terminal -> Failed | Cancelled
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(
            JobStatus::Pending,
            vec![
                JobStatus::Producing,
                JobStatus::Publishing,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
        );

        valid_transitions.insert(
            JobStatus::Producing,
            vec![
                JobStatus::Assembling,
                JobStatus::Pending,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
        );

        valid_transitions.insert(
            JobStatus::Assembling,
            vec![
                JobStatus::Publishing,
                JobStatus::Pending,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
        );

        valid_transitions.insert(
            JobStatus::Publishing,
            vec![
                JobStatus::Completed,
                JobStatus::Pending,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
        );

        valid_transitions.insert(JobStatus::Completed, vec![]);
        valid_transitions.insert(JobStatus::Failed, vec![]);
        valid_transitions.insert(JobStatus::Cancelled, vec![]);

        Self { valid_transitions }
    }

    /// Check if a transition between two statuses is allowed.
    pub fn can_transition(&self, from: JobStatus, to: JobStatus) -> bool {
        self.valid_transitions
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    /// Returns the statuses reachable from `from` in one step.
    pub fn successors(&self, from: JobStatus) -> &[JobStatus] {
        self.valid_transitions
            .get(&from)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Checks a single transition.
    pub fn check(&self, job_id: JobId, from: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(TransitionError { job_id, from, to })
        }
    }

    /// Validates a transition log.
    ///
    /// Every record must follow a legal edge, and each job's records must
    /// chain: a record's `from` equals the previous record's `to` for the
    /// same job. Records are taken in `sequence` order.
    pub fn validate_history(&self, records: &[TransitionRecord]) -> Result<(), TransitionError> {
        let mut ordered: Vec<&TransitionRecord> = records.iter().collect();
        ordered.sort_by_key(|record| record.sequence);

        let mut last_seen: HashMap<JobId, JobStatus> = HashMap::new();
        for record in ordered {
            self.check(record.job_id, record.from, record.to)?;

            if let Some(previous) = last_seen.get(&record.job_id) {
                if *previous != record.from {
                    return Err(TransitionError {
                        job_id: record.job_id,
                        from: *previous,
                        to: record.to,
                    });
                }
            }
            last_seen.insert(record.job_id, record.to);
        }

        Ok(())
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(job_id: JobId, from: JobStatus, to: JobStatus, sequence: u64) -> TransitionRecord {
        TransitionRecord {
            job_id,
            from,
            to,
            at: Utc::now(),
            sequence,
        }
    }

    #[test]
    fn test_valid_transitions() {
        let manager = LifecycleManager::new();

        assert!(manager.can_transition(JobStatus::Pending, JobStatus::Producing));
        assert!(manager.can_transition(JobStatus::Pending, JobStatus::Publishing));
        assert!(!manager.can_transition(JobStatus::Pending, JobStatus::Assembling));
        assert!(!manager.can_transition(JobStatus::Pending, JobStatus::Completed));

        assert!(manager.can_transition(JobStatus::Producing, JobStatus::Assembling));
        assert!(manager.can_transition(JobStatus::Assembling, JobStatus::Publishing));
        assert!(manager.can_transition(JobStatus::Publishing, JobStatus::Completed));
        assert!(!manager.can_transition(JobStatus::Producing, JobStatus::Publishing));

        for status in JobStatus::IN_PROGRESS {
            assert!(manager.can_transition(status, JobStatus::Pending));
        }
    }

    #[test]
    fn test_failed_and_cancelled_reachable_from_every_non_terminal() {
        let manager = LifecycleManager::new();
        for status in JobStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(manager.can_transition(status, JobStatus::Failed), "{status} -> failed");
            assert!(
                manager.can_transition(status, JobStatus::Cancelled),
                "{status} -> cancelled"
            );
        }
    }

    #[test]
    fn test_terminal_statuses_have_no_successors() {
        let manager = LifecycleManager::new();
        for status in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            assert!(manager.successors(status).is_empty());
            for target in JobStatus::ALL {
                assert!(!manager.can_transition(status, target));
            }
        }
    }

    #[test]
    fn test_self_transitions_rejected() {
        let manager = LifecycleManager::new();
        for status in JobStatus::ALL {
            assert!(!manager.can_transition(status, status));
        }
    }

    #[test]
    fn test_check_reports_edge() {
        let manager = LifecycleManager::new();
        let err = manager
            .check(4, JobStatus::Completed, JobStatus::Producing)
            .unwrap_err();
        assert_eq!(err.job_id, 4);
        assert_eq!(err.from, JobStatus::Completed);
        assert_eq!(err.to, JobStatus::Producing);
    }

    #[test]
    fn test_validate_history_accepts_pipeline_with_retry() {
        let manager = LifecycleManager::new();
        let history = vec![
            record(1, JobStatus::Pending, JobStatus::Producing, 1),
            record(2, JobStatus::Pending, JobStatus::Publishing, 2),
            record(1, JobStatus::Producing, JobStatus::Pending, 3),
            record(2, JobStatus::Publishing, JobStatus::Completed, 4),
            record(1, JobStatus::Pending, JobStatus::Producing, 5),
            record(1, JobStatus::Producing, JobStatus::Assembling, 6),
            record(1, JobStatus::Assembling, JobStatus::Publishing, 7),
            record(1, JobStatus::Publishing, JobStatus::Completed, 8),
        ];
        assert!(manager.validate_history(&history).is_ok());
    }

    #[test]
    fn test_validate_history_rejects_illegal_edge() {
        let manager = LifecycleManager::new();
        let history = vec![
            record(1, JobStatus::Pending, JobStatus::Producing, 1),
            record(1, JobStatus::Producing, JobStatus::Assembling, 2),
            record(1, JobStatus::Assembling, JobStatus::Publishing, 3),
            record(1, JobStatus::Publishing, JobStatus::Completed, 4),
            record(1, JobStatus::Completed, JobStatus::Producing, 5),
        ];
        let err = manager.validate_history(&history).unwrap_err();
        assert_eq!(err.from, JobStatus::Completed);
        assert_eq!(err.to, JobStatus::Producing);
    }

    #[test]
    fn test_validate_history_rejects_broken_chain() {
        let manager = LifecycleManager::new();
        // Each edge is legal on its own, but the job skipped from Producing
        // to a record that starts at Assembling.
        let history = vec![
            record(1, JobStatus::Pending, JobStatus::Producing, 1),
            record(1, JobStatus::Assembling, JobStatus::Publishing, 2),
        ];
        assert!(manager.validate_history(&history).is_err());
    }

    #[test]
    fn test_validate_history_orders_by_sequence() {
        let manager = LifecycleManager::new();
        let history = vec![
            record(1, JobStatus::Producing, JobStatus::Assembling, 2),
            record(1, JobStatus::Pending, JobStatus::Producing, 1),
        ];
        assert!(manager.validate_history(&history).is_ok());
    }
}
