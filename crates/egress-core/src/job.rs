use std::collections::HashMap;
use std::time::{Duration, Instant};

use egress_protocol::{EgressInfo, EgressStatus, RequestKind};
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;

/// Allocate a fresh job id (`EG_` + 12 hex chars).
pub fn new_egress_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("EG_{}", &id[..12])
}

pub(crate) struct JobEntry {
    pub info: EgressInfo,
    pub kind: RequestKind,
    /// Cooperative stop; a child of `kill`.
    pub stop: CancellationToken,
    pub kill: CancellationToken,
    pub reached_active: bool,
    seq: u64,
    terminal_at: Option<Instant>,
}

impl JobEntry {
    pub fn new(info: EgressInfo, kind: RequestKind) -> Self {
        let kill = CancellationToken::new();
        Self {
            info,
            kind,
            stop: kill.child_token(),
            kill,
            reached_active: false,
            seq: 0,
            terminal_at: None,
        }
    }

    pub fn status(&self) -> EgressStatus {
        self.info.status
    }
}

/// In-memory map of job id to job state. The only writer of `status`.
#[derive(Default)]
pub(crate) struct JobTable {
    jobs: HashMap<String, JobEntry>,
    next_seq: u64,
}

impl JobTable {
    pub fn insert(&mut self, mut entry: JobEntry) {
        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.jobs.insert(entry.info.egress_id.clone(), entry);
    }

    pub fn get(&self, egress_id: &str) -> Option<&JobEntry> {
        self.jobs.get(egress_id)
    }

    /// Apply a lifecycle transition. Illegal moves leave the entry untouched.
    pub fn transition(
        &mut self,
        egress_id: &str,
        to: EgressStatus,
        error: Option<&str>,
        now_ms: u64,
    ) -> Result<EgressInfo, ServiceError> {
        let entry = self
            .jobs
            .get_mut(egress_id)
            .ok_or_else(|| ServiceError::NotFound {
                egress_id: egress_id.to_string(),
            })?;
        let from = entry.info.status;
        if !from.can_transition_to(to) {
            return Err(ServiceError::InvalidState {
                egress_id: egress_id.to_string(),
                from,
                to,
            });
        }
        entry.info.status = to;
        match to {
            EgressStatus::Active => {
                entry.reached_active = true;
                entry.info.started_at = now_ms;
            }
            EgressStatus::Complete | EgressStatus::Aborted => {
                entry.info.ended_at = now_ms;
                entry.terminal_at = Some(Instant::now());
                if let Some(err) = error {
                    entry.info.error = err.to_string();
                }
            }
            _ => {}
        }
        Ok(entry.info.clone())
    }

    /// Every retained job, oldest first.
    pub fn list(&self) -> Vec<EgressInfo> {
        let mut entries: Vec<&JobEntry> = self.jobs.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.info.clone()).collect()
    }

    pub fn live(&self) -> impl Iterator<Item = &JobEntry> {
        self.jobs.values().filter(|e| !e.status().is_terminal())
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }

    /// Remove terminal jobs older than `retention`; returns the evicted ids.
    pub fn evict_expired(&mut self, now: Instant, retention: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter_map(|(id, e)| match e.terminal_at {
                Some(at) if now.saturating_duration_since(at) >= retention => Some(id.clone()),
                _ => None,
            })
            .collect();
        for id in &expired {
            self.jobs.remove(id);
        }
        expired
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> JobEntry {
        JobEntry::new(
            EgressInfo {
                egress_id: id.into(),
                room_id: "RM_a".into(),
                ..Default::default()
            },
            RequestKind::Track,
        )
    }

    #[test]
    fn ids_have_prefix_and_are_unique() {
        let a = new_egress_id();
        let b = new_egress_id();
        assert!(a.starts_with("EG_"));
        assert_eq!(a.len(), 15);
        assert_ne!(a, b);
    }

    #[test]
    fn happy_path_sets_timestamps() {
        let mut t = JobTable::default();
        t.insert(entry("EG_1"));
        let info = t.transition("EG_1", EgressStatus::Active, None, 10).unwrap();
        assert_eq!(info.started_at, 10);
        t.transition("EG_1", EgressStatus::Ending, None, 20).unwrap();
        let info = t.transition("EG_1", EgressStatus::Complete, None, 30).unwrap();
        assert_eq!(info.status, EgressStatus::Complete);
        assert_eq!(info.ended_at, 30);
        assert!(info.error.is_empty());
        assert_eq!(t.live_count(), 0);
    }

    #[test]
    fn backward_move_is_rejected_and_state_kept() {
        let mut t = JobTable::default();
        t.insert(entry("EG_1"));
        t.transition("EG_1", EgressStatus::Active, None, 1).unwrap();
        t.transition("EG_1", EgressStatus::Ending, None, 2).unwrap();
        let err = t
            .transition("EG_1", EgressStatus::Active, None, 3)
            .unwrap_err();
        assert_eq!(
            err,
            ServiceError::InvalidState {
                egress_id: "EG_1".into(),
                from: EgressStatus::Ending,
                to: EgressStatus::Active,
            }
        );
        assert_eq!(t.get("EG_1").unwrap().status(), EgressStatus::Ending);
    }

    #[test]
    fn abort_records_error() {
        let mut t = JobTable::default();
        t.insert(entry("EG_1"));
        let info = t
            .transition("EG_1", EgressStatus::Aborted, Some("encoder crashed"), 5)
            .unwrap();
        assert_eq!(info.error, "encoder crashed");
        assert_eq!(info.started_at, 0);
        assert!(matches!(
            t.transition("EG_1", EgressStatus::Aborted, None, 6),
            Err(ServiceError::InvalidState { .. })
        ));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let mut t = JobTable::default();
        assert!(matches!(
            t.transition("EG_missing", EgressStatus::Active, None, 0),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[test]
    fn eviction_only_touches_expired_terminal_jobs() {
        let mut t = JobTable::default();
        t.insert(entry("EG_1"));
        t.insert(entry("EG_2"));
        t.transition("EG_1", EgressStatus::Aborted, Some("x"), 1).unwrap();

        let now = Instant::now();
        assert!(t.evict_expired(now, Duration::from_secs(60)).is_empty());
        let evicted = t.evict_expired(now + Duration::from_secs(61), Duration::from_secs(60));
        assert_eq!(evicted, vec!["EG_1".to_string()]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.list()[0].egress_id, "EG_2");
    }

    #[test]
    fn list_keeps_insertion_order() {
        let mut t = JobTable::default();
        for id in ["EG_c", "EG_a", "EG_b"] {
            t.insert(entry(id));
        }
        let ids: Vec<String> = t.list().into_iter().map(|i| i.egress_id).collect();
        assert_eq!(ids, vec!["EG_c", "EG_a", "EG_b"]);
    }

    #[test]
    fn stop_token_follows_kill() {
        let e = entry("EG_1");
        e.kill.cancel();
        assert!(e.stop.is_cancelled());
    }
}
