//! Canonical subject and event-kind constants shared across services.
//!
//! Keep this list grouped by concern and favor dot.case names.

// Bus subjects
pub const SUBJECT_EGRESS_REQUEST: &str = "egress.request";
pub const SUBJECT_EGRESS_UPDATES: &str = "egress.updates";
pub const SUBJECT_INBOX_PREFIX: &str = "_INBOX";

// In-process event kinds
pub const TOPIC_EGRESS_UPDATED: &str = "egress.updated";

/// Job-scoped update subject, e.g. `egress.updates.EG_abc`.
pub fn job_updates_subject(egress_id: &str) -> String {
    format!("{SUBJECT_EGRESS_UPDATES}.{egress_id}")
}

/// Fresh reply subject for a single request/response exchange.
pub fn inbox_subject(token: &str) -> String {
    format!("{SUBJECT_INBOX_PREFIX}.{token}")
}
