use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// File-naming contract for evidence: workflow ID plus execution timestamp
/// at millisecond precision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvidenceKey {
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
}

impl EvidenceKey {
    pub fn new(workflow_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            started_at,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}--{}.json",
            self.workflow_id,
            self.started_at.format(TIMESTAMP_FORMAT)
        )
    }

    /// Parse a file name produced by [`EvidenceKey::file_name`].
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".json")?;
        let (workflow_id, ts) = stem.rsplit_once("--")?;
        if workflow_id.is_empty() {
            return None;
        }
        let ts = ts.strip_suffix('Z')?;
        let naive = NaiveDateTime::parse_from_str(ts, "%Y%m%dT%H%M%S%3f").ok()?;
        Some(Self {
            workflow_id: workflow_id.to_string(),
            started_at: Utc.from_utc_datetime(&naive),
        })
    }

    /// Same workflow, timestamp advanced by one millisecond. Used when two
    /// attempts start within the same millisecond.
    pub fn next(&self) -> Self {
        Self {
            workflow_id: self.workflow_id.clone(),
            started_at: self.started_at + chrono::Duration::milliseconds(1),
        }
    }
}

impl std::fmt::Display for EvidenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_round_trips() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()
            + chrono::Duration::milliseconds(89);
        let key = EvidenceKey::new("api-get-health", ts);
        assert_eq!(key.file_name(), "api-get-health--20260304T050607089Z.json");
        assert_eq!(EvidenceKey::parse(&key.file_name()), Some(key));
    }

    #[test]
    fn test_ids_containing_dashes() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let key = EvidenceKey::new("ui--odd--id", ts);
        let parsed = EvidenceKey::parse(&key.file_name()).unwrap();
        assert_eq!(parsed.workflow_id, "ui--odd--id");
    }

    #[test]
    fn test_rejects_foreign_files() {
        assert!(EvidenceKey::parse("notes.txt").is_none());
        assert!(EvidenceKey::parse("plain.json").is_none());
        assert!(EvidenceKey::parse("wf--yesterday.json").is_none());
    }
}
