//! Finding records: deduplicated by signature, one active finding per signature.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{parse_col, parse_json, parse_ts, stored, ts, Pool, UnknownValue};
use crate::detect::{Anomaly, Category, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Open,
    Actioned,
    Resolved,
    Ignored,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingStatus::Open => "open",
            FindingStatus::Actioned => "actioned",
            FindingStatus::Resolved => "resolved",
            FindingStatus::Ignored => "ignored",
        }
    }
}

impl fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FindingStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(FindingStatus::Open),
            "actioned" => Ok(FindingStatus::Actioned),
            "resolved" => Ok(FindingStatus::Resolved),
            "ignored" => Ok(FindingStatus::Ignored),
            other => Err(UnknownValue {
                what: "finding status",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted, deduplicated record of one detected anomaly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub id: Uuid,
    pub category: Category,
    pub severity: Severity,
    pub signature: String,
    pub evidence: serde_json::Value,
    pub status: FindingStatus,
    pub occurrences: i64,
    pub first_seen_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_id: Option<String>,
}

/// Result of recording one anomaly.
#[derive(Debug, Clone)]
pub struct Upserted {
    pub finding: Finding,
    /// False when an existing active finding was refreshed.
    pub created: bool,
}

const COLUMNS: &str = "id, category, severity, signature, evidence_json, status, occurrences,
                       first_seen_at, detected_at, updated_at, last_run_id";

pub(crate) fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<Finding> {
    let id: String = row.get(0)?;
    Ok(Finding {
        id: parse_col(&id)?,
        category: parse_col(&row.get::<_, String>(1)?)?,
        severity: parse_col(&row.get::<_, String>(2)?)?,
        signature: row.get(3)?,
        evidence: parse_json(&row.get::<_, String>(4)?)?,
        status: parse_col(&row.get::<_, String>(5)?)?,
        occurrences: row.get(6)?,
        first_seen_at: parse_ts(&row.get::<_, String>(7)?)?,
        detected_at: parse_ts(&row.get::<_, String>(8)?)?,
        updated_at: parse_ts(&row.get::<_, String>(9)?)?,
        last_run_id: row.get(10)?,
    })
}

#[derive(Clone)]
pub struct FindingStore {
    pool: Pool,
}

impl FindingStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Record an anomaly: refresh the active finding with the same signature,
    /// or create a new open one.
    ///
    /// The read and write share an immediate transaction, so concurrent
    /// detection passes serialize on the database write lock.
    pub fn upsert(&self, anomaly: &Anomaly, run_id: &str, now: DateTime<Utc>) -> Result<Upserted> {
        let now = stored(now);
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let evidence_json = serde_json::to_string(&anomaly.evidence)?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM findings
                     WHERE signature = ?1 AND status IN ('open', 'actioned')"
                ),
                params![anomaly.signature],
                finding_from_row,
            )
            .optional()
            .context("Failed to look up active finding")?;

        let upserted = match existing {
            Some(mut finding) => {
                tx.execute(
                    "UPDATE findings
                     SET severity = ?2, evidence_json = ?3, detected_at = ?4, updated_at = ?4,
                         occurrences = occurrences + 1, last_run_id = ?5
                     WHERE id = ?1",
                    params![
                        finding.id.to_string(),
                        anomaly.severity.as_str(),
                        evidence_json,
                        ts(now),
                        run_id
                    ],
                )?;
                finding.severity = anomaly.severity;
                finding.evidence = anomaly.evidence.clone();
                finding.detected_at = now;
                finding.updated_at = now;
                finding.occurrences += 1;
                finding.last_run_id = Some(run_id.to_string());
                Upserted { finding, created: false }
            }
            None => {
                let finding = Finding {
                    id: Uuid::new_v4(),
                    category: anomaly.category,
                    severity: anomaly.severity,
                    signature: anomaly.signature.clone(),
                    evidence: anomaly.evidence.clone(),
                    status: FindingStatus::Open,
                    occurrences: 1,
                    first_seen_at: now,
                    detected_at: now,
                    updated_at: now,
                    last_run_id: Some(run_id.to_string()),
                };
                tx.execute(
                    "INSERT INTO findings (id, category, severity, signature, evidence_json, status,
                                           occurrences, first_seen_at, detected_at, updated_at, last_run_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'open', 1, ?6, ?6, ?6, ?7)",
                    params![
                        finding.id.to_string(),
                        finding.category.as_str(),
                        finding.severity.as_str(),
                        finding.signature,
                        evidence_json,
                        ts(now),
                        run_id
                    ],
                )
                .context("Failed to insert finding")?;
                Upserted { finding, created: true }
            }
        };

        tx.commit()?;
        Ok(upserted)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Finding>> {
        let conn = self.pool.get()?;
        let finding = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM findings WHERE id = ?1"),
                params![id.to_string()],
                finding_from_row,
            )
            .optional()?;
        Ok(finding)
    }

    /// Move a finding to `to` only if it is currently in one of `from`.
    /// Returns whether the transition happened.
    pub fn transition(
        &self,
        id: Uuid,
        from: &[FindingStatus],
        to: FindingStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.pool.get()?;
        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let changed = conn.execute(
            &format!(
                "UPDATE findings SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND status IN ({allowed})"
            ),
            params![id.to_string(), to.as_str(), ts(now)],
        )?;
        Ok(changed == 1)
    }

    /// Newest first, optionally filtered by status.
    pub fn list(&self, status: Option<FindingStatus>, limit: usize) -> Result<Vec<Finding>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM findings
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY detected_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            finding_from_row,
        )?;
        let mut findings = Vec::new();
        for r in rows {
            findings.push(r?);
        }
        Ok(findings)
    }

    pub fn count_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM findings GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = BTreeMap::new();
        for r in rows {
            let (status, n) = r?;
            counts.insert(status, n);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::temp_pool;
    use chrono::SubsecRound;
    use serde_json::json;

    fn anomaly(signature: &str, severity: Severity) -> Anomaly {
        Anomaly {
            category: Category::ErrorPattern,
            severity,
            signature: signature.to_string(),
            evidence: json!({ "count": 1 }),
        }
    }

    #[test]
    fn test_redetection_updates_instead_of_duplicating() {
        let (_dir, pool) = temp_pool();
        let store = FindingStore::new(pool);
        let now = Utc::now();

        let first = store.upsert(&anomaly("sig-a", Severity::Warning), "run-1", now).unwrap();
        assert!(first.created);

        let mut again = anomaly("sig-a", Severity::Critical);
        again.evidence = json!({ "count": 9 });
        let later = now + chrono::Duration::minutes(60);
        let second = store.upsert(&again, "run-2", later).unwrap();
        assert!(!second.created);
        assert_eq!(second.finding.id, first.finding.id);

        let stored = store.get(first.finding.id).unwrap().unwrap();
        assert_eq!(stored.occurrences, 2);
        assert_eq!(stored.severity, Severity::Critical);
        assert_eq!(stored.evidence, json!({ "count": 9 }));
        assert_eq!(stored.detected_at, later.trunc_subsecs(6));
        assert_eq!(stored.first_seen_at, now.trunc_subsecs(6));
        // What upsert hands back is exactly what was persisted.
        assert_eq!(second.finding.detected_at, stored.detected_at);
        assert_eq!(second.finding.updated_at, stored.updated_at);
        assert_eq!(first.finding.first_seen_at, stored.first_seen_at);
        assert_eq!(store.list(Some(FindingStatus::Open), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_closed_finding_allows_a_fresh_one() {
        let (_dir, pool) = temp_pool();
        let store = FindingStore::new(pool);
        let now = Utc::now();

        let first = store.upsert(&anomaly("sig-b", Severity::Warning), "run-1", now).unwrap();
        assert!(store
            .transition(first.finding.id, &[FindingStatus::Open], FindingStatus::Resolved, now)
            .unwrap());

        let second = store.upsert(&anomaly("sig-b", Severity::Warning), "run-2", now).unwrap();
        assert!(second.created);
        assert_ne!(second.finding.id, first.finding.id);
    }

    #[test]
    fn test_transition_is_guarded_by_current_status() {
        let (_dir, pool) = temp_pool();
        let store = FindingStore::new(pool);
        let now = Utc::now();
        let f = store.upsert(&anomaly("sig-c", Severity::Info), "run-1", now).unwrap().finding;

        assert!(!store
            .transition(f.id, &[FindingStatus::Actioned], FindingStatus::Resolved, now)
            .unwrap());
        assert!(store
            .transition(f.id, &[FindingStatus::Open], FindingStatus::Ignored, now)
            .unwrap());

        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.get("ignored"), Some(&1));
    }
}
