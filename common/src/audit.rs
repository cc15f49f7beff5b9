// One-shot audit report: what would be scheduled, and what was skipped and why

use crate::catalog::CatalogClient;
use crate::errors::{CatalogError, ResolutionFailure};
use crate::models::ScheduleSnapshot;
use crate::policy::SchedulePolicies;
use crate::resolver::{ResolutionReporter, ScheduleResolver};
use crate::schedule::next_run;
use chrono::{DateTime, SecondsFormat, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use tracing::{info, instrument};

pub const AUDIT_HEADER: [&str; 3] = ["ProjectId", "State", "Details"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditState {
    Scheduled,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRow {
    pub project_id: String,
    pub state: AuditState,
    pub details: String,
}

#[derive(Default)]
struct SkipCollector {
    skipped: Mutex<Vec<(String, ResolutionFailure)>>,
}

impl ResolutionReporter for SkipCollector {
    fn report(&self, project_id: &str, failure: &ResolutionFailure) {
        self.skipped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((project_id.to_string(), failure.clone()));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    rows: Vec<AuditRow>,
}

impl AuditReport {
    /// One `SCHEDULED` row per entry and one `SKIPPED` row per failure,
    /// ordered by project id
    pub fn build(
        snapshot: &ScheduleSnapshot,
        skipped: Vec<(String, ResolutionFailure)>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut rows: Vec<AuditRow> = snapshot
            .iter()
            .flat_map(|(project_id, entries)| {
                entries.iter().map(move |entry| {
                    let engines: Vec<&str> = entry.engines().iter().map(String::as_str).collect();
                    let next = next_run(entry.cron_expression(), now)
                        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                        .unwrap_or_else(|| "never".to_string());
                    AuditRow {
                        project_id: project_id.to_string(),
                        state: AuditState::Scheduled,
                        details: format!(
                            "schedule={} branch={} engines={} repo={} next_run={}",
                            entry.cron_expression(),
                            entry.branch(),
                            engines.join(","),
                            entry.repo_url(),
                            next
                        ),
                    }
                })
            })
            .collect();

        rows.extend(skipped.into_iter().map(|(project_id, failure)| AuditRow {
            project_id,
            state: AuditState::Skipped,
            details: failure.to_string(),
        }));

        rows.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Self { rows }
    }

    pub fn rows(&self) -> &[AuditRow] {
        &self.rows
    }

    pub fn count(&self, state: AuditState) -> usize {
        self.rows.iter().filter(|r| r.state == state).count()
    }

    /// The header is written even when there are no rows
    pub fn write_csv<W: Write>(&self, out: W) -> Result<(), csv::Error> {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(out);
        writer.write_record(AUDIT_HEADER)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Resolve the catalog once without touching any trigger files
#[instrument(skip_all)]
pub async fn run_audit(
    client: &dyn CatalogClient,
    policies: &SchedulePolicies,
    page_size: usize,
    now: DateTime<Utc>,
) -> Result<AuditReport, CatalogError> {
    let collector = SkipCollector::default();
    let snapshot = ScheduleResolver::new(client, policies, page_size)
        .resolve(&collector)
        .await?;

    let skipped = collector
        .skipped
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let report = AuditReport::build(&snapshot, skipped, now);

    info!(
        scheduled = report.count(AuditState::Scheduled),
        skipped = report.count(AuditState::Skipped),
        "Audit complete"
    );
    Ok(report)
}
