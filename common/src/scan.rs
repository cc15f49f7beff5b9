// Scan submission seam used by the scan gate

use crate::errors::CatalogError;
use crate::models::{ScanStatus, SCHEDULED_SCAN_TAG};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;

/// What a cron-fired scanner invocation asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub project_id: String,
    pub branch: String,
    pub repo_url: String,
    pub engines: BTreeSet<String>,
    /// Schedule string that fired this request, stamped on the scan tag
    pub schedule: Option<String>,
}

/// A scan ready to send to the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanSubmission {
    /// Direct git scan of a project that manages its own repository settings
    Git {
        project_id: String,
        branch: String,
        repo_url: String,
        engines: BTreeSet<String>,
        schedule: Option<String>,
    },
    /// Scan of an SCM-imported project, routed through the repository manager
    RepoManager {
        scm_id: String,
        org: String,
        scm_type: Option<String>,
        repo_identity: Option<String>,
        repo_id: Option<String>,
        repo_url: String,
        project_id: String,
        branch: String,
        engines: BTreeSet<String>,
    },
}

impl ScanSubmission {
    pub fn git(request: &ScanRequest) -> Self {
        ScanSubmission::Git {
            project_id: request.project_id.clone(),
            branch: request.branch.clone(),
            repo_url: request.repo_url.clone(),
            engines: request.engines.clone(),
            schedule: request.schedule.clone(),
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            ScanSubmission::Git { project_id, .. } | ScanSubmission::RepoManager { project_id, .. } => {
                project_id
            }
        }
    }

    /// Request body for the matching submission endpoint
    pub fn payload(&self) -> Value {
        match self {
            ScanSubmission::Git {
                project_id,
                branch,
                repo_url,
                engines,
                schedule,
            } => {
                let config: Vec<Value> = engines
                    .iter()
                    .map(|engine| json!({ "type": engine, "value": {} }))
                    .collect();
                let mut tags = serde_json::Map::new();
                tags.insert(SCHEDULED_SCAN_TAG.to_string(), json!(schedule));
                json!({
                    "type": "git",
                    "handler": {
                        "branch": branch,
                        "repoUrl": repo_url,
                    },
                    "project": { "id": project_id },
                    "config": config,
                    "tags": tags,
                })
            }
            ScanSubmission::RepoManager {
                scm_type,
                repo_identity,
                repo_id,
                repo_url,
                project_id,
                branch,
                engines,
                ..
            } => json!({
                "repoOrigin": scm_type,
                "project": {
                    "repoIdentity": repo_identity,
                    "repoUrl": repo_url,
                    "projectId": project_id,
                    "defaultBranch": branch,
                    "scannerTypes": engines,
                    "repoId": repo_id,
                },
            }),
        }
    }
}

/// Scan status queries and submission.
///
/// Implemented by the REST catalog client; mocked in gate tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScanService: Send + Sync {
    /// Queued or running scans tagged `scheduled` for a project branch
    async fn count_scheduled_in_flight(
        &self,
        project_id: &str,
        branch: &str,
    ) -> Result<u64, CatalogError>;

    /// Status of the most recent scan for a project branch, if any
    async fn latest_scan_status(
        &self,
        project_id: &str,
        branch: &str,
    ) -> Result<Option<ScanStatus>, CatalogError>;

    /// Submit a scan; the id is absent when the endpoint does not report one
    async fn submit_scan(&self, submission: &ScanSubmission)
        -> Result<Option<String>, CatalogError>;
}
