use crate::errors::ResolutionFailure;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Tag key carrying an explicit schedule override
pub const SCHEDULE_TAG: &str = "schedule";

/// Tag key stamped on scans submitted by the scanner
pub const SCHEDULED_SCAN_TAG: &str = "scheduled";

// Catalog ids arrive as strings or integers depending on the endpoint
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, found {}",
            other
        ))),
    }
}

fn optional_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, found {}",
            other
        ))),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Catalog records
// ============================================================================

/// Project as returned by the catalog. `id` is required; everything else
/// may be missing on older tenants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub repo_url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub main_branch: String,
    /// Present when the project was imported through the repository manager
    #[serde(default, deserialize_with = "optional_id_string")]
    pub repo_id: Option<String>,
}

impl Project {
    pub fn schedule_tag(&self) -> Option<&str> {
        self.tags.get(SCHEDULE_TAG).map(String::as_str)
    }

    pub fn has_schedule_tag(&self) -> bool {
        self.tags.contains_key(SCHEDULE_TAG)
    }
}

/// One page of the project listing
#[derive(Debug, Clone, Default)]
pub struct ProjectPage {
    pub projects: Vec<Project>,
    /// Number of raw items on the page, including rejected ones
    pub item_count: usize,
    pub total_count: Option<u64>,
}

/// Node of the group hierarchy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupNode {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sub_groups: Vec<GroupNode>,
}

/// Branch known to the repository manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepoBranch {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_default_branch: bool,
}

/// Repository-manager configuration of an SCM-imported project
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoManagerConfig {
    #[serde(default, deserialize_with = "optional_id_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub branches: Vec<RepoBranch>,
    #[serde(default, alias = "origin")]
    pub scm_type: Option<String>,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub scm_id: Option<String>,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub repo_identity: Option<String>,
    /// Scanner toggles such as `sastScannerEnabled`
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl RepoManagerConfig {
    pub fn default_branch(&self) -> Option<&str> {
        self.branches
            .iter()
            .find(|b| b.is_default_branch && !b.name.is_empty())
            .map(|b| b.name.as_str())
    }

    /// Lower-cased engine names from `<engine>ScannerEnabled = true` flags
    pub fn enabled_scanners(&self) -> BTreeSet<String> {
        self.extra
            .iter()
            .filter(|(_, v)| v.as_bool().unwrap_or(false))
            .filter_map(|(k, _)| {
                k.to_lowercase()
                    .strip_suffix("scannerenabled")
                    .filter(|engine| !engine.is_empty())
                    .map(str::to_string)
            })
            .collect()
    }
}

/// Key/value pair from the project configuration endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigurationEntry {
    pub key: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub value: String,
}

/// Scan lifecycle states reported by the catalog
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Partial,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl ScanStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(self, ScanStatus::Queued | ScanStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Queued => "Queued",
            ScanStatus::Running => "Running",
            ScanStatus::Completed => "Completed",
            ScanStatus::Partial => "Partial",
            ScanStatus::Failed => "Failed",
            ScanStatus::Canceled => "Canceled",
            ScanStatus::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub status: ScanStatus,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

// ============================================================================
// Schedule values
// ============================================================================

/// One resolved schedule for a project.
///
/// Fields are private so an entry can only be built through [`ScheduleEntry::new`],
/// which refuses empty branches, engine sets and repository URLs. Equality and
/// hashing go through [`ScheduleEntry::serialized`].
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntry {
    project_id: String,
    cron_expression: String,
    branch: String,
    engines: BTreeSet<String>,
    repo_url: String,
}

impl ScheduleEntry {
    pub fn new(
        project_id: impl Into<String>,
        cron_expression: impl Into<String>,
        branch: impl Into<String>,
        engines: BTreeSet<String>,
        repo_url: impl Into<String>,
    ) -> Result<Self, ResolutionFailure> {
        let branch = branch.into();
        let repo_url = repo_url.into();

        if branch.trim().is_empty() {
            return Err(ResolutionFailure::BranchUndetermined);
        }
        if engines.is_empty() {
            return Err(ResolutionFailure::EnginesUndetermined);
        }
        if repo_url.trim().is_empty() {
            return Err(ResolutionFailure::RepoUrlMissing);
        }

        Ok(Self {
            project_id: project_id.into(),
            cron_expression: cron_expression.into(),
            branch,
            engines,
            repo_url,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn cron_expression(&self) -> &str {
        &self.cron_expression
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn engines(&self) -> &BTreeSet<String> {
        &self.engines
    }

    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    /// Stable textual form used for equality and diffing. Field values may
    /// contain `:` (repo URLs), so this is the JSON encoding, not `Display`.
    pub fn serialized(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }
}

impl fmt::Display for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let engines: Vec<&str> = self.engines.iter().map(String::as_str).collect();
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.project_id,
            self.repo_url,
            self.branch,
            engines.join(","),
            self.cron_expression
        )
    }
}

impl PartialEq for ScheduleEntry {
    fn eq(&self, other: &Self) -> bool {
        self.serialized() == other.serialized()
    }
}

impl Eq for ScheduleEntry {}

impl Hash for ScheduleEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized().hash(state);
    }
}

/// Immutable mapping project id → schedule entries for one resolution pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleSnapshot {
    projects: BTreeMap<String, Vec<ScheduleEntry>>,
}

impl ScheduleSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, project_id: &str) -> Option<&[ScheduleEntry]> {
        self.projects.get(project_id).map(Vec::as_slice)
    }

    pub fn contains(&self, project_id: &str) -> bool {
        self.projects.contains_key(project_id)
    }

    pub fn project_ids(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ScheduleEntry])> {
        self.projects
            .iter()
            .map(|(id, entries)| (id.as_str(), entries.as_slice()))
    }

    /// Number of projects
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Number of entries across all projects
    pub fn entry_count(&self) -> usize {
        self.projects.values().map(Vec::len).sum()
    }

    /// Record what a store now holds for a project; empty lists are dropped
    pub(crate) fn insert(&mut self, project_id: &str, entries: Vec<ScheduleEntry>) {
        if entries.is_empty() {
            self.projects.remove(project_id);
        } else {
            self.projects.insert(project_id.to_string(), entries);
        }
    }

    pub(crate) fn remove(&mut self, project_id: &str) {
        self.projects.remove(project_id);
    }
}

impl FromIterator<(String, Vec<ScheduleEntry>)> for ScheduleSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, Vec<ScheduleEntry>)>>(iter: I) -> Self {
        Self {
            projects: iter
                .into_iter()
                .filter(|(_, entries)| !entries.is_empty())
                .collect(),
        }
    }
}

impl IntoIterator for ScheduleSnapshot {
    type Item = (String, Vec<ScheduleEntry>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Vec<ScheduleEntry>>;

    fn into_iter(self) -> Self::IntoIter {
        self.projects.into_iter()
    }
}
