// Schedule resolution: tagged and untagged passes merged into one snapshot

use crate::catalog::{project_stream, CatalogClient, ProjectQuery};
use crate::errors::{CatalogError, ResolutionFailure};
use crate::groups::GroupIndex;
use crate::models::{Project, ScheduleEntry, ScheduleSnapshot, SCHEDULE_TAG};
use crate::policy::SchedulePolicies;
use crate::repo::RepoDetails;
use crate::tag::{derive_engines, TagResolver};
use futures::TryStreamExt;
use std::collections::{BTreeMap, HashSet};
use std::pin::pin;
use tracing::{debug, info, instrument, warn};

type ProjectSchedules = BTreeMap<String, Vec<ScheduleEntry>>;

/// Receives every project excluded from a pass, with the reason
pub trait ResolutionReporter: Send + Sync {
    fn report(&self, project_id: &str, failure: &ResolutionFailure);
}

impl<F> ResolutionReporter for F
where
    F: Fn(&str, &ResolutionFailure) + Send + Sync,
{
    fn report(&self, project_id: &str, failure: &ResolutionFailure) {
        self(project_id, failure)
    }
}

/// Reporter that only relies on the resolver's own logging
pub struct NoopReporter;

impl ResolutionReporter for NoopReporter {
    fn report(&self, _project_id: &str, _failure: &ResolutionFailure) {}
}

pub struct ScheduleResolver<'a> {
    client: &'a dyn CatalogClient,
    policies: &'a SchedulePolicies,
    page_size: usize,
}

impl<'a> ScheduleResolver<'a> {
    pub fn new(client: &'a dyn CatalogClient, policies: &'a SchedulePolicies, page_size: usize) -> Self {
        Self {
            client,
            policies,
            page_size,
        }
    }

    /// Resolve the full catalog into a snapshot.
    ///
    /// Per-project failures go to `reporter`; any catalog failure aborts the
    /// whole resolution so a partial listing never becomes the schedule.
    #[instrument(skip_all)]
    pub async fn resolve(
        &self,
        reporter: &dyn ResolutionReporter,
    ) -> Result<ScheduleSnapshot, CatalogError> {
        let (tagged, grouped) =
            futures::try_join!(self.tagged_pass(reporter), self.untagged_pass(reporter))?;

        info!(
            tagged = tagged.len(),
            grouped = grouped.len(),
            "Resolved project schedules"
        );
        Ok(merge(tagged, grouped))
    }

    fn skip(&self, reporter: &dyn ResolutionReporter, project: &Project, failure: ResolutionFailure) {
        warn!(
            project_id = %project.id,
            project_name = %project.name,
            reason = %failure,
            "Project excluded from schedule"
        );
        reporter.report(&project.id, &failure);
    }

    async fn tagged_pass(
        &self,
        reporter: &dyn ResolutionReporter,
    ) -> Result<ProjectSchedules, CatalogError> {
        let resolver = TagResolver::new(&self.policies.policies);
        let mut schedules = ProjectSchedules::new();
        let mut projects = pin!(project_stream(
            self.client,
            ProjectQuery::tagged(SCHEDULE_TAG),
            self.page_size
        ));

        while let Some(project) = projects.try_next().await? {
            let Some(tag) = project.schedule_tag() else {
                debug!(project_id = %project.id, "Tag filter returned an untagged project");
                continue;
            };

            let details = RepoDetails::new(self.client, &project);
            match resolver.resolve(tag, &details).await? {
                Ok(entry) => {
                    schedules.insert(project.id.clone(), vec![entry]);
                }
                Err(failure) => self.skip(reporter, &project, failure),
            }
        }

        Ok(schedules)
    }

    async fn untagged_pass(
        &self,
        reporter: &dyn ResolutionReporter,
    ) -> Result<ProjectSchedules, CatalogError> {
        let mut schedules = ProjectSchedules::new();
        if !self.policies.has_untagged_sources() {
            return Ok(schedules);
        }

        let index = if self.policies.groups.is_empty() {
            GroupIndex::default()
        } else {
            GroupIndex::build(&self.client.get_groups().await?)
        };

        let mut projects = pin!(project_stream(
            self.client,
            ProjectQuery::all(),
            self.page_size
        ));

        while let Some(project) = projects.try_next().await? {
            if project.has_schedule_tag() {
                continue;
            }

            let details = RepoDetails::new(self.client, &project);
            let (Some(branch), Some(repo_url)) =
                (details.primary_branch().await?, details.repo_url().await?)
            else {
                self.skip(reporter, &project, ResolutionFailure::RepoMisconfigured);
                continue;
            };

            let crons = self.crons_for(&project, &index);
            if crons.is_empty() {
                continue;
            }

            let engines = match derive_engines(&details).await? {
                Ok(engines) => engines,
                Err(failure) => {
                    self.skip(reporter, &project, failure);
                    continue;
                }
            };

            let entries: Result<Vec<ScheduleEntry>, ResolutionFailure> = crons
                .into_iter()
                .map(|cron| {
                    ScheduleEntry::new(&project.id, cron, &branch, engines.clone(), &repo_url)
                })
                .collect();

            match entries {
                Ok(entries) => {
                    schedules.insert(project.id.clone(), entries);
                }
                Err(failure) => self.skip(reporter, &project, failure),
            }
        }

        Ok(schedules)
    }

    /// Crontabs from every binding on the project's groups or their
    /// ancestors, de-duplicated; the default policy when none match
    fn crons_for(&self, project: &Project, index: &GroupIndex) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut crons = Vec::new();

        for group_id in &project.groups {
            let Some(path) = index.path_of(group_id) else {
                debug!(project_id = %project.id, group_id = %group_id, "Project group not in group tree");
                continue;
            };
            for cron in self.policies.groups.schedules_for(path) {
                if seen.insert(cron) {
                    crons.push(cron.to_string());
                }
            }
        }

        if crons.is_empty() {
            if let Some(default) = &self.policies.default_cron {
                crons.push(default.clone());
            }
        }
        crons
    }
}

/// Tag-derived schedules win; group/default schedules fill in the rest
pub fn merge(tagged: ProjectSchedules, mut grouped: ProjectSchedules) -> ScheduleSnapshot {
    grouped.retain(|project_id, _| !tagged.contains_key(project_id));
    tagged.into_iter().chain(grouped).collect()
}
