// Schedule tag resolution: `policy[:branch[:engines]]` → ScheduleEntry

use crate::errors::{CatalogError, ResolutionFailure};
use crate::models::ScheduleEntry;
use crate::policy::PolicyRegistry;
use crate::repo::RepoDetails;
use std::collections::BTreeSet;
use tracing::debug;

/// Engines the scanner knows how to request
pub const KNOWN_ENGINES: [&str; 4] = ["sast", "kics", "sca", "apisec"];

pub fn all_engines() -> BTreeSet<String> {
    KNOWN_ENGINES.iter().map(|e| e.to_string()).collect()
}

pub fn is_known_engine(name: &str) -> bool {
    KNOWN_ENGINES.contains(&name)
}

/// Normalize an explicit engine list.
///
/// `all` anywhere selects every engine. Unknown names are dropped; a list
/// with nothing left also selects every engine.
pub fn normalize_engines(list: &str) -> BTreeSet<String> {
    let requested: Vec<String> = list
        .split(',')
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
        .collect();

    if requested.iter().any(|e| e == "all") {
        return all_engines();
    }

    let known: BTreeSet<String> = requested
        .into_iter()
        .filter(|e| is_known_engine(e))
        .collect();

    if known.is_empty() {
        all_engines()
    } else {
        known
    }
}

/// Engines for a project without an explicit engine list
pub async fn derive_engines(
    details: &RepoDetails<'_>,
) -> Result<Result<BTreeSet<String>, ResolutionFailure>, CatalogError> {
    if !details.is_scm_imported().await? {
        return Ok(Ok(all_engines()));
    }

    let enabled: BTreeSet<String> = details
        .enabled_scanners()
        .await?
        .into_iter()
        .filter(|e| is_known_engine(e))
        .collect();

    if enabled.is_empty() {
        Ok(Err(ResolutionFailure::EnginesUndetermined))
    } else {
        Ok(Ok(enabled))
    }
}

/// Why a tag did not produce an entry
pub(crate) enum Rejection {
    Unresolved(ResolutionFailure),
    Catalog(CatalogError),
}

impl From<ResolutionFailure> for Rejection {
    fn from(failure: ResolutionFailure) -> Self {
        Rejection::Unresolved(failure)
    }
}

impl From<CatalogError> for Rejection {
    fn from(err: CatalogError) -> Self {
        Rejection::Catalog(err)
    }
}

/// Parsed but unresolved tag parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTag<'t> {
    pub policy: &'t str,
    pub branch: Option<&'t str>,
    pub engines: Option<&'t str>,
}

impl<'t> ScheduleTag<'t> {
    /// Split on `:`. Empty parts count as absent.
    pub fn parse(raw: &'t str) -> Self {
        let mut parts = raw.splitn(3, ':').map(str::trim);
        let policy = parts.next().unwrap_or_default();
        let branch = parts.next().filter(|s| !s.is_empty());
        let engines = parts.next().filter(|s| !s.is_empty());
        Self {
            policy,
            branch,
            engines,
        }
    }
}

pub struct TagResolver<'r> {
    policies: &'r PolicyRegistry,
}

impl<'r> TagResolver<'r> {
    pub fn new(policies: &'r PolicyRegistry) -> Self {
        Self { policies }
    }

    /// Resolve a raw tag for one project.
    ///
    /// The outer error is a catalog failure that must abort the pass; the
    /// inner one is a soft per-project failure.
    pub async fn resolve(
        &self,
        raw_tag: &str,
        details: &RepoDetails<'_>,
    ) -> Result<Result<ScheduleEntry, ResolutionFailure>, CatalogError> {
        match self.resolve_entry(raw_tag, details).await {
            Ok(entry) => Ok(Ok(entry)),
            Err(Rejection::Unresolved(failure)) => Ok(Err(failure)),
            Err(Rejection::Catalog(err)) => Err(err),
        }
    }

    async fn resolve_entry(
        &self,
        raw_tag: &str,
        details: &RepoDetails<'_>,
    ) -> Result<ScheduleEntry, Rejection> {
        let tag = ScheduleTag::parse(raw_tag);
        let project = details.project();

        let cron = self
            .policies
            .lookup(tag.policy)
            .ok_or(ResolutionFailure::BadScheduleTag)?;

        let branch = match tag.branch {
            Some(branch) => branch.to_string(),
            None => details
                .primary_branch()
                .await?
                .ok_or(ResolutionFailure::BranchUndetermined)?,
        };

        let engines = match tag.engines {
            Some(list) => normalize_engines(list),
            None => derive_engines(details).await??,
        };

        let repo_url = details
            .repo_url()
            .await?
            .ok_or(ResolutionFailure::RepoUrlMissing)?;

        debug!(project_id = %project.id, tag = %raw_tag, cron, branch = %branch, "Resolved schedule tag");
        Ok(ScheduleEntry::new(&project.id, cron, branch, engines, repo_url)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::test_support::*;

    fn engines(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn registry() -> PolicyRegistry {
        let mut registry = PolicyRegistry::new();
        registry.register("policy_weekly", "0 0 * * 0").unwrap();
        registry
    }

    #[test]
    fn test_normalize_engines() {
        assert_eq!(normalize_engines("sast,KICS"), engines(&["kics", "sast"]));
        assert_eq!(normalize_engines("all"), all_engines());
        assert_eq!(normalize_engines("sast,all"), all_engines());
        assert_eq!(normalize_engines("sast, bogus"), engines(&["sast"]));
        assert_eq!(normalize_engines("bogus"), all_engines());
        assert_eq!(normalize_engines(" , "), all_engines());
    }

    #[test]
    fn test_parse_tag_parts() {
        assert_eq!(
            ScheduleTag::parse("daily::sast,kics"),
            ScheduleTag {
                policy: "daily",
                branch: None,
                engines: Some("sast,kics"),
            }
        );
        assert_eq!(ScheduleTag::parse("hourly").branch, None);
        // Extra separators stay in the engine list
        assert_eq!(ScheduleTag::parse("a:b:c:d").engines, Some("c:d"));
    }

    #[tokio::test]
    async fn test_primary_branch_and_explicit_engines() {
        let catalog = StaticCatalog::default();
        let mut p = project("p1");
        p.main_branch = "main".to_string();
        p.repo_url = "https://git/app.git".to_string();

        let policies = registry();
        let resolver = TagResolver::new(&policies);
        let details = RepoDetails::new(&catalog, &p);
        let entry = resolver
            .resolve("daily::sast,kics", &details)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(entry.branch(), "main");
        assert_eq!(entry.engines(), &engines(&["kics", "sast"]));
        assert_eq!(entry.cron_expression(), crate::policy::DAILY_CRON);
    }

    #[tokio::test]
    async fn test_unknown_policy_is_bad_tag() {
        let catalog = StaticCatalog::default();
        let mut p = project("p1");
        p.repo_url = "https://git/app.git".to_string();

        let policies = registry();
        let resolver = TagResolver::new(&policies);
        let details = RepoDetails::new(&catalog, &p);
        let result = resolver.resolve("nosuchpolicy:main:all", &details).await.unwrap();
        assert_eq!(result.unwrap_err(), ResolutionFailure::BadScheduleTag);

        let result = resolver.resolve(":main:all", &details).await.unwrap();
        assert_eq!(result.unwrap_err(), ResolutionFailure::BadScheduleTag);
    }

    #[tokio::test]
    async fn test_separator_insensitive_policy_token() {
        let catalog = StaticCatalog::default();
        let mut p = project("p1");
        p.repo_url = "https://git/app.git".to_string();

        let policies = registry();
        let resolver = TagResolver::new(&policies);
        let details = RepoDetails::new(&catalog, &p);
        let entry = resolver
            .resolve("Policy-Weekly:release", &details)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.cron_expression(), "0 0 * * 0");
        assert_eq!(entry.branch(), "release");
        assert_eq!(entry.engines(), &all_engines());
    }

    #[tokio::test]
    async fn test_missing_branch_and_repo() {
        let catalog = StaticCatalog::default();
        let p = project("p1");
        let policies = registry();
        let resolver = TagResolver::new(&policies);

        let details = RepoDetails::new(&catalog, &p);
        let result = resolver.resolve("hourly", &details).await.unwrap();
        assert_eq!(result.unwrap_err(), ResolutionFailure::BranchUndetermined);

        let result = resolver.resolve("hourly:dev", &details).await.unwrap();
        assert_eq!(result.unwrap_err(), ResolutionFailure::RepoUrlMissing);
    }

    #[tokio::test]
    async fn test_scm_imported_engines() {
        let mut catalog = StaticCatalog::default();
        catalog.repo_manager.insert(
            "1".to_string(),
            repo_manager("https://github.com/acme/a.git", "main", &["sca", "containers"]),
        );
        catalog.repo_manager.insert(
            "2".to_string(),
            repo_manager("https://github.com/acme/b.git", "main", &["containers"]),
        );

        let policies = registry();
        let resolver = TagResolver::new(&policies);

        let mut with_sca = project("p1");
        with_sca.repo_id = Some("1".to_string());
        let details = RepoDetails::new(&catalog, &with_sca);
        let entry = resolver.resolve("daily", &details).await.unwrap().unwrap();
        assert_eq!(entry.engines(), &engines(&["sca"]));
        assert_eq!(entry.branch(), "main");

        let mut none_known = project("p2");
        none_known.repo_id = Some("2".to_string());
        let details = RepoDetails::new(&catalog, &none_known);
        let result = resolver.resolve("daily", &details).await.unwrap();
        assert_eq!(result.unwrap_err(), ResolutionFailure::EnginesUndetermined);
    }
}
