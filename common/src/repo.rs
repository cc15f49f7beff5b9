// Per-project repository details with lazily fetched secondary configuration

use crate::catalog::CatalogClient;
use crate::errors::CatalogError;
use crate::models::{ConfigurationEntry, Project, RepoManagerConfig};
use std::collections::BTreeSet;
use tokio::sync::OnceCell;

/// Project configuration key holding the repository URL of git projects
pub const GIT_REPOSITORY_KEY: &str = "scan.handler.git.repository";

/// Repository facts for one project during one pass.
///
/// Secondary configuration is fetched at most once per value, and only when
/// a question cannot be answered from the project record itself.
pub struct RepoDetails<'a> {
    client: &'a dyn CatalogClient,
    project: &'a Project,
    repo_manager: OnceCell<Option<RepoManagerConfig>>,
    configuration: OnceCell<Vec<ConfigurationEntry>>,
}

impl<'a> RepoDetails<'a> {
    pub fn new(client: &'a dyn CatalogClient, project: &'a Project) -> Self {
        Self {
            client,
            project,
            repo_manager: OnceCell::new(),
            configuration: OnceCell::new(),
        }
    }

    pub fn project(&self) -> &'a Project {
        self.project
    }

    /// Repository-manager configuration, when the project was imported
    /// through it
    pub async fn repo_manager(&self) -> Result<Option<&RepoManagerConfig>, CatalogError> {
        let Some(repo_id) = self.project.repo_id.as_deref() else {
            return Ok(None);
        };
        let config = self
            .repo_manager
            .get_or_try_init(|| self.client.get_repo_manager_config(repo_id))
            .await?;
        Ok(config.as_ref())
    }

    pub async fn is_scm_imported(&self) -> Result<bool, CatalogError> {
        Ok(self.repo_manager().await?.is_some())
    }

    async fn configuration(&self) -> Result<&[ConfigurationEntry], CatalogError> {
        let entries = self
            .configuration
            .get_or_try_init(|| self.client.get_project_configuration(&self.project.id))
            .await?;
        Ok(entries.as_slice())
    }

    /// Project record, then repository manager, then project configuration
    pub async fn repo_url(&self) -> Result<Option<String>, CatalogError> {
        if let Some(url) = non_empty(&self.project.repo_url) {
            return Ok(Some(url.to_string()));
        }

        if let Some(config) = self.repo_manager().await? {
            if let Some(url) = non_empty(&config.url) {
                return Ok(Some(url.to_string()));
            }
        }

        Ok(self
            .configuration()
            .await?
            .iter()
            .find(|entry| entry.key == GIT_REPOSITORY_KEY)
            .and_then(|entry| non_empty(&entry.value))
            .map(str::to_string))
    }

    /// Project record, then the repository manager's default branch
    pub async fn primary_branch(&self) -> Result<Option<String>, CatalogError> {
        if let Some(branch) = non_empty(&self.project.main_branch) {
            return Ok(Some(branch.to_string()));
        }

        Ok(self
            .repo_manager()
            .await?
            .and_then(RepoManagerConfig::default_branch)
            .map(str::to_string))
    }

    /// Scanners switched on in the repository manager; empty for projects
    /// that are not SCM-imported
    pub async fn enabled_scanners(&self) -> Result<BTreeSet<String>, CatalogError> {
        Ok(self
            .repo_manager()
            .await?
            .map(RepoManagerConfig::enabled_scanners)
            .unwrap_or_default())
    }

    /// Both a repository URL and a primary branch can be determined
    pub async fn is_valid(&self) -> Result<bool, CatalogError> {
        Ok(self.primary_branch().await?.is_some() && self.repo_url().await?.is_some())
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_project_record_takes_precedence() {
        let catalog = StaticCatalog::default();
        let mut p = project("p1");
        p.repo_url = "https://git/app.git".to_string();
        p.main_branch = "main".to_string();

        let details = RepoDetails::new(&catalog, &p);
        assert_eq!(details.repo_url().await.unwrap().as_deref(), Some("https://git/app.git"));
        assert_eq!(details.primary_branch().await.unwrap().as_deref(), Some("main"));
        assert!(!details.is_scm_imported().await.unwrap());
        assert_eq!(catalog.configuration_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repo_manager_fills_gaps_and_is_fetched_once() {
        let mut catalog = StaticCatalog::default();
        catalog.repo_manager.insert(
            "77".to_string(),
            repo_manager("https://github.com/acme/app.git", "develop", &["sast", "sca"]),
        );
        let mut p = project("p1");
        p.repo_id = Some("77".to_string());

        let details = RepoDetails::new(&catalog, &p);
        assert!(details.is_scm_imported().await.unwrap());
        assert_eq!(
            details.repo_url().await.unwrap().as_deref(),
            Some("https://github.com/acme/app.git")
        );
        assert_eq!(details.primary_branch().await.unwrap().as_deref(), Some("develop"));
        assert_eq!(details.enabled_scanners().await.unwrap().len(), 2);
        assert!(details.is_valid().await.unwrap());
        assert_eq!(catalog.repo_manager_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configuration_is_last_resort_for_repo_url() {
        let mut catalog = StaticCatalog::default();
        catalog.configuration.insert(
            "p1".to_string(),
            vec![
                ConfigurationEntry {
                    key: "scan.config.sast.preset".to_string(),
                    value: "ASA".to_string(),
                },
                ConfigurationEntry {
                    key: GIT_REPOSITORY_KEY.to_string(),
                    value: "https://gitlab/acme/app.git".to_string(),
                },
            ],
        );
        let p = project("p1");

        let details = RepoDetails::new(&catalog, &p);
        assert_eq!(
            details.repo_url().await.unwrap().as_deref(),
            Some("https://gitlab/acme/app.git")
        );
        assert_eq!(details.repo_url().await.unwrap().as_deref(), Some("https://gitlab/acme/app.git"));
        assert_eq!(catalog.configuration_calls.load(Ordering::SeqCst), 1);
        // No primary branch anywhere
        assert!(!details.is_valid().await.unwrap());
    }
}
