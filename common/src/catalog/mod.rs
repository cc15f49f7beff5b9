// Catalog access: the transport trait and the lazy paginated project stream

pub mod endpoints;
pub mod rest;

pub use endpoints::Endpoints;
pub use rest::RestCatalogClient;

use crate::errors::CatalogError;
use crate::models::{ConfigurationEntry, GroupNode, Project, ProjectPage, RepoManagerConfig};
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use tracing::debug;

/// Which projects a listing should return
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectQuery {
    /// Only projects carrying this tag key
    pub tag_key: Option<String>,
}

impl ProjectQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tagged(key: impl Into<String>) -> Self {
        Self {
            tag_key: Some(key.into()),
        }
    }
}

/// Read-only access to the project catalog.
///
/// Implementations own retries and authentication; an error returned here
/// means the transport gave up.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch one page of projects starting at `offset`
    async fn list_projects(
        &self,
        offset: usize,
        limit: usize,
        query: &ProjectQuery,
    ) -> Result<ProjectPage, CatalogError>;

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, CatalogError>;

    /// Full group hierarchy
    async fn get_groups(&self) -> Result<Vec<GroupNode>, CatalogError>;

    /// Repository-manager configuration; `None` when the repo is unknown
    async fn get_repo_manager_config(
        &self,
        repo_id: &str,
    ) -> Result<Option<RepoManagerConfig>, CatalogError>;

    async fn get_project_configuration(
        &self,
        project_id: &str,
    ) -> Result<Vec<ConfigurationEntry>, CatalogError>;
}

struct PageCursor {
    offset: usize,
    buffer: VecDeque<Project>,
    exhausted: bool,
}

/// Lazily page through projects matching `query`.
///
/// Each call starts again from offset 0. A failed page fetch ends the stream
/// with that error rather than a shortened listing.
pub fn project_stream<'a>(
    client: &'a dyn CatalogClient,
    query: ProjectQuery,
    page_size: usize,
) -> impl Stream<Item = Result<Project, CatalogError>> + Send + 'a {
    let cursor = PageCursor {
        offset: 0,
        buffer: VecDeque::new(),
        exhausted: false,
    };
    let page_size = page_size.max(1);

    stream::try_unfold(cursor, move |mut cursor| {
        let query = query.clone();
        async move {
            loop {
                if let Some(project) = cursor.buffer.pop_front() {
                    return Ok(Some((project, cursor)));
                }
                if cursor.exhausted {
                    return Ok(None);
                }

                let page = client.list_projects(cursor.offset, page_size, &query).await?;
                debug!(
                    offset = cursor.offset,
                    items = page.item_count,
                    total = ?page.total_count,
                    "Fetched project page"
                );

                if page.item_count == 0 {
                    return match page.total_count {
                        Some(total) if (cursor.offset as u64) < total => {
                            Err(CatalogError::MalformedResponse {
                                operation: "list_projects".to_string(),
                                reason: format!(
                                    "empty page at offset {} of {} projects",
                                    cursor.offset, total
                                ),
                            })
                        }
                        _ => Ok(None),
                    };
                }

                cursor.offset += page.item_count;
                if let Some(total) = page.total_count {
                    cursor.exhausted = cursor.offset as u64 >= total;
                }
                cursor.buffer.extend(page.projects);
            }
        }
    })
}
