// REST transport for the catalog and scan services
//
// OAuth2 client-credentials auth with a shared bearer token. A 401 refreshes
// the token once per stale value; transport errors, 5xx and 429 are retried
// with the configured backoff.

use crate::catalog::{CatalogClient, Endpoints, ProjectQuery};
use crate::config::{CatalogConfig, Credentials, TenantConfig};
use crate::errors::CatalogError;
use crate::models::{
    ConfigurationEntry, GroupNode, Project, ProjectPage, RepoManagerConfig, ScanRecord, ScanStatus,
    SCHEDULED_SCAN_TAG,
};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::scan::{ScanService, ScanSubmission};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

const API_ACCEPT: &str = "*/*; version=1.0";

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanListing {
    #[serde(default)]
    scans: Option<Vec<ScanRecord>>,
    #[serde(default)]
    filtered_total_count: Option<u64>,
    #[serde(default)]
    total_count: Option<u64>,
}

/// Catalog and scan client over the tenant's REST API
pub struct RestCatalogClient {
    http: Client,
    endpoints: Endpoints,
    credentials: Credentials,
    user_agent: String,
    correlation_id: String,
    token: RwLock<Option<String>>,
    auth_lock: Mutex<()>,
    retry: Arc<dyn RetryStrategy>,
}

impl RestCatalogClient {
    pub fn new(
        endpoints: Endpoints,
        credentials: Credentials,
        tenant: &TenantConfig,
        catalog: &CatalogConfig,
        agent: &str,
    ) -> Result<Self, CatalogError> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(catalog.timeout_seconds))
            .danger_accept_invalid_certs(!tenant.ssl_verify);

        if let Some(proxy) = tenant.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| CatalogError::Communication {
                operation: "client setup".to_string(),
                reason: format!("invalid proxy: {}", e),
            })?;
            builder = builder.proxy(proxy);
        }

        let http = builder.build().map_err(|e| CatalogError::Communication {
            operation: "client setup".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            http,
            endpoints,
            credentials,
            user_agent: format!("{}/{}", agent, env!("CARGO_PKG_VERSION")),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            token: RwLock::new(None),
            auth_lock: Mutex::new(()),
            retry: Arc::new(ExponentialBackoff::from_catalog(catalog)),
        })
    }

    pub fn with_retry_strategy(mut self, retry: Arc<dyn RetryStrategy>) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    async fn current_token(&self) -> Result<String, CatalogError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        self.refresh_token(None).await
    }

    /// Fetch a new token unless another task already replaced `stale`
    async fn refresh_token(&self, stale: Option<&str>) -> Result<String, CatalogError> {
        let _guard = self.auth_lock.lock().await;

        if let Some(current) = self.token.read().await.as_deref() {
            if Some(current) != stale {
                return Ok(current.to_string());
            }
        }

        let token = self.request_token().await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    #[instrument(skip(self), fields(token_url = %self.endpoints.token_url))]
    async fn request_token(&self) -> Result<String, CatalogError> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];

        let mut attempt = 0;
        loop {
            let result = self
                .http
                .post(&self.endpoints.token_url)
                .header(ACCEPT, "application/json")
                .header(USER_AGENT, &self.user_agent)
                .form(&params)
                .send()
                .await;

            let reason = match result {
                Ok(response) if response.status().is_success() => {
                    let body: TokenResponse =
                        response.json().await.map_err(|e| CatalogError::MalformedResponse {
                            operation: "authenticate".to_string(),
                            reason: e.to_string(),
                        })?;
                    debug!("Obtained access token");
                    return Ok(body.access_token);
                }
                Ok(response) if response.status().is_client_error() => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(CatalogError::Authentication(format!(
                        "token request rejected with status {}: {}",
                        status, body
                    )));
                }
                Ok(response) => format!("status {}", response.status()),
                Err(e) => e.to_string(),
            };

            match self.retry.next_delay(attempt) {
                Some(delay) => {
                    warn!(attempt = attempt + 1, reason = %reason, "Token request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    return Err(CatalogError::Communication {
                        operation: "authenticate".to_string(),
                        reason,
                    })
                }
            }
        }
    }

    /// Send an authenticated request built by `build`, retrying per strategy
    async fn send<F>(&self, operation: &str, build: F) -> Result<Response, CatalogError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let token = self.current_token().await?;
            let result = build(&self.http)
                .bearer_auth(&token)
                .header(ACCEPT, API_ACCEPT)
                .header(USER_AGENT, &self.user_agent)
                .header("CorrelationId", &self.correlation_id)
                .send()
                .await;

            let (reason, backoff) = match result {
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    debug!(operation, "Access token rejected, re-authenticating");
                    self.refresh_token(Some(&token)).await?;
                    ("status 401".to_string(), false)
                }
                Ok(response)
                    if response.status().is_server_error()
                        || response.status() == StatusCode::TOO_MANY_REQUESTS =>
                {
                    (format!("status {}", response.status()), true)
                }
                Ok(response) => return Ok(response),
                Err(e) => (e.to_string(), true),
            };

            match self.retry.next_delay(attempt) {
                Some(delay) => {
                    warn!(operation, attempt = attempt + 1, reason = %reason, "Catalog request failed, retrying");
                    if backoff {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                None => {
                    return Err(CatalogError::Communication {
                        operation: operation.to_string(),
                        reason,
                    })
                }
            }
        }
    }

    async fn decode<T: DeserializeOwned>(
        operation: &str,
        response: Response,
    ) -> Result<T, CatalogError> {
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::UnexpectedStatus {
                operation: operation.to_string(),
                status: status.as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| CatalogError::MalformedResponse {
                operation: operation.to_string(),
                reason: e.to_string(),
            })
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.endpoints.api_base, path)
    }

    fn admin(&self, path: &str) -> String {
        format!("{}{}", self.endpoints.admin_base, path)
    }

    async fn list_scans(
        &self,
        operation: &str,
        query: &[(&str, String)],
    ) -> Result<ScanListing, CatalogError> {
        let url = self.api("scans");
        let response = self
            .send(operation, |c| c.get(&url).query(query))
            .await?;
        Self::decode(operation, response).await
    }
}

/// Decode a page, dropping records that do not form a valid project.
///
/// A missing or non-array `projects` is only an empty page when the
/// response also reports a total of zero.
fn parse_project_page(body: Value) -> Result<ProjectPage, CatalogError> {
    let total_count = body
        .get("filteredTotalCount")
        .and_then(Value::as_u64)
        .or_else(|| body.get("totalCount").and_then(Value::as_u64));

    let raw = match body.get("projects") {
        Some(Value::Array(items)) => items.clone(),
        None | Some(Value::Null) if total_count == Some(0) => Vec::new(),
        other => {
            return Err(CatalogError::MalformedResponse {
                operation: "list_projects".to_string(),
                reason: format!(
                    "expected a projects array, found {} (total {:?})",
                    other.map_or("nothing", json_kind),
                    total_count
                ),
            })
        }
    };

    let item_count = raw.len();
    let projects = raw
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<Project>(item) {
            Ok(project) => Some(project),
            Err(e) => {
                warn!(error = %e, "Skipping malformed project record");
                None
            }
        })
        .collect();

    Ok(ProjectPage {
        projects,
        item_count,
        total_count,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl CatalogClient for RestCatalogClient {
    #[instrument(skip(self))]
    async fn list_projects(
        &self,
        offset: usize,
        limit: usize,
        query: &ProjectQuery,
    ) -> Result<ProjectPage, CatalogError> {
        let url = self.api("projects");
        let mut params = vec![("offset", offset.to_string()), ("limit", limit.to_string())];
        if let Some(key) = &query.tag_key {
            params.push(("tags-keys", key.clone()));
        }

        let response = self
            .send("list_projects", |c| c.get(&url).query(&params))
            .await?;
        let body: Value = Self::decode("list_projects", response).await?;
        parse_project_page(body)
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<Project>, CatalogError> {
        let url = self.api(&format!("projects/{}", project_id));
        let response = self.send("get_project", |c| c.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode("get_project", response).await.map(Some)
    }

    async fn get_groups(&self) -> Result<Vec<GroupNode>, CatalogError> {
        let url = self.admin("groups");
        let response = self
            .send("get_groups", |c| {
                c.get(&url).query(&[("briefRepresentation", "true")])
            })
            .await?;
        Self::decode("get_groups", response).await
    }

    async fn get_repo_manager_config(
        &self,
        repo_id: &str,
    ) -> Result<Option<RepoManagerConfig>, CatalogError> {
        let url = self.api(&format!("repos-manager/repo/{}", repo_id));
        let response = self.send("get_repo_manager_config", |c| c.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(repo_id, "Repository unknown to the repository manager");
            return Ok(None);
        }
        Self::decode("get_repo_manager_config", response)
            .await
            .map(Some)
    }

    async fn get_project_configuration(
        &self,
        project_id: &str,
    ) -> Result<Vec<ConfigurationEntry>, CatalogError> {
        let url = self.api("configuration/project");
        let response = self
            .send("get_project_configuration", |c| {
                c.get(&url).query(&[("project-id", project_id)])
            })
            .await?;
        let entries: Option<Vec<ConfigurationEntry>> =
            Self::decode("get_project_configuration", response).await?;
        Ok(entries.unwrap_or_default())
    }
}

#[async_trait]
impl ScanService for RestCatalogClient {
    async fn count_scheduled_in_flight(
        &self,
        project_id: &str,
        branch: &str,
    ) -> Result<u64, CatalogError> {
        let query = [
            ("project-id", project_id.to_string()),
            ("branch", branch.to_string()),
            ("statuses", "Queued,Running".to_string()),
            ("tags-keys", SCHEDULED_SCAN_TAG.to_string()),
            ("limit", "1".to_string()),
        ];
        let listing = self.list_scans("count_scheduled_in_flight", &query).await?;
        listing
            .filtered_total_count
            .or(listing.total_count)
            .ok_or_else(|| CatalogError::MalformedResponse {
                operation: "count_scheduled_in_flight".to_string(),
                reason: "scan listing carries no count".to_string(),
            })
    }

    async fn latest_scan_status(
        &self,
        project_id: &str,
        branch: &str,
    ) -> Result<Option<ScanStatus>, CatalogError> {
        let query = [
            ("project-id", project_id.to_string()),
            ("branch", branch.to_string()),
            ("limit", "1".to_string()),
            ("offset", "0".to_string()),
            ("sort", "-created_at".to_string()),
        ];
        let listing = self.list_scans("latest_scan_status", &query).await?;
        Ok(listing
            .scans
            .unwrap_or_default()
            .first()
            .map(|scan| scan.status))
    }

    #[instrument(skip(self, submission), fields(project_id = %submission.project_id()))]
    async fn submit_scan(
        &self,
        submission: &ScanSubmission,
    ) -> Result<Option<String>, CatalogError> {
        let payload = submission.payload();
        let response = match submission {
            ScanSubmission::Git { .. } => {
                let url = self.api("scans");
                self.send("submit_scan", |c| c.post(&url).json(&payload))
                    .await?
            }
            ScanSubmission::RepoManager {
                scm_id,
                org,
                project_id,
                ..
            } => {
                let url = self.api(&format!(
                    "repos-manager/scms/{}/orgs/{}/repo/projectScan",
                    scm_id, org
                ));
                self.send("submit_scan", |c| {
                    c.post(&url)
                        .query(&[("projectId", project_id.as_str())])
                        .json(&payload)
                })
                .await?
            }
        };

        let body: Value = Self::decode("submit_scan", response).await?;
        Ok(body.get("id").and_then(|id| match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FixedDelay;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> RestCatalogClient {
        let endpoints = Endpoints {
            token_url: format!("{}/token", server.uri()),
            admin_base: format!("{}/admin/", server.uri()),
            api_base: format!("{}/api/", server.uri()),
        };
        let credentials = Credentials {
            tenant: "acme".to_string(),
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
        };
        let tenant = TenantConfig {
            name: "acme".to_string(),
            region: "US".to_string(),
            auth_url: None,
            admin_url: None,
            api_url: None,
            client_id: None,
            client_secret: None,
            secrets_dir: None,
            ssl_verify: true,
            proxy: None,
        };
        RestCatalogClient::new(
            endpoints,
            credentials,
            &tenant,
            &CatalogConfig::default(),
            "scan-scheduler-test",
        )
        .unwrap()
        .with_retry_strategy(Arc::new(FixedDelay::new(Duration::from_millis(1), 2)))
    }

    async fn mount_token(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": token})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_list_projects_skips_malformed_records() {
        let server = MockServer::start().await;
        mount_token(&server, "t1").await;

        Mock::given(method("GET"))
            .and(path("/api/projects"))
            .and(query_param("tags-keys", "schedule"))
            .and(header("Authorization", "Bearer t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalCount": 10,
                "filteredTotalCount": 3,
                "projects": [
                    {"id": "p1", "name": "one", "tags": {"schedule": "daily"}},
                    {"name": "missing id"},
                    {"id": "p3", "name": "three", "tags": {"schedule": "hourly"}}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let page = client
            .list_projects(0, 100, &ProjectQuery::tagged("schedule"))
            .await
            .unwrap();

        assert_eq!(page.item_count, 3);
        assert_eq!(page.total_count, Some(3));
        let ids: Vec<&str> = page.projects.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "stale"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_token(&server, "fresh").await;

        Mock::given(method("GET"))
            .and(path("/admin/groups"))
            .and(header("Authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/groups"))
            .and(header("Authorization", "Bearer fresh"))
            .and(query_param("briefRepresentation", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "g1", "path": "/eng", "subGroups": [{"id": "g2", "path": "/eng/web"}]}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let groups = client.get_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].sub_groups[0].path, "/eng/web");
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_communication_error() {
        let server = MockServer::start().await;
        mount_token(&server, "t1").await;

        Mock::given(method("GET"))
            .and(path("/api/projects"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .list_projects(0, 10, &ProjectQuery::all())
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Communication { .. }));
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.get_groups().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_repo_manager_not_found_is_none() {
        let server = MockServer::start().await;
        mount_token(&server, "t1").await;
        Mock::given(method("GET"))
            .and(path("/api/repos-manager/repo/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.get_repo_manager_config("42").await.unwrap().is_none());
    }

    #[test]
    fn test_page_without_projects_array_is_malformed() {
        for body in [
            json!({"totalCount": 5}),
            json!({"totalCount": 5, "projects": null}),
            json!({"totalCount": 0, "projects": {"id": "p1"}}),
            json!({}),
        ] {
            let result = parse_project_page(body.clone());
            assert!(
                matches!(result, Err(CatalogError::MalformedResponse { .. })),
                "{} should be rejected",
                body
            );
        }
    }

    #[test]
    fn test_empty_page_with_zero_total() {
        for body in [
            json!({"totalCount": 0, "projects": null}),
            json!({"filteredTotalCount": 0}),
            json!({"totalCount": 0, "projects": []}),
        ] {
            let page = parse_project_page(body).unwrap();
            assert_eq!(page.item_count, 0);
            assert_eq!(page.total_count, Some(0));
        }
    }

    #[tokio::test]
    async fn test_scan_count_missing_is_error() {
        let server = MockServer::start().await;
        mount_token(&server, "t1").await;
        Mock::given(method("GET"))
            .and(path("/api/scans"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"scans": []})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let result = client.count_scheduled_in_flight("p1", "main").await;
        assert!(matches!(result, Err(CatalogError::MalformedResponse { .. })));
    }

    #[tokio::test]
    async fn test_count_scheduled_in_flight() {
        let server = MockServer::start().await;
        mount_token(&server, "t1").await;
        Mock::given(method("GET"))
            .and(path("/api/scans"))
            .and(query_param("project-id", "p1"))
            .and(query_param("branch", "main"))
            .and(query_param("statuses", "Queued,Running"))
            .and(query_param("tags-keys", "scheduled"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalCount": 12,
                "filteredTotalCount": 1,
                "scans": [{"id": "s1", "status": "Running"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(client.count_scheduled_in_flight("p1", "main").await.unwrap(), 1);
        assert_eq!(
            client.latest_scan_status("p1", "main").await.unwrap(),
            Some(ScanStatus::Running)
        );
    }

    #[tokio::test]
    async fn test_submit_git_scan() {
        let server = MockServer::start().await;
        mount_token(&server, "t1").await;
        Mock::given(method("POST"))
            .and(path("/api/scans"))
            .and(body_partial_json(json!({
                "type": "git",
                "project": {"id": "p1"},
                "tags": {"scheduled": "0 2 * * *"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "scan-9"})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let submission = ScanSubmission::Git {
            project_id: "p1".to_string(),
            branch: "main".to_string(),
            repo_url: "https://github.com/acme/app.git".to_string(),
            engines: ["sast".to_string()].into_iter().collect(),
            schedule: Some("0 2 * * *".to_string()),
        };
        let id = client.submit_scan(&submission).await.unwrap();
        assert_eq!(id.as_deref(), Some("scan-9"));
    }

    #[tokio::test]
    async fn test_submit_repo_manager_scan() {
        let server = MockServer::start().await;
        mount_token(&server, "t1").await;
        Mock::given(method("POST"))
            .and(path("/api/repos-manager/scms/scm-1/orgs/acme/repo/projectScan"))
            .and(query_param("projectId", "p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let submission = ScanSubmission::RepoManager {
            scm_id: "scm-1".to_string(),
            org: "acme".to_string(),
            scm_type: Some("GITHUB".to_string()),
            repo_identity: None,
            repo_id: Some("7".to_string()),
            repo_url: "https://github.com/acme/app.git".to_string(),
            project_id: "p1".to_string(),
            branch: "main".to_string(),
            engines: ["sast".to_string()].into_iter().collect(),
        };
        assert_eq!(client.submit_scan(&submission).await.unwrap(), None);
    }
}
