//! GraphQL client for a Suwayomi server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::{CatalogError, CatalogManga, JobStatus, LOCAL_SOURCE_NAME, RemoteCatalog};
use crate::config::{DEFAULT_GRAPHQL_URL, ExtensionConfig};
use crate::download::{ClientOptions, HttpClient, RetryDecision, RetryPolicy, Stage};

// ==================== Queries ====================

const SOURCES_QUERY: &str = "query FetchSources { sources { nodes { id name } } }";

const FIND_CATEGORY_QUERY: &str = "query FindCategory($name: String!) { \
     categories(filter: { name: { equalTo: $name } }) { nodes { id name } } }";

const CREATE_CATEGORY_MUTATION: &str = "mutation CreateCategory($name: String!) { \
     createCategory(input: { name: $name }) { category { id name } } }";

const MANGAS_BY_TITLE_QUERY: &str = "query MangasByTitle($sourceId: LongString!, $title: String!) { \
     mangas(filter: { sourceId: { equalTo: $sourceId }, title: { equalTo: $title } }) { \
     nodes { id title inLibrary categories { nodes { id } } } } }";

const MANGAS_NOT_IN_LIBRARY_QUERY: &str = "query MangasNotInLibrary($sourceId: LongString!) { \
     mangas(filter: { sourceId: { equalTo: $sourceId }, inLibrary: { equalTo: false } }) { \
     nodes { id title } } }";

const SET_IN_LIBRARY_MUTATION: &str = "mutation AddMangasToLibrary($ids: [Int!]!) { \
     updateMangas(input: { ids: $ids, patch: { inLibrary: true } }) { clientMutationId } }";

const ADD_TO_CATEGORY_MUTATION: &str = "mutation AddMangasToCategory($ids: [Int!]!, $categoryId: Int!) { \
     updateMangasCategories(input: { ids: $ids, patch: { addToCategories: [$categoryId] } }) { \
     mangas { id title } } }";

const FETCH_SOURCE_LATEST_MUTATION: &str = "mutation FetchSourceLatest($sourceId: LongString!, $page: Int!) { \
     fetchSourceManga(input: { source: $sourceId, page: $page, type: LATEST }) { \
     hasNextPage mangas { id title inLibrary } } }";

const UPDATE_CATEGORY_MUTATION: &str = "mutation UpdateCategory($categoryId: Int!) { \
     updateLibrary(input: { categories: [$categoryId] }) { \
     updateStatus { jobsInfo { isRunning totalJobs finishedJobs } } } }";

const UPDATE_STATUS_QUERY: &str = "query LibraryUpdateStatus { \
     libraryUpdateStatus { jobsInfo { isRunning totalJobs finishedJobs } } }";

// ==================== Response Types ====================

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlErrorEntry>>,
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorEntry {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SourceNode {
    id: Value,
    name: String,
}

#[derive(Debug, Deserialize)]
struct SourcesData {
    sources: Nodes<SourceNode>,
}

#[derive(Debug, Deserialize)]
struct IdNode {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct CategoriesData {
    categories: Nodes<IdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCategoryData {
    create_category: CreatedCategory,
}

#[derive(Debug, Deserialize)]
struct CreatedCategory {
    category: IdNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MangaNode {
    id: i64,
    title: String,
    #[serde(default)]
    in_library: bool,
    categories: Option<Nodes<IdNode>>,
}

impl From<MangaNode> for CatalogManga {
    fn from(node: MangaNode) -> Self {
        Self {
            id: node.id,
            title: node.title,
            in_library: node.in_library,
            category_ids: node
                .categories
                .map(|c| c.nodes.into_iter().map(|n| n.id).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MangasData {
    mangas: Nodes<MangaNode>,
}

/// `jobsInfo` is a single object on most servers and a list on some.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobsInfo {
    Many(Vec<JobStatus>),
    One(JobStatus),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStatus {
    jobs_info: JobsInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateStatusData {
    library_update_status: UpdateStatus,
}

// ==================== SuwayomiClient ====================

/// Connection settings for [`SuwayomiClient`].
#[derive(Clone)]
pub struct SuwayomiClientOptions {
    /// GraphQL endpoint.
    pub graphql_url: String,
    /// HTTP basic auth user.
    pub username: Option<String>,
    /// HTTP basic auth password.
    pub password: Option<String>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Read timeout.
    pub read_timeout: Duration,
    /// Attempts per request for transient failures.
    pub max_attempts: u32,
}

impl std::fmt::Debug for SuwayomiClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuwayomiClientOptions")
            .field("graphql_url", &self.graphql_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Default for SuwayomiClientOptions {
    fn default() -> Self {
        let transport = ClientOptions::default();
        Self {
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            username: None,
            password: None,
            connect_timeout: transport.connect_timeout,
            read_timeout: transport.read_timeout,
            max_attempts: crate::download::DEFAULT_MAX_RETRIES,
        }
    }
}

impl SuwayomiClientOptions {
    /// Takes the endpoint, credentials, timeouts and retry budget from the config.
    #[must_use]
    pub fn from_config(config: &ExtensionConfig) -> Self {
        let transport = config.client_options();
        Self {
            graphql_url: config.graphql_url.clone(),
            username: config.basic_auth_username.clone(),
            password: config.basic_auth_password.clone(),
            connect_timeout: transport.connect_timeout,
            read_timeout: transport.read_timeout,
            max_attempts: config.max_retries,
        }
    }
}

/// [`RemoteCatalog`] backed by Suwayomi's GraphQL API.
///
/// Every call is a single POST of `{query, variables}`. A response carrying a
/// GraphQL `errors` array is an error even when the status is 200. Transient
/// failures (timeouts, 5xx, 429) are retried with the gallery-stage backoff.
pub struct SuwayomiClient {
    client: Client,
    options: SuwayomiClientOptions,
    policy: RetryPolicy,
}

impl std::fmt::Debug for SuwayomiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuwayomiClient")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SuwayomiClient {
    /// Creates a client for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Client`] if the HTTP client cannot be built.
    #[instrument(skip_all, fields(graphql_url = %options.graphql_url))]
    pub fn new(options: SuwayomiClientOptions) -> Result<Self, CatalogError> {
        let http = HttpClient::with_options(&ClientOptions {
            connect_timeout: options.connect_timeout,
            read_timeout: options.read_timeout,
            proxy_url: None,
            user_agent: None,
        })?;
        let policy = RetryPolicy::with_max_attempts(options.max_attempts);
        Ok(Self {
            client: http.inner().clone(),
            options,
            policy,
        })
    }

    /// Creates a client from the extension config.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Client`] if the HTTP client cannot be built.
    pub fn from_config(config: &ExtensionConfig) -> Result<Self, CatalogError> {
        Self::new(SuwayomiClientOptions::from_config(config))
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        query: &str,
        variables: Value,
    ) -> Result<T, CatalogError> {
        let mut attempt = 1;
        loop {
            match self.execute_once(operation, query, &variables).await {
                Ok(data) => return Ok(data),
                Err(error) => match self.policy.should_retry(error.failure_type(), Stage::Gallery, attempt) {
                    RetryDecision::Retry { delay, attempt: next } => {
                        warn!(operation, attempt, error = %error, "catalog request failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(operation, %reason, "not retrying catalog request");
                        return Err(error);
                    }
                },
            }
        }
    }

    async fn execute_once<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        query: &str,
        variables: &Value,
    ) -> Result<T, CatalogError> {
        let mut request = self
            .client
            .post(&self.options.graphql_url)
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(username) = &self.options.username {
            request = request.basic_auth(username, self.options.password.as_ref());
        }
        debug!(operation, "sending GraphQL request");

        let response = request
            .send()
            .await
            .map_err(|e| CatalogError::request(operation, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::HttpStatus {
                operation,
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CatalogError::request(operation, e))?;
        let parsed: GraphQlResponse<T> =
            serde_json::from_slice(&body).map_err(|e| CatalogError::decode(operation, e.to_string()))?;

        if let Some(errors) = parsed.errors.filter(|errors| !errors.is_empty()) {
            let message = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CatalogError::GraphQl { operation, message });
        }
        parsed
            .data
            .ok_or_else(|| CatalogError::decode(operation, "response has no data"))
    }
}

fn source_id_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl RemoteCatalog for SuwayomiClient {
    #[instrument(skip_all)]
    async fn local_source_id(&self) -> Result<Option<String>, CatalogError> {
        let data: SourcesData = self.execute("sources", SOURCES_QUERY, json!({})).await?;
        Ok(data
            .sources
            .nodes
            .iter()
            .find(|node| node.name.eq_ignore_ascii_case(LOCAL_SOURCE_NAME))
            .and_then(|node| source_id_string(&node.id)))
    }

    #[instrument(skip_all, fields(category = %name))]
    async fn find_category(&self, name: &str) -> Result<Option<i64>, CatalogError> {
        let data: CategoriesData = self
            .execute("categories", FIND_CATEGORY_QUERY, json!({ "name": name }))
            .await?;
        Ok(data.categories.nodes.first().map(|node| node.id))
    }

    #[instrument(skip_all, fields(category = %name))]
    async fn create_category(&self, name: &str) -> Result<i64, CatalogError> {
        let data: CreateCategoryData = self
            .execute("createCategory", CREATE_CATEGORY_MUTATION, json!({ "name": name }))
            .await?;
        Ok(data.create_category.category.id)
    }

    #[instrument(skip_all, fields(creator = %title))]
    async fn mangas_by_title(&self, source_id: &str, title: &str) -> Result<Vec<CatalogManga>, CatalogError> {
        let data: MangasData = self
            .execute(
                "mangas",
                MANGAS_BY_TITLE_QUERY,
                json!({ "sourceId": source_id, "title": title }),
            )
            .await?;
        Ok(data.mangas.nodes.into_iter().map(CatalogManga::from).collect())
    }

    #[instrument(skip_all)]
    async fn mangas_not_in_library(&self, source_id: &str) -> Result<Vec<CatalogManga>, CatalogError> {
        let data: MangasData = self
            .execute(
                "mangasNotInLibrary",
                MANGAS_NOT_IN_LIBRARY_QUERY,
                json!({ "sourceId": source_id }),
            )
            .await?;
        Ok(data.mangas.nodes.into_iter().map(CatalogManga::from).collect())
    }

    #[instrument(skip_all, fields(count = ids.len()))]
    async fn set_in_library(&self, ids: &[i64]) -> Result<(), CatalogError> {
        let _: IgnoredAny = self
            .execute("updateMangas", SET_IN_LIBRARY_MUTATION, json!({ "ids": ids }))
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(count = ids.len(), category_id = category_id))]
    async fn add_to_category(&self, ids: &[i64], category_id: i64) -> Result<(), CatalogError> {
        let _: IgnoredAny = self
            .execute(
                "updateMangasCategories",
                ADD_TO_CATEGORY_MUTATION,
                json!({ "ids": ids, "categoryId": category_id }),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn fetch_source_latest(&self, source_id: &str) -> Result<(), CatalogError> {
        let _: IgnoredAny = self
            .execute(
                "fetchSourceManga",
                FETCH_SOURCE_LATEST_MUTATION,
                json!({ "sourceId": source_id, "page": 1 }),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(category_id = category_id))]
    async fn trigger_category_update(&self, category_id: i64) -> Result<(), CatalogError> {
        let _: IgnoredAny = self
            .execute(
                "updateLibrary",
                UPDATE_CATEGORY_MUTATION,
                json!({ "categoryId": category_id }),
            )
            .await?;
        Ok(())
    }

    async fn library_update_status(&self) -> Result<JobStatus, CatalogError> {
        let data: UpdateStatusData = self
            .execute("libraryUpdateStatus", UPDATE_STATUS_QUERY, json!({}))
            .await?;
        Ok(match data.library_update_status.jobs_info {
            JobsInfo::One(status) => status,
            JobsInfo::Many(jobs) => JobStatus::aggregate(&jobs),
        })
    }
}
