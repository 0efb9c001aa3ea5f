//! # Central Service Client
//!
//! Client for the time-tracking service's pipes import API.
//!
//! ## Overview
//!
//! Every call authenticates with the workspace's API token (HTTP basic auth,
//! `token:api_token`) and carries a bounded timeout. Non-2xx answers become
//! [`SyncError::UpstreamCallFailed`]; bodies that cannot be decoded become
//! [`SyncError::ResponseDecode`], which is masked before reaching users.

use async_trait::async_trait;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{Result, SyncError};
use crate::models::{
    ClientRequest, ClientsImport, ProjectRequest, ProjectsImport, TaskRequest, TasksImport,
    TimeEntry, UsersImport, UsersRequest,
};

#[async_trait]
pub trait CentralService: Send + Sync {
    /// A client bound to a workspace API token.
    fn with_auth_token(&self, token: &str) -> Arc<dyn CentralService>;

    async fn post_users(&self, request: &UsersRequest) -> Result<UsersImport>;

    async fn post_clients(&self, request: &ClientRequest) -> Result<ClientsImport>;

    async fn post_projects(&self, request: &ProjectRequest) -> Result<ProjectsImport>;

    async fn post_tasks(&self, request: &TaskRequest) -> Result<TasksImport>;

    async fn post_todo_lists(&self, request: &TaskRequest) -> Result<TasksImport>;

    /// Time entries changed since `since` for the given users and projects.
    async fn get_time_entries(
        &self,
        since: DateTime<Utc>,
        user_ids: &[i64],
        project_ids: &[i64],
    ) -> Result<Vec<TimeEntry>>;

    async fn ping(&self) -> Result<()>;
}

/// [`CentralService`] over the bridge [`HttpClient`].
#[derive(Clone)]
pub struct HttpCentralService {
    http: Arc<dyn HttpClient>,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpCentralService {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            timeout,
        }
    }

    fn request(&self, method: HttpMethod, url: impl Into<String>) -> HttpRequest {
        let request = HttpRequest::new(method, url)
            .header("Accept", "application/json")
            .timeout(self.timeout);
        match &self.token {
            Some(token) => request.basic_auth(token, "api_token"),
            None => request,
        }
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.url.clone();
        let response = self.http.execute(request).await?;

        if !response.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SyncError::UpstreamCallFailed(format!(
                "{} returned HTTP {}: {}",
                url,
                response.status,
                body.trim()
            )));
        }
        Ok(response)
    }

    async fn post<Req, Resp>(&self, entity: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/api/pipes/{}", self.base_url, entity);
        let request = self.request(HttpMethod::Post, url).json(body)?;
        let response = self.send(request).await?;
        decode(&response)
    }
}

fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    serde_json::from_slice(&response.body).map_err(|e| SyncError::ResponseDecode(e.to_string()))
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl CentralService for HttpCentralService {
    fn with_auth_token(&self, token: &str) -> Arc<dyn CentralService> {
        Arc::new(Self {
            token: Some(token.to_string()),
            ..self.clone()
        })
    }

    #[instrument(skip_all, fields(count = request.users.len()))]
    async fn post_users(&self, request: &UsersRequest) -> Result<UsersImport> {
        self.post("users", request).await
    }

    #[instrument(skip_all, fields(count = request.clients.len()))]
    async fn post_clients(&self, request: &ClientRequest) -> Result<ClientsImport> {
        self.post("clients", request).await
    }

    #[instrument(skip_all, fields(count = request.projects.len()))]
    async fn post_projects(&self, request: &ProjectRequest) -> Result<ProjectsImport> {
        self.post("projects", request).await
    }

    #[instrument(skip_all, fields(count = request.tasks.len()))]
    async fn post_tasks(&self, request: &TaskRequest) -> Result<TasksImport> {
        self.post("tasks", request).await
    }

    #[instrument(skip_all, fields(count = request.tasks.len()))]
    async fn post_todo_lists(&self, request: &TaskRequest) -> Result<TasksImport> {
        self.post("todolists", request).await
    }

    async fn get_time_entries(
        &self,
        since: DateTime<Utc>,
        user_ids: &[i64],
        project_ids: &[i64],
    ) -> Result<Vec<TimeEntry>> {
        let mut url = Url::parse(&format!("{}/api/pipes/time_entries", self.base_url))
            .map_err(|e| {
                SyncError::UpstreamCallFailed(format!("invalid central service URL: {}", e))
            })?;
        url.query_pairs_mut()
            .append_pair("since", &since.timestamp().to_string())
            .append_pair("user_ids", &join_ids(user_ids))
            .append_pair("project_ids", &join_ids(project_ids));

        let response = self.send(self.request(HttpMethod::Get, url.as_str())).await?;
        let entries: Vec<TimeEntry> = decode(&response)?;
        debug!(count = entries.len(), "Fetched time entries");
        Ok(entries)
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/api/status", self.base_url);
        self.send(self.request(HttpMethod::Get, url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Client, Task};
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use chrono::TimeZone;
    use mockall::mock;

    mock! {
        Http {}

        #[async_trait::async_trait]
        impl HttpClient for Http {
            async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse>;
        }
    }

    fn service(http: MockHttp) -> Arc<dyn CentralService> {
        HttpCentralService::new(
            Arc::new(http),
            "https://track.example.com/",
            Duration::from_secs(30),
        )
        .with_auth_token("ws-token")
    }

    #[tokio::test]
    async fn test_post_clients() {
        let mut http = MockHttp::new();
        http.expect_execute()
            .withf(|req| {
                let body = String::from_utf8(req.body.clone().unwrap().to_vec()).unwrap();
                req.method == HttpMethod::Post
                    && req.url == "https://track.example.com/api/pipes/clients"
                    && req.timeout == Some(Duration::from_secs(30))
                    && req.headers.get("Authorization").map(String::as_str)
                        == Some("Basic d3MtdG9rZW46YXBpX3Rva2Vu")
                    && body.contains("\"foreign_id\":\"c1\"")
            })
            .times(1)
            .returning(|_| {
                Ok(HttpResponse::new(
                    200,
                    r#"{"clients":[{"id":10,"name":"Acme","foreign_id":"c1"}],"notifications":["n"]}"#,
                ))
            });

        let request = ClientRequest {
            clients: vec![Client {
                id: 0,
                name: "Acme".to_string(),
                foreign_id: "c1".to_string(),
            }],
        };
        let import = service(http).post_clients(&request).await.unwrap();

        assert_eq!(import.clients[0].id, 10);
        assert_eq!(import.notifications, vec!["n"]);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_a_decode_error() {
        let mut http = MockHttp::new();
        http.expect_execute()
            .returning(|_| Ok(HttpResponse::new(200, "<html>oops</html>")));

        let err = service(http)
            .post_tasks(&TaskRequest {
                tasks: vec![Task::default()],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::ResponseDecode(_)));
        assert_eq!(err.user_message(), "failed to parse response");
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let mut http = MockHttp::new();
        http.expect_execute()
            .returning(|_| Ok(HttpResponse::new(429, "slow down")));

        let err = service(http).post_projects(&ProjectRequest::default()).await.unwrap_err();
        match err {
            SyncError::UpstreamCallFailed(message) => {
                assert!(message.contains("429"));
                assert!(message.contains("slow down"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_timeout() {
        let mut http = MockHttp::new();
        http.expect_execute()
            .returning(|_| Err(BridgeError::Timeout(Duration::from_secs(30))));

        let err = service(http).ping().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_get_time_entries_query() {
        let mut http = MockHttp::new();
        http.expect_execute()
            .withf(|req| {
                req.method == HttpMethod::Get
                    && req.url
                        == "https://track.example.com/api/pipes/time_entries?since=1704067200&user_ids=1%2C2&project_ids=7"
            })
            .times(1)
            .returning(|_| {
                Ok(HttpResponse::new(
                    200,
                    r#"[{"id":5,"pid":7,"uid":1,"start":"2024-01-02T10:00:00Z","duration":3600}]"#,
                ))
            });

        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entries = service(http).get_time_entries(since, &[1, 2], &[7]).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].project_id, 7);
        assert_eq!(entries[0].duration_in_seconds, 3600);
        assert_eq!(entries[0].foreign_id, 0);
    }
}
