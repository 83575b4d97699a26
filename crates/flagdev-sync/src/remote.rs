use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use flagdev_core::{Context, FlagsState, UpstreamError};

use crate::protocol::{
    self, Environment, EnvironmentDetail, EnvironmentsPage, EvalxResponse, FlagsPage, RemoteFlag,
};

/// Upper bound for every upstream call.
pub const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// The slice of the upstream management API the relay needs.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// SDK key of `environment` in `project`.
    async fn get_sdk_key(&self, project: &str, environment: &str) -> Result<String, UpstreamError>;

    /// Every flag of the project, all pages.
    async fn get_all_flags(&self, project: &str) -> Result<Vec<RemoteFlag>, UpstreamError>;

    async fn get_project_environments(
        &self,
        project: &str,
        query: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<Environment>, UpstreamError>;
}

/// Evaluates every flag for a context against the real delivery network.
#[async_trait]
pub trait EvaluationSdk: Send + Sync {
    async fn get_all_flags_state(
        &self,
        context: &Context,
        sdk_key: &str,
    ) -> Result<FlagsState, UpstreamError>;
}

fn build_client() -> Result<reqwest::Client, UpstreamError> {
    reqwest::Client::builder()
        .timeout(REMOTE_TIMEOUT)
        .build()
        .map_err(|e| UpstreamError::Http(e.to_string()))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, UpstreamError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json()
        .await
        .map_err(|e| UpstreamError::Decode(e.to_string()))
}

/// Management API client authenticated with an access token.
pub struct HttpManagementApi {
    client: reqwest::Client,
    base_uri: String,
    access_token: Option<String>,
}

impl HttpManagementApi {
    pub fn new(
        base_uri: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self, UpstreamError> {
        Ok(Self {
            client: build_client()?,
            base_uri: base_uri.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    /// Authenticated GET; `query` pairs are percent-encoded by reqwest.
    fn request(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<RequestBuilder, UpstreamError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or(UpstreamError::NotConfigured("access token"))?;

        let mut request = self
            .client
            .get(format!("{}{}", self.base_uri, path))
            .header(header::AUTHORIZATION, token);
        if !query.is_empty() {
            request = request.query(query);
        }
        Ok(request)
    }

    fn environments_request(
        &self,
        project: &str,
        query: Option<&str>,
        limit: Option<u32>,
    ) -> Result<RequestBuilder, UpstreamError> {
        let mut params = Vec::new();
        if let Some(query) = query {
            params.push(("filter", format!("query:{query}")));
        }
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        self.request(&format!("/api/v2/projects/{project}/environments"), &params)
    }

    async fn get<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, UpstreamError> {
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Http(e.to_string()))?;
        decode(response).await
    }
}

#[async_trait]
impl ManagementApi for HttpManagementApi {
    async fn get_sdk_key(&self, project: &str, environment: &str) -> Result<String, UpstreamError> {
        let env: EnvironmentDetail = self
            .get(self.request(
                &format!("/api/v2/projects/{project}/environments/{environment}"),
                &[],
            )?)
            .await?;
        Ok(env.api_key)
    }

    async fn get_all_flags(&self, project: &str) -> Result<Vec<RemoteFlag>, UpstreamError> {
        let mut flags = Vec::new();
        let mut next = Some(format!("/api/v2/flags/{project}?summary=0"));

        // `next` hrefs arrive already encoded.
        while let Some(path) = next {
            let page: FlagsPage = self.get(self.request(&path, &[])?).await?;
            flags.extend(page.items);
            next = page.links.next.map(|link| link.href);
        }

        tracing::debug!(project, count = flags.len(), "Fetched flag definitions");
        Ok(flags)
    }

    async fn get_project_environments(
        &self,
        project: &str,
        query: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<Environment>, UpstreamError> {
        let page: EnvironmentsPage = self
            .get(self.environments_request(project, query, limit)?)
            .await?;
        Ok(page.items)
    }
}

/// Evaluation client that REPORTs the context to the client-side evalx
/// endpoint, authenticated with the environment's SDK key.
pub struct HttpEvaluationSdk {
    client: reqwest::Client,
    base_uri: String,
    report: Method,
}

impl HttpEvaluationSdk {
    pub fn new(base_uri: impl Into<String>) -> Result<Self, UpstreamError> {
        let report =
            Method::from_bytes(b"REPORT").map_err(|e| UpstreamError::Http(e.to_string()))?;
        Ok(Self {
            client: build_client()?,
            base_uri: base_uri.into().trim_end_matches('/').to_string(),
            report,
        })
    }
}

#[async_trait]
impl EvaluationSdk for HttpEvaluationSdk {
    async fn get_all_flags_state(
        &self,
        context: &Context,
        sdk_key: &str,
    ) -> Result<FlagsState, UpstreamError> {
        let url = format!("{}/sdk/evalx/context", self.base_uri);
        let response = self
            .client
            .request(self.report.clone(), &url)
            .header(header::AUTHORIZATION, sdk_key)
            .json(context)
            .send()
            .await
            .map_err(|e| UpstreamError::Http(e.to_string()))?;

        let body: EvalxResponse = decode(response).await?;
        Ok(protocol::flags_state(body))
    }
}

// Static doubles for tests
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::RwLock;

    /// Management API answering from fixed data.
    #[derive(Default)]
    pub struct StaticManagementApi {
        sdk_keys: RwLock<HashMap<(String, String), String>>,
        flags: RwLock<HashMap<String, Vec<RemoteFlag>>>,
        environments: RwLock<HashMap<String, Vec<Environment>>>,
        fail_flags: RwLock<bool>,
    }

    impl StaticManagementApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_environment(self, project: &str, environment: &str, sdk_key: &str) -> Self {
            self.sdk_keys.write().unwrap().insert(
                (project.to_string(), environment.to_string()),
                sdk_key.to_string(),
            );
            self.environments
                .write()
                .unwrap()
                .entry(project.to_string())
                .or_default()
                .push(Environment {
                    key: environment.to_string(),
                    name: environment.to_string(),
                });
            self
        }

        pub fn with_flags(self, project: &str, flags: Vec<RemoteFlag>) -> Self {
            self.flags
                .write()
                .unwrap()
                .insert(project.to_string(), flags);
            self
        }

        /// Make `get_all_flags` fail from now on.
        pub fn fail_flags(&self) {
            *self.fail_flags.write().unwrap() = true;
        }
    }

    #[async_trait]
    impl ManagementApi for StaticManagementApi {
        async fn get_sdk_key(
            &self,
            project: &str,
            environment: &str,
        ) -> Result<String, UpstreamError> {
            self.sdk_keys
                .read()
                .unwrap()
                .get(&(project.to_string(), environment.to_string()))
                .cloned()
                .ok_or_else(|| UpstreamError::Status {
                    status: 404,
                    body: format!("unknown environment {project}/{environment}"),
                })
        }

        async fn get_all_flags(&self, project: &str) -> Result<Vec<RemoteFlag>, UpstreamError> {
            if *self.fail_flags.read().unwrap() {
                return Err(UpstreamError::Http("connection refused".to_string()));
            }
            Ok(self
                .flags
                .read()
                .unwrap()
                .get(project)
                .cloned()
                .unwrap_or_default())
        }

        async fn get_project_environments(
            &self,
            project: &str,
            query: Option<&str>,
            limit: Option<u32>,
        ) -> Result<Vec<Environment>, UpstreamError> {
            let environments = self.environments.read().unwrap();
            let matching = environments
                .get(project)
                .into_iter()
                .flatten()
                .filter(|env| query.is_none_or(|q| env.key.contains(q) || env.name.contains(q)))
                .take(limit.map_or(usize::MAX, |l| l as usize))
                .cloned()
                .collect();
            Ok(matching)
        }
    }

    /// Evaluation SDK returning a configurable snapshot per SDK key.
    #[derive(Default)]
    pub struct StaticEvaluationSdk {
        states: RwLock<HashMap<String, FlagsState>>,
        calls: AtomicUsize,
    }

    impl StaticEvaluationSdk {
        pub fn new() -> Self {
            Self::default()
        }

        /// Replace what the upstream reports for `sdk_key`.
        pub fn set_flags(&self, sdk_key: &str, state: FlagsState) {
            self.states
                .write()
                .unwrap()
                .insert(sdk_key.to_string(), state);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EvaluationSdk for StaticEvaluationSdk {
        async fn get_all_flags_state(
            &self,
            _context: &Context,
            sdk_key: &str,
        ) -> Result<FlagsState, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.states
                .read()
                .unwrap()
                .get(sdk_key)
                .cloned()
                .ok_or_else(|| UpstreamError::Status {
                    status: 401,
                    body: "invalid SDK key".to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use flagdev_core::FlagState;

    #[tokio::test]
    async fn test_http_management_api_requires_token() {
        let api = HttpManagementApi::new("http://127.0.0.1:9", None).unwrap();
        let err = api.get_sdk_key("p1", "env-1").await.unwrap_err();
        assert!(matches!(err, UpstreamError::NotConfigured("access token")));
    }

    #[test]
    fn test_environment_filter_is_encoded() {
        let api =
            HttpManagementApi::new("http://127.0.0.1:9/", Some("api-token".to_string())).unwrap();
        let request = api
            .environments_request("p1", Some("dev & qa #2"), Some(5))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(request.url().path(), "/api/v2/projects/p1/environments");
        assert_eq!(request.url().fragment(), None);
        let pairs: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("filter".to_string(), "query:dev & qa #2".to_string()),
                ("limit".to_string(), "5".to_string()),
            ]
        );
    }

    #[test]
    fn test_environment_request_without_params() {
        let api =
            HttpManagementApi::new("http://127.0.0.1:9", Some("api-token".to_string())).unwrap();
        let request = api
            .environments_request("p1", None, None)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(request.url().query(), None);
        assert_eq!(request.headers()[header::AUTHORIZATION], "api-token");
    }

    #[tokio::test]
    async fn test_static_management_api() {
        let api = StaticManagementApi::new()
            .with_environment("p1", "production", "sdk-prod")
            .with_environment("p1", "staging", "sdk-staging");

        assert_eq!(api.get_sdk_key("p1", "staging").await.unwrap(), "sdk-staging");
        assert!(api.get_sdk_key("p1", "missing").await.is_err());

        let envs = api
            .get_project_environments("p1", Some("prod"), None)
            .await
            .unwrap();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].key, "production");

        let limited = api.get_project_environments("p1", None, Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_static_evaluation_sdk() {
        let sdk = StaticEvaluationSdk::new();
        let state: FlagsState = [("f1".to_string(), FlagState::new(true, 1))]
            .into_iter()
            .collect();
        sdk.set_flags("sdk-1", state.clone());

        let fetched = sdk
            .get_all_flags_state(&Context::default(), "sdk-1")
            .await
            .unwrap();
        assert_eq!(fetched, state);
        assert!(sdk
            .get_all_flags_state(&Context::default(), "other")
            .await
            .is_err());
        assert_eq!(sdk.calls(), 2);
    }
}
