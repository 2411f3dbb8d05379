//! HTTP Downstream Client Module
//!
//! `reqwest` client for the downstream contract:
//! - POST `{base}/exists` with a list of ids, answering `[{id, exists}]`
//! - POST `{base}/by-ids` with a list of ids, answering info records
//! - GET `{base}/{id}`, answering one record or 404

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::DownstreamConfig;
use crate::downstream::{unavailable_placeholders, DownstreamClient};
use crate::error::{GatewayError, Result};
use crate::models::{EntityInfo, ProductInfo, UserInfo};
use crate::policy::PolicyPipeline;

/// One entry of an existence response. The id field name differs between
/// services.
#[derive(Debug, Deserialize)]
struct ExistenceEntry {
    #[serde(alias = "productId", alias = "userId", alias = "ProductId", alias = "UserId", alias = "Id")]
    id: Uuid,
    #[serde(alias = "Exists")]
    exists: bool,
}

// == HTTP Downstream Client ==
pub struct HttpDownstreamClient<I> {
    service: &'static str,
    base_url: String,
    http: reqwest::Client,
    pipeline: Arc<PolicyPipeline>,
    _info: PhantomData<fn() -> I>,
}

impl<I: EntityInfo> HttpDownstreamClient<I> {
    // == Constructor ==
    pub fn new(
        service: &'static str,
        base_url: impl Into<String>,
        pipeline: PolicyPipeline,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Config(format!("{} HTTP client: {}", service, e)))?;
        Ok(Self {
            service,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            pipeline: Arc::new(pipeline),
            _info: PhantomData,
        })
    }

    /// Builds a client whose pipeline follows `config.policy`.
    pub fn from_config(service: &'static str, config: &DownstreamConfig) -> Result<Self> {
        let pipeline = PolicyPipeline::from_config(service, &config.policy);
        Self::new(service, config.base_url.clone(), pipeline)
    }

    pub fn pipeline(&self) -> &PolicyPipeline {
        &self.pipeline
    }

    fn unavailable(&self, reason: impl Into<String>) -> GatewayError {
        GatewayError::unavailable(self.service, reason)
    }
}

impl HttpDownstreamClient<UserInfo> {
    pub fn users(config: &DownstreamConfig) -> Result<Self> {
        Self::from_config("users", config)
    }
}

impl HttpDownstreamClient<ProductInfo> {
    pub fn products(config: &DownstreamConfig) -> Result<Self> {
        Self::from_config("products", config)
    }
}

#[async_trait]
impl<I: EntityInfo> DownstreamClient for HttpDownstreamClient<I> {
    type Info = I;

    fn service(&self) -> &'static str {
        self.service
    }

    // == Check Exist ==
    async fn check_exist(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, bool>> {
        let url = format!("{}/exists", self.base_url);
        let response = self
            .pipeline
            .execute(|| self.http.post(&url).json(ids).send())
            .await
            .map_err(|e| {
                tracing::error!(client = self.service, reason = %e, "Unable to verify existence");
                self.unavailable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(client = self.service, status = %status, url = %url, "Unexpected status");
            return Err(self.unavailable(format!("responded with {}", status)));
        }

        let entries: Vec<ExistenceEntry> = response.json().await.map_err(|e| {
            tracing::error!(client = self.service, error = %e, "Invalid existence response");
            self.unavailable(format!("invalid response: {}", e))
        })?;

        let mut result = HashMap::with_capacity(entries.len());
        for entry in entries {
            result.entry(entry.id).or_insert(entry.exists);
        }
        Ok(result)
    }

    // == Fetch Info ==
    async fn fetch_info(&self, ids: &[Uuid]) -> Vec<I> {
        let url = format!("{}/by-ids", self.base_url);
        let response = match self
            .pipeline
            .execute(|| self.http.post(&url).json(ids).send())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(client = self.service, reason = %e, "Service unavailable, using placeholders");
                return unavailable_placeholders(ids);
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(client = self.service, status = %status, url = %url, "Unexpected status, using placeholders");
            return unavailable_placeholders(ids);
        }

        match response.json::<Vec<I>>().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(client = self.service, error = %e, url = %url, "Invalid response, using placeholders");
                unavailable_placeholders(ids)
            }
        }
    }

    // == Fetch One ==
    async fn fetch_one(&self, id: Uuid) -> Option<I> {
        let url = format!("{}/{}", self.base_url, id);
        let response = match self.pipeline.execute(|| self.http.get(&url).send()).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(client = self.service, reason = %e, "Service unavailable, using placeholder");
                return Some(I::unavailable(id));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return None;
        }
        if !status.is_success() {
            tracing::warn!(client = self.service, status = %status, url = %url, "Unexpected status, using placeholder");
            return Some(I::unavailable(id));
        }

        match response.json::<I>().await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(client = self.service, error = %e, url = %url, "Invalid response, using placeholder");
                Some(I::unavailable(id))
            }
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fast policies: two retries without backoff, breaker off.
    fn test_policy() -> PolicyConfig {
        PolicyConfig {
            retry_count: 2,
            initial_delay_secs: 0.0,
            breaker_enabled: false,
            timeout: Duration::from_millis(500),
            ..PolicyConfig::default()
        }
    }

    fn products_client(server: &MockServer) -> HttpDownstreamClient<ProductInfo> {
        HttpDownstreamClient::products(&DownstreamConfig {
            base_url: format!("{}/gateway/products/", server.uri()),
            policy: test_policy(),
        })
        .unwrap()
    }

    fn users_client(server: &MockServer) -> HttpDownstreamClient<UserInfo> {
        HttpDownstreamClient::users(&DownstreamConfig {
            base_url: format!("{}/api/users", server.uri()),
            policy: test_policy(),
        })
        .unwrap()
    }

    fn product_json(id: Uuid, name: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": name,
            "category": "Electronics",
            "unitPrice": 10.5,
            "quantityInStock": 3
        })
    }

    #[tokio::test]
    async fn test_check_exist_posts_ids_and_keeps_first_duplicate() {
        let server = MockServer::start().await;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        Mock::given(method("POST"))
            .and(path("/gateway/products/exists"))
            .and(body_json(json!([a, b])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "productId": a, "exists": true },
                { "productId": b, "exists": false },
                { "productId": a, "exists": false }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let result = products_client(&server).check_exist(&[a, b]).await.unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[&a], true);
        assert_eq!(result[&b], false);
    }

    #[tokio::test]
    async fn test_check_exist_accepts_user_id_field() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/api/users/exists"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{ "userId": id, "exists": true }])),
            )
            .mount(&server)
            .await;

        let result = users_client(&server).check_exist(&[id]).await.unwrap();
        assert_eq!(result.get(&id), Some(&true));
    }

    #[tokio::test]
    async fn test_check_exist_unavailable_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gateway/products/exists"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = products_client(&server)
            .check_exist(&[Uuid::new_v4()])
            .await
            .unwrap_err();

        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_check_exist_not_found_is_unavailable_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gateway/products/exists"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = products_client(&server)
            .check_exist(&[Uuid::new_v4()])
            .await
            .unwrap_err();

        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_fetch_info_retries_then_succeeds() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/gateway/products/by-ids"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/gateway/products/by-ids"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([product_json(id, "Mouse")])))
            .mount(&server)
            .await;

        let records = products_client(&server).fetch_info(&[id]).await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Mouse");
        assert!(!records[0].is_placeholder());
    }

    #[tokio::test]
    async fn test_fetch_info_falls_back_to_placeholders() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/users/by-ids"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let ids = [Uuid::new_v4(), Uuid::new_v4()];

        let records = users_client(&server).fetch_info(&ids).await;

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(UserInfo::is_placeholder));
        assert_eq!(records[1].user_id, ids[1]);
    }

    #[tokio::test]
    async fn test_fetch_info_unreadable_body_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gateway/products/by-ids"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let records = products_client(&server).fetch_info(&[Uuid::new_v4()]).await;

        assert!(records[0].is_placeholder());
    }

    #[tokio::test]
    async fn test_fetch_info_timeout_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gateway/products/by-ids"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let records = products_client(&server).fetch_info(&[Uuid::new_v4()]).await;

        assert!(records[0].is_placeholder());
    }

    #[tokio::test]
    async fn test_fetch_one_not_found_is_none() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/api/users/{}", id)))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        assert!(users_client(&server).fetch_one(id).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_one_returns_record() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/gateway/products/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(product_json(id, "Desk")))
            .mount(&server)
            .await;

        let record = products_client(&server).fetch_one(id).await.unwrap();
        assert_eq!(record.name, "Desk");
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let client = HttpDownstreamClient::<UserInfo>::users(&DownstreamConfig {
            base_url: "http://127.0.0.1:1/api/users".to_string(),
            policy: PolicyConfig {
                retry_count: 0,
                ..test_policy()
            },
        })
        .unwrap();

        assert!(client.check_exist(&[Uuid::new_v4()]).await.is_err());
        assert!(client.fetch_one(Uuid::new_v4()).await.unwrap().is_placeholder());
    }
}
