// src/backend.rs
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::charge::{ChargeEndpoint, OneTimeEntryPayload};
use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};
use crate::types::LookupResponse;

/// The REST calls the scanning core depends on.
#[async_trait]
pub trait GymBackend: Send + Sync {
    async fn lookup_card(&self, card_number: u64) -> ApiResult<LookupResponse>;

    async fn create_one_time_entries(
        &self,
        endpoint: ChargeEndpoint,
        count: u32,
        payload: &OneTimeEntryPayload,
    ) -> ApiResult<Value>;
}

/// `GymBackend` over HTTP. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(config: &ApiConfig) -> ApiResult<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> ApiResult<T> {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                    ApiError::Validation(text)
                }
                StatusCode::NOT_FOUND => ApiError::NotFound(text),
                _ => ApiError::Status {
                    status: status.as_u16(),
                    body: text,
                },
            });
        }

        // Created records may come back with an empty body
        let body = if text.trim().is_empty() { "null" } else { text.as_str() };
        serde_json::from_str(body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl GymBackend for HttpBackend {
    async fn lookup_card(&self, card_number: u64) -> ApiResult<LookupResponse> {
        let url = self.url(&format!("users/byCardNumber/{}", card_number));
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await?;
        Self::handle_response(response).await
    }

    async fn create_one_time_entries(
        &self,
        endpoint: ChargeEndpoint,
        count: u32,
        payload: &OneTimeEntryPayload,
    ) -> ApiResult<Value> {
        let url = self.url(endpoint.path());
        debug!("POST {}?count={}", url, count);

        let response = self
            .client
            .post(&url)
            .query(&[("count", count)])
            .json(payload)
            .send()
            .await?;
        Self::handle_response(response).await
    }
}
