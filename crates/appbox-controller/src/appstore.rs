// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App store purchase client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, info};

/// Purchase errors.
#[derive(Debug, thiserror::Error)]
pub enum PurchaseError {
    /// The store requires payment before the app can be installed.
    #[error("Payment required for {0}")]
    PaymentRequired(String),

    /// The store could not be reached.
    #[error("App store unreachable: {0}")]
    Http(#[from] reqwest::Error),

    /// The store answered with an unexpected status.
    #[error("App store answered {status} for {app_store_id}")]
    UnexpectedStatus {
        /// Store id of the app.
        app_store_id: String,
        /// Status received.
        status: u16,
    },
}

/// Purchases apps before they are installed.
#[async_trait]
pub trait AppStore: Send + Sync {
    /// Purchase `app_store_id` for the app being installed as `app_id`.
    /// Succeeds when the app is purchased or was purchased before.
    async fn purchase(&self, app_store_id: &str, app_id: &str) -> Result<(), PurchaseError>;
}

/// Store client posting to `<origin>/api/v1/apps/<store id>/purchase`.
#[derive(Clone)]
pub struct HttpAppStore {
    client: reqwest::Client,
    origin: String,
    token: String,
}

impl HttpAppStore {
    /// Create a client for the store at `origin`.
    pub fn new(origin: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            origin: origin.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl AppStore for HttpAppStore {
    async fn purchase(&self, app_store_id: &str, app_id: &str) -> Result<(), PurchaseError> {
        let url = format!("{}/api/v1/apps/{}/purchase", self.origin, app_store_id);
        let response = self
            .client
            .post(&url)
            .query(&[("token", self.token.as_str())])
            .json(&serde_json::json!({ "appId": app_id }))
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => {
                info!(app_store_id = %app_store_id, app_id = %app_id, "App purchased");
                Ok(())
            }
            StatusCode::OK => {
                debug!(app_store_id = %app_store_id, "App already purchased");
                Ok(())
            }
            StatusCode::PAYMENT_REQUIRED => {
                Err(PurchaseError::PaymentRequired(app_store_id.to_string()))
            }
            status => Err(PurchaseError::UnexpectedStatus {
                app_store_id: app_store_id.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

/// Store that accepts every purchase, for boxes without a store account.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeAppStore;

#[async_trait]
impl AppStore for FreeAppStore {
    async fn purchase(&self, app_store_id: &str, _app_id: &str) -> Result<(), PurchaseError> {
        debug!(app_store_id = %app_store_id, "No app store configured, skipping purchase");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_answering(status: u16) -> (MockServer, HttpAppStore) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/apps/test/purchase"))
            .and(query_param("token", "APPSTORE_TOKEN"))
            .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let store = HttpAppStore::new(server.uri(), "APPSTORE_TOKEN");
        (server, store)
    }

    #[tokio::test]
    async fn test_purchase_created() {
        let (_server, store) = store_answering(201).await;
        store.purchase("test", "a1").await.unwrap();
    }

    #[tokio::test]
    async fn test_already_purchased() {
        let (_server, store) = store_answering(200).await;
        store.purchase("test", "a1").await.unwrap();
    }

    #[tokio::test]
    async fn test_payment_required() {
        let (_server, store) = store_answering(402).await;
        let err = store.purchase("test", "a1").await.unwrap_err();
        assert!(matches!(err, PurchaseError::PaymentRequired(ref id) if id == "test"));
    }

    #[tokio::test]
    async fn test_unexpected_status() {
        let (_server, store) = store_answering(500).await;
        let err = store.purchase("test", "a1").await.unwrap_err();
        assert!(matches!(err, PurchaseError::UnexpectedStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_free_store_always_succeeds() {
        FreeAppStore.purchase("anything", "a1").await.unwrap();
    }
}
