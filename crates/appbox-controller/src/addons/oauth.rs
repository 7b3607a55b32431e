// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generated OAuth client credentials.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Addon, AddonContext, AddonError, CredentialStore, Credentials, Result, generate_secret};
use crate::model::AddonKind;

/// Issues an OAuth client per app against the box's identity origin.
pub struct OAuthAddon {
    credentials: Arc<dyn CredentialStore>,
    origin: String,
}

impl OAuthAddon {
    /// `origin` is the OAuth server apps talk to (the admin origin).
    pub fn new(credentials: Arc<dyn CredentialStore>, origin: impl Into<String>) -> Self {
        Self {
            credentials,
            origin: origin.into(),
        }
    }
}

/// `cid-` followed by a hyphenated UUID (40 characters).
fn generate_client_id() -> String {
    format!("cid-{}", uuid::Uuid::new_v4())
}

#[async_trait]
impl Addon for OAuthAddon {
    fn kind(&self) -> AddonKind {
        AddonKind::Oauth
    }

    async fn provision(&self, ctx: &AddonContext) -> Result<Vec<(String, String)>> {
        let credentials = Credentials {
            username: generate_client_id(),
            secret: generate_secret(),
        };

        self.credentials
            .issue(&ctx.app_id, AddonKind::Oauth, &credentials)
            .await
            .map_err(|source| AddonError::Credentials {
                kind: AddonKind::Oauth,
                source,
            })?;

        Ok(vec![
            ("OAUTH_CLIENT_ID".to_string(), credentials.username),
            ("OAUTH_CLIENT_SECRET".to_string(), credentials.secret),
            ("OAUTH_ORIGIN".to_string(), self.origin.clone()),
        ])
    }

    async fn start(&self, _app_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _app_id: &str) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self, _app_id: &str) -> Result<()> {
        Ok(())
    }

    async fn deprovision(&self, app_id: &str) -> Result<()> {
        self.credentials
            .revoke(app_id, AddonKind::Oauth)
            .await
            .map_err(|source| AddonError::Credentials {
                kind: AddonKind::Oauth,
                source,
            })
    }
}
