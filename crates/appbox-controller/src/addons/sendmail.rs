// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound mail relay credentials.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Addon, AddonContext, AddonError, CredentialStore, Credentials, Result, generate_secret};
use crate::model::AddonKind;

/// Grants an app SMTP credentials on the box's mail relay.
pub struct SendmailAddon {
    credentials: Arc<dyn CredentialStore>,
    server: String,
    port: u16,
    domain: String,
}

impl SendmailAddon {
    /// Relay at `server:port`, sending for `domain`.
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        server: impl Into<String>,
        port: u16,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            server: server.into(),
            port,
            domain: domain.into(),
        }
    }

    fn store_err(source: sqlx::Error) -> AddonError {
        AddonError::Credentials {
            kind: AddonKind::Sendmail,
            source,
        }
    }
}

#[async_trait]
impl Addon for SendmailAddon {
    fn kind(&self) -> AddonKind {
        AddonKind::Sendmail
    }

    async fn provision(&self, ctx: &AddonContext) -> Result<Vec<(String, String)>> {
        let credentials = Credentials {
            username: format!("{}-app", ctx.location),
            secret: generate_secret(),
        };

        self.credentials
            .issue(&ctx.app_id, AddonKind::Sendmail, &credentials)
            .await
            .map_err(Self::store_err)?;

        Ok(vec![
            ("MAIL_SMTP_SERVER".to_string(), self.server.clone()),
            ("MAIL_SMTP_PORT".to_string(), self.port.to_string()),
            ("MAIL_SMTP_USERNAME".to_string(), credentials.username),
            ("MAIL_SMTP_PASSWORD".to_string(), credentials.secret),
            ("MAIL_DOMAIN".to_string(), self.domain.clone()),
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
            .revoke(app_id, AddonKind::Sendmail)
            .await
            .map_err(Self::store_err)
    }
}
