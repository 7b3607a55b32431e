// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller authentication.

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// An authenticated API caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// User id.
    pub user_id: String,
    /// Groups the user belongs to.
    pub groups: Vec<String>,
    /// Whether the caller may manage apps.
    pub is_admin: bool,
}

impl Caller {
    /// An admin caller.
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            groups: Vec::new(),
            is_admin: true,
        }
    }

    /// A regular user.
    pub fn user(user_id: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            groups,
            is_admin: false,
        }
    }
}

/// Resolves tokens to callers and checks confirmation passwords.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Caller behind `token`, if any.
    async fn authenticate(&self, token: &str) -> Option<Caller>;

    /// Whether `password` is the caller's password.
    async fn verify_password(&self, caller: &Caller, password: &str) -> bool;
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Fixed token table plus one admin password.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<[u8; 32], Caller>,
    passwords: HashMap<String, [u8; 32]>,
}

impl StaticAuthenticator {
    /// Authenticator with an optional admin token and password.
    pub fn new(admin_token: Option<&str>, admin_password: Option<&str>) -> Self {
        let mut auth = Self::default();
        if let Some(token) = admin_token {
            auth = auth.with_caller(token, Caller::admin("admin"));
        }
        if let Some(password) = admin_password {
            auth = auth.with_password("admin", password);
        }
        auth
    }

    /// Accept `token` as `caller`.
    pub fn with_caller(mut self, token: &str, caller: Caller) -> Self {
        self.tokens.insert(digest(token), caller);
        self
    }

    /// Set the confirmation password of `user_id`.
    pub fn with_password(mut self, user_id: &str, password: &str) -> Self {
        self.passwords.insert(user_id.to_string(), digest(password));
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<Caller> {
        self.tokens.get(&digest(token)).cloned()
    }

    async fn verify_password(&self, caller: &Caller, password: &str) -> bool {
        self.passwords
            .get(&caller.user_id)
            .is_some_and(|expected| *expected == digest(password))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admin_token_and_password() {
        let auth = StaticAuthenticator::new(Some("secret-token"), Some("hunter2"));

        let caller = auth.authenticate("secret-token").await.unwrap();
        assert!(caller.is_admin);
        assert!(auth.authenticate("other").await.is_none());

        assert!(auth.verify_password(&caller, "hunter2").await);
        assert!(!auth.verify_password(&caller, "wrong").await);
    }

    #[tokio::test]
    async fn test_unset_credentials_reject_everything() {
        let auth = StaticAuthenticator::new(None, None);
        assert!(auth.authenticate("").await.is_none());
        assert!(!auth.verify_password(&Caller::admin("admin"), "").await);
    }

    #[tokio::test]
    async fn test_user_tokens() {
        let auth = StaticAuthenticator::default()
            .with_caller("u1-token", Caller::user("u1", vec!["staff".into()]));

        let caller = auth.authenticate("u1-token").await.unwrap();
        assert_eq!(caller.user_id, "u1");
        assert!(!caller.is_admin);
    }
}
