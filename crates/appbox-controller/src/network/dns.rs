// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS provider for boxes whose zone is managed by hand.

use async_trait::async_trait;
use tracing::info;

use super::{DnsProvider, Result};

/// Provider for a wildcard record maintained outside the box.
///
/// Lookups report every name as already pointing at the box, so
/// registration never calls `upsert`.
#[derive(Debug, Clone)]
pub struct ManualDns {
    target: String,
}

impl ManualDns {
    /// `target` is the box fqdn the wildcard points at.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl DnsProvider for ManualDns {
    async fn lookup(&self, _name: &str) -> Result<Option<String>> {
        Ok(Some(self.target.clone()))
    }

    async fn upsert(&self, name: &str, target: &str) -> Result<()> {
        info!(name = %name, target = %target, "Manual DNS: add this record to the zone");
        Ok(())
    }

    async fn remove(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}
