// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory network collaborators for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CertificateStore, DnsProvider, NetworkError, Result, ReverseProxy, Route};
use crate::model::TlsMaterial;

#[derive(Default)]
struct ProxyState {
    routes: HashMap<String, Route>,
    writes: usize,
    reloads: usize,
    failing_writes: usize,
    failing_removals: usize,
}

/// Reverse proxy keeping routes in memory.
#[derive(Clone, Default)]
pub struct MemoryProxy {
    state: Arc<Mutex<ProxyState>>,
}

impl MemoryProxy {
    /// Create an empty proxy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route of an app.
    pub async fn route(&self, app_id: &str) -> Option<Route> {
        self.state.lock().await.routes.get(app_id).cloned()
    }

    /// Number of route writes that changed something.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }

    /// Number of reloads.
    pub async fn reload_count(&self) -> usize {
        self.state.lock().await.reloads
    }

    /// Fail the next `n` route writes.
    pub async fn fail_next_writes(&self, n: usize) {
        self.state.lock().await.failing_writes = n;
    }

    /// Fail the next `n` route removals.
    pub async fn fail_next_removals(&self, n: usize) {
        self.state.lock().await.failing_removals = n;
    }
}

#[async_trait]
impl ReverseProxy for MemoryProxy {
    async fn write_route(&self, route: &Route) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(NetworkError::Proxy("injected write failure".into()));
        }
        if state.routes.get(&route.app_id) == Some(route) {
            return Ok(false);
        }
        state.routes.insert(route.app_id.clone(), route.clone());
        state.writes += 1;
        Ok(true)
    }

    async fn remove_route(&self, app_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_removals > 0 {
            state.failing_removals -= 1;
            return Err(NetworkError::Proxy("injected removal failure".into()));
        }
        state.routes.remove(app_id);
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.state.lock().await.reloads += 1;
        Ok(())
    }
}

#[derive(Default)]
struct DnsState {
    records: BTreeMap<String, String>,
    upserts: usize,
    failing_upserts: usize,
}

/// DNS provider keeping records in memory.
#[derive(Clone, Default)]
pub struct MemoryDns {
    state: Arc<Mutex<DnsState>>,
}

impl MemoryDns {
    /// Create an empty zone.
    pub fn new() -> Self {
        Self::default()
    }

    /// Target of a record.
    pub async fn record(&self, name: &str) -> Option<String> {
        self.state.lock().await.records.get(name).cloned()
    }

    /// Number of successful upserts.
    pub async fn upsert_count(&self) -> usize {
        self.state.lock().await.upserts
    }

    /// Fail the next `n` upserts.
    pub async fn fail_next_upserts(&self, n: usize) {
        self.state.lock().await.failing_upserts = n;
    }
}

#[async_trait]
impl DnsProvider for MemoryDns {
    async fn lookup(&self, name: &str) -> Result<Option<String>> {
        Ok(self.state.lock().await.records.get(name).cloned())
    }

    async fn upsert(&self, name: &str, target: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_upserts > 0 {
            state.failing_upserts -= 1;
            return Err(NetworkError::Dns("injected upsert failure".into()));
        }
        state.records.insert(name.to_string(), target.to_string());
        state.upserts += 1;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.state.lock().await.records.remove(name);
        Ok(())
    }
}

/// Certificate store keeping material in memory.
#[derive(Clone, Default)]
pub struct MemoryCertificateStore {
    certs: Arc<Mutex<HashMap<String, TlsMaterial>>>,
}

impl MemoryCertificateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether material is installed for `vhost`.
    pub async fn has(&self, vhost: &str) -> bool {
        self.certs.lock().await.contains_key(vhost)
    }
}

#[async_trait]
impl CertificateStore for MemoryCertificateStore {
    async fn install(&self, vhost: &str, tls: &TlsMaterial) -> Result<()> {
        self.certs
            .lock()
            .await
            .insert(vhost.to_string(), tls.clone());
        Ok(())
    }

    async fn remove(&self, vhost: &str) -> Result<()> {
        self.certs.lock().await.remove(vhost);
        Ok(())
    }
}
