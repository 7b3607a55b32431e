// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! nginx route files, one per app.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{NetworkError, Result, ReverseProxy, Route};
use crate::network::certs::cert_paths;

const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes `<config_dir>/<app id>.conf` and runs a reload command.
#[derive(Debug, Clone)]
pub struct NginxProxy {
    config_dir: PathBuf,
    cert_dir: PathBuf,
    reload_cmd: Option<String>,
}

impl NginxProxy {
    /// Create a writer. Without a reload command, reloads are no-ops.
    pub fn new(config_dir: PathBuf, cert_dir: PathBuf, reload_cmd: Option<String>) -> Self {
        Self {
            config_dir,
            cert_dir,
            reload_cmd,
        }
    }

    fn route_path(&self, app_id: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", app_id))
    }

    fn render(&self, route: &Route) -> String {
        let (cert, key) = if route.custom_tls {
            cert_paths(&self.cert_dir, &route.vhost)
        } else {
            (self.cert_dir.join("host.cert"), self.cert_dir.join("host.key"))
        };

        format!(
            r#"# app {app_id}
server {{
    listen 443 ssl http2;
    server_name {vhost};

    ssl_certificate {cert};
    ssl_certificate_key {key};

    client_max_body_size 1m;

    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_http_version 1.1;
        proxy_set_header Host $host;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto https;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
    }}
}}
"#,
            app_id = route.app_id,
            vhost = route.vhost,
            cert = cert.display(),
            key = key.display(),
            port = route.http_port,
        )
    }
}

#[async_trait]
impl ReverseProxy for NginxProxy {
    async fn write_route(&self, route: &Route) -> Result<bool> {
        let path = self.route_path(&route.app_id);
        let contents = self.render(route);

        if let Ok(existing) = tokio::fs::read_to_string(&path).await
            && existing == contents
        {
            return Ok(false);
        }

        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| NetworkError::Proxy(format!("create {:?}: {}", self.config_dir, e)))?;

        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| NetworkError::Proxy(format!("write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| NetworkError::Proxy(format!("rename {:?}: {}", path, e)))?;

        debug!(app_id = %route.app_id, path = ?path, "Route file written");
        Ok(true)
    }

    async fn remove_route(&self, app_id: &str) -> Result<()> {
        let path = self.route_path(app_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NetworkError::Proxy(format!("remove {:?}: {}", path, e))),
        }
    }

    async fn reload(&self) -> Result<()> {
        let Some(cmd) = &self.reload_cmd else {
            return Ok(());
        };

        let output = tokio::time::timeout(
            RELOAD_TIMEOUT,
            Command::new("sh").arg("-c").arg(cmd).output(),
        )
        .await
        .map_err(|_| NetworkError::Proxy(format!("reload timed out after {:?}", RELOAD_TIMEOUT)))?
        .map_err(|e| NetworkError::Proxy(format!("reload: {}", e)))?;

        if !output.status.success() {
            return Err(NetworkError::Proxy(format!(
                "reload exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(command = %cmd, "Reverse proxy reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn route(port: u16, custom_tls: bool) -> Route {
        Route {
            app_id: "a1".into(),
            vhost: "foo.box.test".into(),
            http_port: port,
            custom_tls,
        }
    }

    #[tokio::test]
    async fn test_write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let proxy = NginxProxy::new(dir.path().join("apps"), dir.path().join("cert"), None);

        assert!(proxy.write_route(&route(40001, false)).await.unwrap());
        assert!(!proxy.write_route(&route(40001, false)).await.unwrap());
        assert!(proxy.write_route(&route(40002, false)).await.unwrap());

        let contents = std::fs::read_to_string(dir.path().join("apps/a1.conf")).unwrap();
        assert!(contents.contains("server_name foo.box.test;"));
        assert!(contents.contains("proxy_pass http://127.0.0.1:40002;"));
        assert!(contents.contains("host.cert"));
    }

    #[tokio::test]
    async fn test_custom_tls_route_references_vhost_cert() {
        let dir = TempDir::new().unwrap();
        let proxy = NginxProxy::new(dir.path().join("apps"), dir.path().join("cert"), None);

        proxy.write_route(&route(40001, true)).await.unwrap();
        let contents = std::fs::read_to_string(dir.path().join("apps/a1.conf")).unwrap();
        assert!(contents.contains("foo.box.test.cert"));
        assert!(contents.contains("foo.box.test.key"));
    }

    #[tokio::test]
    async fn test_remove_absent_route_is_ok() {
        let dir = TempDir::new().unwrap();
        let proxy = NginxProxy::new(dir.path().to_path_buf(), dir.path().to_path_buf(), None);
        proxy.remove_route("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_reload_command_is_an_error() {
        let dir = TempDir::new().unwrap();
        let proxy = NginxProxy::new(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            Some("exit 3".to_string()),
        );
        assert!(matches!(proxy.reload().await, Err(NetworkError::Proxy(_))));
    }
}
