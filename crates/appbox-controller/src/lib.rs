// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Appbox Controller - Application Lifecycle Management
//!
//! This crate is the control plane of a single-host app box. It installs,
//! configures, runs and removes containerized applications, each bound to a
//! unique subdomain and optionally backed by sidecar addons.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Clients                                 │
//! │                       (admin UI, CLI, scripts)                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ HTTP /api/v1/apps
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   appbox-controller (This Crate)                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │ AppService  │─▶│    Task     │─▶│  Lifecycle  │  │   Health    │     │
//! │  │ (validate)  │  │  Scheduler  │  │   (steps)   │  │ Supervisor  │     │
//! │  └─────────────┘  └─────────────┘  └──────┬──────┘  └──────┬──────┘     │
//! └────────────────────────────────────────────┼────────────────┼───────────┘
//!           │                    ┌─────────────┼────────────┐   │
//!           ▼                    ▼             ▼            ▼   ▼
//! ┌──────────────────┐  ┌──────────────┐ ┌──────────┐ ┌───────────────────┐
//! │   App Registry   │  │    Addons    │ │ Network  │ │ Container Driver  │
//! │     (SQLite)     │  │ redis/oauth/ │ │ nginx,   │ │     (Docker)      │
//! │                  │  │  sendmail    │ │ DNS, TLS │ │                   │
//! └──────────────────┘  └──────────────┘ └──────────┘ └───────────────────┘
//! ```
//!
//! # HTTP API
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /api/v1/apps/install` | Validate, purchase, record and start installing (202 `{id}`) |
//! | `GET /api/v1/apps` | Apps visible to the caller |
//! | `GET /api/v1/apps/{id}` | One app |
//! | `POST /api/v1/apps/{id}/configure` | Replace location, ports, access, TLS (202) |
//! | `POST /api/v1/apps/{id}/start` | Start an installed app (202) |
//! | `POST /api/v1/apps/{id}/stop` | Stop an installed app (202) |
//! | `POST /api/v1/apps/{id}/uninstall` | Tear down and delete, password required (202) |
//! | `POST /api/v1/apps/{id}/retry` | Re-run a failed install or network registration (202) |
//!
//! A request for an app that already has a lifecycle task in flight is
//! answered with `409 Conflict`.
//!
//! # Installation State Machine
//!
//! ```text
//!  PENDING_INSTALL
//!        │
//!        ▼
//!  DOWNLOADING_MANIFEST ──┐
//!        │                │
//!        ▼                │
//!  DOWNLOADING_IMAGE ─────┤
//!        │                │
//!        ▼                │
//!  CREATING_VOLUME ───────┤
//!        │                ├──────▶ ERROR ──retry──▶ PENDING_INSTALL
//!        ▼                │
//!  CREATING_CONTAINER ◀───┼──── configure (from INSTALLED, ERROR, SUBDOMAIN_ERROR)
//!        │                │
//!        ▼                │
//!  REGISTERING_SUBDOMAIN ─┴──────▶ SUBDOMAIN_ERROR ──repair──┐
//!        │        ▲                                          │
//!        ▼        └──────────────────────────────────────────┘
//!    INSTALLED
//!
//!  any state ──uninstall──▶ PENDING_UNINSTALL ──▶ (record deleted)
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `APPBOX_FQDN` | Yes | - | Box domain |
//! | `APPBOX_DATABASE_URL` | No | `sqlite://<data dir>/appbox.db?mode=rwc` | Registry database |
//! | `APPBOX_HTTP_PORT` | No | `3000` | Control-plane HTTP port |
//! | `APPBOX_DATA_DIR` | No | `.data` | Data directory |
//! | `APPBOX_ADMIN_LOCATION` | No | `my` | Reserved admin subdomain |
//! | `APPBOX_NGINX_APPCONFIG_DIR` | No | `<data dir>/nginx/applications` | Route files |
//! | `APPBOX_NGINX_RELOAD_CMD` | No | - | Run after route changes |
//! | `APPBOX_CERT_DIR` | No | `<data dir>/nginx/cert` | Custom TLS material |
//! | `APPBOX_APPSTORE_ORIGIN` | No | - | Purchase API; unset skips purchases |
//! | `APPBOX_ADMIN_TOKEN` | No | - | Admin bearer token |
//! | `APPBOX_ADMIN_PASSWORD` | No | - | Uninstall confirmation password |
//! | `APPBOX_DOCKER_NETWORK` | No | `appbox` | User-defined network containers join, created at startup |
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`registry`]: Durable app records (SQLite, in-memory)
//! - [`driver`]: Container runtime (Docker, mock)
//! - [`addons`]: Sidecar provisioning and credentials
//! - [`network`]: Reverse proxy, DNS and certificates
//! - [`lifecycle`]: Per-app step sequences
//! - [`scheduler`]: Per-app task ownership, drain and restart resume
//! - [`health`]: Run state supervision
//! - [`apps`]: Request-level operations
//! - [`server`]: HTTP API
//! - [`runtime`]: Embeddable runtime

#![deny(missing_docs)]

/// Embedded SQLite migrations for the registry and credential store.
///
/// ```ignore
/// use appbox_controller::migrations;
///
/// let pool = SqlitePool::connect(&database_url).await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types for controller operations.
pub mod error;

/// App records, manifests and lifecycle states.
pub mod model;

/// Durable app registry.
pub mod registry;

/// Container runtime drivers.
pub mod driver;

/// Bounded retry with backoff.
pub mod retry;

/// Sidecar addons.
pub mod addons;

/// Subdomain registration.
pub mod network;

/// Per-app lifecycle state machine.
pub mod lifecycle;

/// Per-app task scheduling.
pub mod scheduler;

/// Background health supervision.
pub mod health;

/// App store purchases.
pub mod appstore;

/// Caller authentication.
pub mod auth;

/// Request-level app operations.
pub mod apps;

/// HTTP API.
pub mod server;

/// Embeddable runtime wiring everything together.
pub mod runtime;

pub use error::{Error, Result};
