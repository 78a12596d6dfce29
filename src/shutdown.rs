/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;
use tracing::info;

use crate::catalog::SandboxCatalog;
use crate::lifecycle::ServiceInfo;
use crate::pool::ConnectionPool;

pub const DEFAULT_DRAIN_WAIT: Duration = Duration::from_secs(15);
pub const DEFAULT_UNHEALTHY_WAIT: Duration = Duration::from_secs(15);

/// A resource closed at the end of the shutdown sequence (§4.9 step 5):
/// the feature-flag client, the catalogs, the paused client, the pool.
/// Returning `Err` marks the process exit as non-zero (§6 "Exit codes").
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

/// Orchestrates Draining -> wait -> Unhealthy -> wait -> close resources
/// (§4.9). Registered as a pingora `BackgroundService`: pingora's own
/// `Server` already owns the signal handling and the HTTP listeners'
/// graceful-stop timeline (driven by `grace_period_seconds` /
/// `graceful_shutdown_timeout_seconds` in `ServerConf`); this coordinator
/// piggybacks on the same `ShutdownWatch` to drive `ServiceInfo` and tear
/// down everything pingora doesn't own.
pub struct ShutdownCoordinator {
    service_info: Arc<ServiceInfo>,
    drain_wait: Duration,
    unhealthy_wait: Duration,
    closers: Vec<Arc<dyn Closer>>,
}

impl ShutdownCoordinator {
    pub fn new(service_info: Arc<ServiceInfo>, closers: Vec<Arc<dyn Closer>>) -> Self {
        ShutdownCoordinator {
            service_info,
            drain_wait: DEFAULT_DRAIN_WAIT,
            unhealthy_wait: DEFAULT_UNHEALTHY_WAIT,
            closers,
        }
    }

    pub fn with_waits(mut self, drain_wait: Duration, unhealthy_wait: Duration) -> Self {
        self.drain_wait = drain_wait;
        self.unhealthy_wait = unhealthy_wait;
        self
    }
}

#[async_trait]
impl BackgroundService for ShutdownCoordinator {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        // Wait for pingora to observe SIGTERM/SIGINT and start its own
        // graceful-stop sequence; we run alongside it.
        let _ = shutdown.changed().await;

        info!("shutdown sequence started");
        self.service_info.set_terminating();

        self.service_info.set_draining();
        tokio::time::sleep(self.drain_wait).await;

        self.service_info.set_unhealthy();
        tokio::time::sleep(self.unhealthy_wait).await;

        // §6 "Exit codes": every closer is one of the goroutines in the
        // original exit-accounting scheme; a single failure is enough to
        // make the whole process exit non-zero.
        let mut failures = 0u32;
        for closer in &self.closers {
            if let Err(e) = closer.close().await {
                tracing::error!(error = %e, "closer returned an error during shutdown");
                failures += 1;
            }
        }
        info!(failures, "shutdown sequence complete");
        std::process::exit(if failures == 0 { 0 } else { 1 });
    }
}

pub struct CatalogCloser(pub Arc<dyn SandboxCatalog>);

#[async_trait]
impl Closer for CatalogCloser {
    async fn close(&self) -> anyhow::Result<()> {
        self.0.close().await.map_err(|e| anyhow::anyhow!(e))
    }
}

pub struct PoolCloser(pub Arc<ConnectionPool>);

#[async_trait]
impl Closer for PoolCloser {
    async fn close(&self) -> anyhow::Result<()> {
        self.0.close_all();
        Ok(())
    }
}
