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

mod catalog;
mod config;
mod discovery;
mod errors;
mod health;
mod host;
mod lifecycle;
mod paused;
mod pool;
mod proxy;
mod resolver;
mod resume;
mod shutdown;
mod templates;

use std::sync::Arc;
use std::time::Duration;

use pingora::prelude::{background_service, Opt};
use pingora::proxy::http_proxy_service;
use pingora::server::Server;
use pingora::services::listening::Service as ListeningService;

use crate::catalog::fallback::FallbackCatalog;
use crate::catalog::memory::MemoryCatalog;
use crate::catalog::shared::SharedCatalog;
use crate::catalog::SandboxCatalog;
use crate::config::EdgeConfig;
use crate::health::HealthApp;
use crate::lifecycle::ServiceInfo;
use crate::paused::{PausedClient, PausedSandboxService};
use crate::pool::{ConnectionPool, UpstreamSettings};
use crate::proxy::ProxyRouter;
use crate::resolver::{DestinationResolver, ResolverConfig};
use crate::shutdown::{CatalogCloser, Closer, PoolCloser, ShutdownCoordinator};

// the sandbox edge proxy. Every downstream request carries an
// orchestrator-derived host label; this process resolves it to a live
// sandbox, auto-resuming a paused one when the policy allows it, and
// proxies the request through a connection pool isolated per
// `connection_key` (§3-§4 of the design).
fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let _ = dotenv::dotenv();
    let edge_config = EdgeConfig::from_env();

    let opt = Opt::parse_args();
    let mut server = Server::new(Some(opt)).unwrap();
    server.bootstrap();

    // catalog, paused-service client and pool all need an async runtime to
    // dial out; pingora itself only spins up tokio once `run_forever` is
    // called, so bootstrap them on one of our own first.
    let runtime = tokio::runtime::Runtime::new().expect("build bootstrap runtime");

    let catalog: Arc<dyn SandboxCatalog> = runtime.block_on(async {
        match &edge_config.shared_store_url {
            Some(url) => {
                let shared = SharedCatalog::connect(url)
                    .await
                    .expect("connect to shared sandbox store");
                Arc::new(FallbackCatalog::new(shared, MemoryCatalog::new())) as Arc<dyn SandboxCatalog>
            }
            None => Arc::new(MemoryCatalog::new()) as Arc<dyn SandboxCatalog>,
        }
    });

    let paused_client: Option<Arc<dyn PausedSandboxService>> =
        edge_config.paused_service_addr.clone().map(|addr| {
            let client = runtime
                .block_on(PausedClient::connect(addr))
                .expect("connect to paused sandbox service");
            Arc::new(client) as Arc<dyn PausedSandboxService>
        });

    let resolver = Arc::new(DestinationResolver::new(
        catalog.clone(),
        paused_client,
        edge_config.auto_resume_flag_enabled,
        ResolverConfig {
            orchestrator_proxy_port: edge_config.orchestrator_proxy_port,
            resume_wait_interval: edge_config.resume_wait_interval,
            resume_wait_timeout: edge_config.resume_wait_timeout,
            paused_info_timeout: edge_config.paused_info_timeout,
        },
    ));

    let pool_settings = UpstreamSettings::new(
        8192,
        edge_config.upstream_idle_timeout,
        Duration::from_secs(30),
    );
    let pool = Arc::new(ConnectionPool::new(pool_settings));

    let service_info = Arc::new(ServiceInfo::new());

    let proxy_router = ProxyRouter::new(resolver, pool.clone());
    let mut proxy_service = http_proxy_service(&server.configuration, proxy_router);
    proxy_service.add_tcp(&format!("0.0.0.0:{}", edge_config.proxy_port));
    server.add_service(proxy_service);

    let health_app = HealthApp::new(service_info.clone());
    let mut health_service = ListeningService::new("sandbox edge health service".to_string(), health_app);
    health_service.add_tcp(&format!("0.0.0.0:{}", edge_config.health_port));
    server.add_service(health_service);

    let closers: Vec<Arc<dyn Closer>> = vec![Arc::new(CatalogCloser(catalog)), Arc::new(PoolCloser(pool))];
    let shutdown_coordinator = ShutdownCoordinator::new(service_info, closers);
    server.add_service(background_service("shutdown coordinator", shutdown_coordinator));

    server.run_forever();
}
