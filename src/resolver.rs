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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pingora::http::RequestHeader;
use tracing::{debug, warn};

use crate::catalog::SandboxCatalog;
use crate::errors::{CatalogError, PausedServiceError, ResolveError};
use crate::host::{self, SandboxTarget};
use crate::paused::PausedSandboxService;
use crate::resume;

/// Connection key used at the client edge (§3): one shared upstream pool,
/// because the orchestrator-proxy layer (not built here) re-splits per
/// sandbox downstream via `execution_id`.
pub const CLIENT_EDGE_CONNECTION_KEY: &str = "client-proxy";

pub const DEFAULT_RESUME_WAIT_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_RESUME_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PAUSED_INFO_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved upstream target for a single request (§3). Constructed per
/// request and consumed by the proxy handler; never stored.
#[derive(Debug, Clone)]
pub struct Destination {
    pub url_host: String,
    pub url_port: u16,
    pub sandbox_id: String,
    pub sandbox_port: u64,
    pub connection_key: String,
    pub default_to_port_error: bool,
    pub mask_request_host: Option<String>,
}

impl Destination {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.url_host, self.url_port)
    }
}

pub struct ResolverConfig {
    pub orchestrator_proxy_port: u16,
    pub resume_wait_interval: Duration,
    pub resume_wait_timeout: Duration,
    pub paused_info_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            orchestrator_proxy_port: 5007,
            resume_wait_interval: DEFAULT_RESUME_WAIT_INTERVAL,
            resume_wait_timeout: DEFAULT_RESUME_WAIT_TIMEOUT,
            paused_info_timeout: DEFAULT_PAUSED_INFO_TIMEOUT,
        }
    }
}

/// Composes host parsing, catalog lookup, the paused-service check, the
/// resume trigger, and the catalog re-poll into a single `Resolve` call
/// (§4.5).
pub struct DestinationResolver {
    catalog: Arc<dyn SandboxCatalog>,
    paused: Option<Arc<dyn PausedSandboxService>>,
    auto_resume_flag: AtomicBool,
    config: ResolverConfig,
}

impl DestinationResolver {
    pub fn new(
        catalog: Arc<dyn SandboxCatalog>,
        paused: Option<Arc<dyn PausedSandboxService>>,
        auto_resume_flag_enabled: bool,
        config: ResolverConfig,
    ) -> Self {
        DestinationResolver {
            catalog,
            paused,
            auto_resume_flag: AtomicBool::new(auto_resume_flag_enabled),
            config,
        }
    }

    pub fn set_auto_resume_flag(&self, enabled: bool) {
        self.auto_resume_flag.store(enabled, Ordering::Relaxed);
    }

    pub async fn resolve(&self, req_header: &RequestHeader) -> Result<Destination, ResolveError> {
        let target = host::parse_target(req_header)?;

        match self.catalog.get(&target.sandbox_id).await {
            Ok(info) => Ok(self.build_destination(&target, &info.orchestrator_ip)),
            Err(CatalogError::SandboxNotFound) => self.resolve_on_miss(req_header, &target).await,
            Err(CatalogError::Backend(e)) => {
                warn!(sandbox_id = %target.sandbox_id, error = %e, "catalog backend error");
                Err(ResolveError::Internal(e.to_string()))
            }
        }
    }

    async fn resolve_on_miss(
        &self,
        req_header: &RequestHeader,
        target: &SandboxTarget,
    ) -> Result<Destination, ResolveError> {
        let Some(paused) = &self.paused else {
            return Err(ResolveError::SandboxNotFound);
        };

        let auth_header = header_value(req_header, http::header::AUTHORIZATION.as_str());
        let api_key_header = header_value(req_header, "X-API-Key");

        let info = match tokio::time::timeout(
            self.config.paused_info_timeout,
            paused.paused_info(&target.sandbox_id, auth_header.as_deref(), api_key_header.as_deref()),
        )
        .await
        {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                debug!(sandbox_id = %target.sandbox_id, error = %e, "paused-info call failed");
                return Err(ResolveError::SandboxNotFound);
            }
            Err(_) => return Err(ResolveError::SandboxNotFound),
        };

        if !info.paused {
            return Err(ResolveError::SandboxNotFound);
        }

        let has_auth = resume::request_has_auth(req_header);
        let flag_enabled = self.auto_resume_flag.load(Ordering::Relaxed);
        let auto = resume::should_auto_resume(info.auto_resume_policy, flag_enabled, has_auth);
        if !auto {
            return Err(ResolveError::SandboxPaused {
                can_auto_resume: false,
            });
        }

        match paused
            .resume(
                &target.sandbox_id,
                self.config.resume_wait_timeout,
                auth_header.as_deref(),
                api_key_header.as_deref(),
            )
            .await
        {
            Err(PausedServiceError::PreconditionFailed(reason)) => {
                debug!(sandbox_id = %target.sandbox_id, reason, "resume precondition failed");
                return Err(ResolveError::SandboxPaused {
                    can_auto_resume: false,
                });
            }
            Err(e) => {
                warn!(sandbox_id = %target.sandbox_id, error = %e, "resume call failed, will still poll");
            }
            Ok(()) => {}
        }

        self.poll_until_resumed(target).await
    }

    async fn poll_until_resumed(&self, target: &SandboxTarget) -> Result<Destination, ResolveError> {
        let deadline = tokio::time::Instant::now() + self.config.resume_wait_timeout;
        loop {
            if let Ok(info) = self.catalog.get(&target.sandbox_id).await {
                return Ok(self.build_destination(target, &info.orchestrator_ip));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ResolveError::SandboxPaused {
                    can_auto_resume: true,
                });
            }
            tokio::time::sleep(self.config.resume_wait_interval).await;
        }
    }

    fn build_destination(&self, target: &SandboxTarget, orchestrator_ip: &str) -> Destination {
        Destination {
            url_host: orchestrator_ip.to_string(),
            url_port: self.config.orchestrator_proxy_port,
            sandbox_id: target.sandbox_id.clone(),
            sandbox_port: target.sandbox_port,
            connection_key: CLIENT_EDGE_CONNECTION_KEY.to_string(),
            default_to_port_error: false,
            mask_request_host: None,
        }
    }
}

fn header_value(req_header: &RequestHeader, name: &str) -> Option<String> {
    req_header
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory::MemoryCatalog;
    use crate::catalog::{AutoResumePolicy, SandboxInfo};
    use crate::paused::{PausedInfo, PausedSandboxService};
    use parking_lot::Mutex;
    use std::time::Duration as StdDuration;

    fn req() -> RequestHeader {
        RequestHeader::build("GET", b"/", None).unwrap()
    }

    /// Stands in for the gRPC `PausedClient` in tests (§8): canned
    /// `paused_info`/`resume` outcomes, with a counter so tests can assert
    /// `Resume` was or wasn't called. `on_resume` lets a test simulate the
    /// orchestrator populating the catalog once `Resume` lands.
    struct FakePausedService {
        info: PausedInfo,
        resume_result: Result<(), PausedServiceError>,
        resume_calls: Mutex<u32>,
        on_resume: Option<Box<dyn Fn() + Send + Sync>>,
    }

    impl FakePausedService {
        fn new(info: PausedInfo) -> Self {
            FakePausedService {
                info,
                resume_result: Ok(()),
                resume_calls: Mutex::new(0),
                on_resume: None,
            }
        }

        fn with_resume_result(mut self, result: Result<(), PausedServiceError>) -> Self {
            self.resume_result = result;
            self
        }

        fn with_on_resume(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
            self.on_resume = Some(Box::new(f));
            self
        }

        fn resume_call_count(&self) -> u32 {
            *self.resume_calls.lock()
        }
    }

    #[async_trait::async_trait]
    impl PausedSandboxService for FakePausedService {
        async fn paused_info(
            &self,
            _sandbox_id: &str,
            _auth_header: Option<&str>,
            _api_key_header: Option<&str>,
        ) -> Result<PausedInfo, PausedServiceError> {
            Ok(self.info)
        }

        async fn resume(
            &self,
            _sandbox_id: &str,
            _timeout: Duration,
            _auth_header: Option<&str>,
            _api_key_header: Option<&str>,
        ) -> Result<(), PausedServiceError> {
            *self.resume_calls.lock() += 1;
            if self.resume_result.is_ok() {
                if let Some(f) = &self.on_resume {
                    f();
                }
            }
            self.resume_result.clone()
        }
    }

    fn info(ip: &str) -> SandboxInfo {
        SandboxInfo {
            orchestrator_id: "orc-1".to_string(),
            orchestrator_ip: ip.to_string(),
            execution_id: "exec-a".to_string(),
            sandbox_started_at: 0,
            sandbox_max_length_in_hours: 1,
        }
    }

    fn resolver_without_paused(catalog: Arc<dyn SandboxCatalog>) -> DestinationResolver {
        DestinationResolver::new(catalog, None, true, ResolverConfig::default())
    }

    #[tokio::test]
    async fn invalid_host_is_rejected_before_any_catalog_call() {
        let catalog: Arc<dyn SandboxCatalog> = Arc::new(MemoryCatalog::new());
        let resolver = resolver_without_paused(catalog);
        let mut header = req();
        header
            .insert_header(http::header::HOST, "not-a-valid-host")
            .unwrap();
        let err = resolver.resolve(&header).await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidHost));
    }

    #[tokio::test]
    async fn catalog_hit_builds_destination_from_orchestrator_ip() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog
            .store("sbxABC", &info("10.0.0.7"), StdDuration::from_secs(60))
            .await
            .unwrap();
        let resolver = resolver_without_paused(catalog);

        let mut header = req();
        header
            .insert_header(http::header::HOST, "3000-sbxABC.e2b.app")
            .unwrap();

        let destination = resolver.resolve(&header).await.unwrap();
        assert_eq!(destination.url_host, "10.0.0.7");
        assert_eq!(destination.sandbox_port, 3000);
        assert_eq!(destination.connection_key, CLIENT_EDGE_CONNECTION_KEY);
    }

    #[tokio::test]
    async fn miss_with_no_paused_client_is_sandbox_not_found() {
        let catalog: Arc<dyn SandboxCatalog> = Arc::new(MemoryCatalog::new());
        let resolver = resolver_without_paused(catalog);

        let mut header = req();
        header
            .insert_header(http::header::HOST, "3000-sbxMISS.e2b.app")
            .unwrap();

        let err = resolver.resolve(&header).await.unwrap_err();
        assert!(matches!(err, ResolveError::SandboxNotFound));
    }

    fn fast_poll_config() -> ResolverConfig {
        ResolverConfig {
            orchestrator_proxy_port: 5007,
            resume_wait_interval: Duration::from_millis(5),
            resume_wait_timeout: Duration::from_millis(200),
            paused_info_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn paused_with_flag_off_does_not_auto_resume_or_call_resume() {
        let catalog: Arc<dyn SandboxCatalog> = Arc::new(MemoryCatalog::new());
        let paused = Arc::new(FakePausedService::new(PausedInfo {
            paused: true,
            auto_resume_policy: AutoResumePolicy::Any,
        }));
        let resolver = DestinationResolver::new(
            catalog,
            Some(paused.clone() as Arc<dyn PausedSandboxService>),
            false,
            fast_poll_config(),
        );

        let mut header = req();
        header
            .insert_header(http::header::HOST, "3000-sbxPAUSED.e2b.app")
            .unwrap();

        let err = resolver.resolve(&header).await.unwrap_err();
        assert!(matches!(err, ResolveError::SandboxPaused { can_auto_resume: false }));
        assert_eq!(paused.resume_call_count(), 0);
    }

    #[tokio::test]
    async fn paused_auto_resume_polls_the_catalog_until_the_sandbox_reappears() {
        let catalog: Arc<dyn SandboxCatalog> = Arc::new(MemoryCatalog::new());
        let catalog_for_resume = catalog.clone();

        let paused = Arc::new(FakePausedService::new(PausedInfo {
            paused: true,
            auto_resume_policy: AutoResumePolicy::Any,
        }).with_on_resume(move || {
            let catalog = catalog_for_resume.clone();
            tokio::spawn(async move {
                let _ = catalog
                    .store("sbxRESUMED", &info("10.0.0.9"), StdDuration::from_secs(60))
                    .await;
            });
        }));

        let resolver = DestinationResolver::new(
            catalog,
            Some(paused.clone() as Arc<dyn PausedSandboxService>),
            true,
            fast_poll_config(),
        );

        let mut header = req();
        header
            .insert_header(http::header::HOST, "3000-sbxRESUMED.e2b.app")
            .unwrap();

        let destination = resolver.resolve(&header).await.unwrap();
        assert_eq!(destination.url_host, "10.0.0.9");
        assert_eq!(paused.resume_call_count(), 1);
    }

    #[tokio::test]
    async fn resume_denied_by_server_returns_paused_without_auto_resume() {
        let catalog: Arc<dyn SandboxCatalog> = Arc::new(MemoryCatalog::new());
        let paused = Arc::new(
            FakePausedService::new(PausedInfo {
                paused: true,
                auto_resume_policy: AutoResumePolicy::Any,
            })
            .with_resume_result(Err(PausedServiceError::PreconditionFailed(
                "policy forbids auto-resume".to_string(),
            ))),
        );

        let resolver = DestinationResolver::new(
            catalog,
            Some(paused.clone() as Arc<dyn PausedSandboxService>),
            true,
            fast_poll_config(),
        );

        let mut header = req();
        header
            .insert_header(http::header::HOST, "3000-sbxDENIED.e2b.app")
            .unwrap();

        let err = resolver.resolve(&header).await.unwrap_err();
        assert!(matches!(err, ResolveError::SandboxPaused { can_auto_resume: false }));
        assert_eq!(paused.resume_call_count(), 1);
    }
}
