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

use std::time::Duration;

use validator::Validate;

/// Edge bootstrap config (§10.3), read from the environment names listed in
/// spec §6. There is no YAML cluster file: the edge has exactly one route
/// shape (host-derived sandbox lookup), so there is no equivalent of a
/// `ClusterConfig` list to parse.
#[derive(Debug, Clone, Validate)]
pub struct EdgeConfig {
    #[validate(range(min = 1, max = 65535))]
    pub proxy_port: u16,
    #[validate(range(min = 1, max = 65535))]
    pub health_port: u16,
    #[validate(length(min = 1))]
    pub shared_store_url: Option<String>,
    pub paused_service_addr: Option<String>,
    pub auto_resume_flag_enabled: bool,
    pub orchestrator_proxy_port: u16,
    pub resume_wait_interval: Duration,
    pub resume_wait_timeout: Duration,
    pub paused_info_timeout: Duration,
    pub downstream_idle_timeout: Duration,
    pub upstream_idle_timeout: Duration,
}

impl EdgeConfig {
    /// Reads every recognized environment variable (§6), falling back to
    /// spec defaults for anything unset.
    pub fn from_env() -> Self {
        let config = EdgeConfig {
            proxy_port: env_u16("PROXY_PORT", 3002),
            health_port: env_u16("HEALTH_PORT", 3003),
            shared_store_url: std::env::var("SHARED_STORE_URL").ok(),
            paused_service_addr: std::env::var("PAUSED_SERVICE_ADDR").ok(),
            auto_resume_flag_enabled: env_bool("AUTO_RESUME_ENABLED", true),
            orchestrator_proxy_port: env_u16("ORCHESTRATOR_PROXY_PORT", 5007),
            resume_wait_interval: Duration::from_millis(env_u64("RESUME_WAIT_INTERVAL_MS", 100)),
            resume_wait_timeout: Duration::from_secs(env_u64("RESUME_WAIT_TIMEOUT_SECONDS", 30)),
            paused_info_timeout: Duration::from_secs(env_u64("PAUSED_INFO_TIMEOUT_SECONDS", 5)),
            downstream_idle_timeout: Duration::from_secs(env_u64("DOWNSTREAM_IDLE_TIMEOUT_SECONDS", 100)),
            upstream_idle_timeout: Duration::from_secs(env_u64("UPSTREAM_IDLE_TIMEOUT_SECONDS", 90)),
        };

        if let Err(e) = config.validate() {
            panic!("invalid edge configuration: {e}");
        }

        // §6: downstream idle timeout must exceed upstream's by >= 10s, to
        // avoid the race where the upstream closes while the client still
        // intends to reuse the connection.
        if config.downstream_idle_timeout < config.upstream_idle_timeout + Duration::from_secs(10) {
            panic!("DOWNSTREAM_IDLE_TIMEOUT_SECONDS must exceed UPSTREAM_IDLE_TIMEOUT_SECONDS by at least 10s");
        }

        config
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
