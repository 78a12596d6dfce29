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

use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::apps::http_app::ServeHttp;
use pingora::protocols::http::ServerSession;

use crate::lifecycle::{ServiceInfo, Status};

/// Serves `/health`, `/health/traffic`, `/health/machine` (§4.8, §6), backed
/// by the process-wide `ServiceInfo`. Implemented as its own `ServeHttp`
/// rather than reusing `ProxyRouter`, since it never dials an upstream.
pub struct HealthApp {
    service_info: Arc<ServiceInfo>,
}

impl HealthApp {
    pub fn new(service_info: Arc<ServiceInfo>) -> Self {
        HealthApp { service_info }
    }
}

#[async_trait]
impl ServeHttp for HealthApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        let path = http_session.req_header().uri.path().to_string();
        let status = self.service_info.status();

        let (code, body) = match path.as_str() {
            "/health" => {
                if matches!(status, Status::Healthy | Status::Draining) {
                    (StatusCode::OK, "healthy")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
                }
            }
            "/health/traffic" => {
                if status == Status::Healthy {
                    (StatusCode::OK, "healthy")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "draining")
                }
            }
            "/health/machine" => {
                if self.service_info.terminating() {
                    (StatusCode::SERVICE_UNAVAILABLE, "terminating")
                } else {
                    (StatusCode::OK, "running")
                }
            }
            _ => (StatusCode::NOT_FOUND, "not found"),
        };

        Response::builder()
            .status(code)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.as_bytes().to_vec())
            .unwrap()
    }
}
