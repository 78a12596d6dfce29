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

use thiserror::Error;

/// Errors raised while pulling `(sandbox_id, sandbox_port)` out of a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostParseError {
    #[error("invalid host")]
    InvalidHost,
    #[error("invalid sandbox port")]
    InvalidSandboxPort,
}

/// Errors raised by either Sandbox Catalog backend.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("sandbox not found")]
    SandboxNotFound,
    #[error("catalog backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Errors raised by the Paused Sandbox Service client.
#[derive(Debug, Error, Clone)]
pub enum PausedServiceError {
    #[error("paused service precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("paused service transport error: {0}")]
    Transport(#[from] tonic::Status),
}

/// Typed errors the Destination Resolver can produce. The Reverse Proxy
/// Handler matches on these by kind (§7); never on a generic string.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid host")]
    InvalidHost,
    #[error("invalid sandbox port")]
    InvalidSandboxPort,
    #[error("sandbox not found")]
    SandboxNotFound,
    #[error("sandbox paused (can_auto_resume={can_auto_resume})")]
    SandboxPaused { can_auto_resume: bool },
    #[error("sandbox port closed: {sandbox_id}:{sandbox_port}")]
    PortClosed {
        sandbox_id: String,
        sandbox_port: u64,
    },
    #[error("internal resolver error: {0}")]
    Internal(String),
}

impl From<HostParseError> for ResolveError {
    fn from(e: HostParseError) -> Self {
        match e {
            HostParseError::InvalidHost => ResolveError::InvalidHost,
            HostParseError::InvalidSandboxPort => ResolveError::InvalidSandboxPort,
        }
    }
}

/// HTTP status + content-negotiated body kind the Handler renders a
/// `ResolveError` into. Kept separate from `ResolveError` itself so the
/// resolver never has to know about HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpOutcome {
    BadRequest,
    NotFound502,
    Paused409,
    PortClosed502,
    Internal500,
}

impl ResolveError {
    pub fn http_outcome(&self) -> HttpOutcome {
        match self {
            ResolveError::InvalidHost | ResolveError::InvalidSandboxPort => {
                HttpOutcome::BadRequest
            }
            ResolveError::SandboxNotFound => HttpOutcome::NotFound502,
            ResolveError::SandboxPaused { .. } => HttpOutcome::Paused409,
            ResolveError::PortClosed { .. } => HttpOutcome::PortClosed502,
            ResolveError::Internal(_) => HttpOutcome::Internal500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_parse_errors_map_onto_the_matching_resolve_error() {
        assert!(matches!(
            ResolveError::from(HostParseError::InvalidHost),
            ResolveError::InvalidHost
        ));
        assert!(matches!(
            ResolveError::from(HostParseError::InvalidSandboxPort),
            ResolveError::InvalidSandboxPort
        ));
    }

    #[test]
    fn each_resolve_error_kind_maps_to_the_http_outcome_in_section_7() {
        assert_eq!(ResolveError::InvalidHost.http_outcome(), HttpOutcome::BadRequest);
        assert_eq!(ResolveError::InvalidSandboxPort.http_outcome(), HttpOutcome::BadRequest);
        assert_eq!(ResolveError::SandboxNotFound.http_outcome(), HttpOutcome::NotFound502);
        assert_eq!(
            ResolveError::SandboxPaused { can_auto_resume: true }.http_outcome(),
            HttpOutcome::Paused409
        );
        assert_eq!(
            ResolveError::PortClosed { sandbox_id: "sbx1".into(), sandbox_port: 3000 }.http_outcome(),
            HttpOutcome::PortClosed502
        );
        assert_eq!(ResolveError::Internal("boom".into()).http_outcome(), HttpOutcome::Internal500);
    }
}
