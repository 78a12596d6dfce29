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

use pingora::http::RequestHeader;

use crate::errors::HostParseError;

pub const HEADER_SANDBOX_ID: &str = "X-Sandbox-Id";
pub const HEADER_SANDBOX_PORT: &str = "X-Sandbox-Port";

/// The `(sandbox_id, sandbox_port)` pair extracted from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxTarget {
    pub sandbox_id: String,
    pub sandbox_port: u64,
}

/// Extracts the sandbox target from the request's `Host` header, falling
/// back to `X-Sandbox-Id`/`X-Sandbox-Port` when the host is absent or
/// doesn't parse (§4.1).
pub fn parse_target(req_header: &RequestHeader) -> Result<SandboxTarget, HostParseError> {
    let host = req_header
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req_header.uri.host());

    match host {
        Some(host) => match parse_host_label(host) {
            Ok(target) => Ok(target),
            Err(e) => parse_fallback_headers(req_header).or(Err(e)),
        },
        None => parse_fallback_headers(req_header),
    }
}

/// Parses just the `Host` header label (§4.1 steps 1-2), without the
/// fallback headers. Used directly by tests that want to exercise the
/// label-parsing algorithm in isolation.
pub fn parse_host_label(host: &str) -> Result<SandboxTarget, HostParseError> {
    let label = host
        .split_once('.')
        .map(|(label, _rest)| label)
        .ok_or(HostParseError::InvalidHost)?;
    let mut parts = label.splitn(3, '-');
    let port_part = parts.next().ok_or(HostParseError::InvalidHost)?;
    let id_part = parts.next().ok_or(HostParseError::InvalidHost)?;
    if id_part.is_empty() {
        return Err(HostParseError::InvalidHost);
    }
    let sandbox_port: u64 = port_part
        .parse()
        .map_err(|_| HostParseError::InvalidSandboxPort)?;
    Ok(SandboxTarget {
        sandbox_id: id_part.to_string(),
        sandbox_port,
    })
}

fn parse_fallback_headers(req_header: &RequestHeader) -> Result<SandboxTarget, HostParseError> {
    let sandbox_id = req_header
        .headers
        .get(HEADER_SANDBOX_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(HostParseError::InvalidHost)?;
    let sandbox_port = req_header
        .headers
        .get(HEADER_SANDBOX_PORT)
        .and_then(|v| v.to_str().ok())
        .ok_or(HostParseError::InvalidSandboxPort)?
        .parse::<u64>()
        .map_err(|_| HostParseError::InvalidSandboxPort)?;
    Ok(SandboxTarget {
        sandbox_id: sandbox_id.to_string(),
        sandbox_port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_and_id_with_trailing_label() {
        let target = parse_host_label("3000-sbxABC-00.e2b.app").unwrap();
        assert_eq!(target.sandbox_port, 3000);
        assert_eq!(target.sandbox_id, "sbxABC");
    }

    #[test]
    fn parses_port_and_id_without_trailing_label() {
        let target = parse_host_label("3000-sbxABC.e2b.app").unwrap();
        assert_eq!(target.sandbox_port, 3000);
        assert_eq!(target.sandbox_id, "sbxABC");
    }

    #[test]
    fn missing_dot_fails_invalid_host() {
        assert_eq!(
            parse_host_label("3000-sbxABC").unwrap_err(),
            HostParseError::InvalidHost
        );
    }

    #[test]
    fn non_numeric_port_fails_invalid_sandbox_port() {
        assert_eq!(
            parse_host_label("abc-sbxXYZ.e2b.app").unwrap_err(),
            HostParseError::InvalidSandboxPort
        );
    }

    #[test]
    fn missing_id_fails_invalid_host() {
        assert_eq!(
            parse_host_label("3000.e2b.app").unwrap_err(),
            HostParseError::InvalidHost
        );
    }

    #[test]
    fn round_trips_arbitrary_ids_and_ports() {
        for port in [0u64, 1, 42, u64::MAX] {
            for id in ["a", "z9", "sbx0123abcxyz"] {
                let host = format!("{port}-{id}-extra.e2b.app");
                let target = parse_host_label(&host).unwrap();
                assert_eq!(target.sandbox_port, port);
                assert_eq!(target.sandbox_id, id);

                let host = format!("{port}-{id}.e2b.app");
                let target = parse_host_label(&host).unwrap();
                assert_eq!(target.sandbox_port, port);
                assert_eq!(target.sandbox_id, id);
            }
        }
    }
}
