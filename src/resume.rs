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

use crate::catalog::AutoResumePolicy;

/// Auto-Resume Policy Engine (§4.4): a pure function of the paused policy,
/// the feature flag, and whether the request carries credentials.
pub fn should_auto_resume(policy: AutoResumePolicy, flag_enabled: bool, request_has_auth: bool) -> bool {
    if !flag_enabled {
        return false;
    }
    match policy {
        AutoResumePolicy::Any => true,
        AutoResumePolicy::Authed => request_has_auth,
        AutoResumePolicy::Null | AutoResumePolicy::Unknown => false,
    }
}

/// True iff `Authorization` or `X-API-Key` is present and non-empty (§4.4).
pub fn request_has_auth(req_header: &RequestHeader) -> bool {
    header_non_empty(req_header, http::header::AUTHORIZATION.as_str())
        || header_non_empty(req_header, "X-API-Key")
}

fn header_non_empty(req_header: &RequestHeader, name: &str) -> bool {
    req_header
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.is_empty())
        .unwrap_or(false)
}
