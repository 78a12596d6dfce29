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

use serde::Serialize;

use crate::errors::ResolveError;

const BROWSER_TOKENS: &[&str] = &["mozilla", "chrome", "safari", "firefox", "edge", "opera", "msie"];

/// UA sniff for content negotiation (§4.7): browsers get HTML, everything
/// else gets JSON.
pub fn wants_html(user_agent: Option<&str>) -> bool {
    let Some(ua) = user_agent else {
        return false;
    };
    let ua = ua.to_lowercase();
    BROWSER_TOKENS.iter().any(|token| ua.contains(token))
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "sandboxId", skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub message: String,
    pub code: u16,
    #[serde(rename = "canAutoResume", skip_serializing_if = "Option::is_none")]
    pub can_auto_resume: Option<bool>,
}

/// One rendered response: status code, content type, and body bytes.
pub struct RenderedError {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// Renders a resolver error into an HTTP status + body, negotiated by the
/// caller's User-Agent (§4.7).
pub fn render(sandbox_id: Option<&str>, err: &ResolveError, user_agent: Option<&str>) -> RenderedError {
    match err {
        ResolveError::InvalidHost => plain_text(400, "Invalid host"),
        ResolveError::InvalidSandboxPort => plain_text(400, "Invalid sandbox port"),
        ResolveError::SandboxNotFound => render_negotiated(
            sandbox_id,
            502,
            "The sandbox was not found",
            None,
            user_agent,
            "Sandbox not found",
        ),
        ResolveError::SandboxPaused { can_auto_resume } => render_negotiated(
            sandbox_id,
            409,
            "The sandbox is paused",
            Some(*can_auto_resume),
            user_agent,
            "Sandbox paused",
        ),
        ResolveError::PortClosed { sandbox_port, .. } => render_negotiated(
            sandbox_id,
            502,
            &format!("Port {sandbox_port} is closed"),
            None,
            user_agent,
            "Port closed",
        ),
        ResolveError::Internal(_) => plain_text(500, "Internal error"),
    }
}

fn plain_text(status: u16, message: &str) -> RenderedError {
    RenderedError {
        status,
        content_type: "text/plain; charset=utf-8",
        body: message.as_bytes().to_vec(),
    }
}

fn render_negotiated(
    sandbox_id: Option<&str>,
    status: u16,
    message: &str,
    can_auto_resume: Option<bool>,
    user_agent: Option<&str>,
    title: &str,
) -> RenderedError {
    if wants_html(user_agent) {
        let html = html_page(title, message, status);
        RenderedError {
            status,
            content_type: "text/html; charset=utf-8",
            body: html.into_bytes(),
        }
    } else {
        let body = ErrorBody {
            sandbox_id: sandbox_id.map(str::to_string),
            message: message.to_string(),
            code: status,
            can_auto_resume,
        };
        let json = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
        RenderedError {
            status,
            content_type: "application/json",
            body: json,
        }
    }
}

fn html_page(title: &str, message: &str, status: u16) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{title}</title></head>\n\
         <body><h1>{status} {title}</h1><p>{message}</p></body></html>\n"
    )
}
