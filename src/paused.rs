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

use async_trait::async_trait;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::Channel;
use tonic::{Code, Request};

use crate::catalog::AutoResumePolicy;
use crate::errors::PausedServiceError;

#[derive(Clone, PartialEq, ::prost::Message)]
struct PausedInfoRequest {
    #[prost(string, tag = "1")]
    sandbox_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct PausedInfoReply {
    #[prost(bool, tag = "1")]
    paused: bool,
    #[prost(string, tag = "2")]
    auto_resume_policy: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct ResumeRequest {
    #[prost(string, tag = "1")]
    sandbox_id: String,
    #[prost(uint32, tag = "2")]
    timeout_seconds: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
struct ResumeReply {}

const PAUSED_INFO_PATH: &str = "/sandbox.paused.v1.PausedSandboxService/GetPausedInfo";
const RESUME_PATH: &str = "/sandbox.paused.v1.PausedSandboxService/ResumeSandbox";

/// Result of `PausedInfo` (§4.3): whether the sandbox is paused and, if so,
/// who may resume it.
#[derive(Debug, Clone, Copy)]
pub struct PausedInfo {
    pub paused: bool,
    pub auto_resume_policy: AutoResumePolicy,
}

/// Contract consumed by the Destination Resolver (§4.3, §4.5). A nil client
/// is tolerated everywhere it's consumed; the resolver holds `Option<Arc<dyn
/// PausedSandboxService>>` rather than this type directly so tests can stand
/// in a fake without a live gRPC server.
#[async_trait]
pub trait PausedSandboxService: Send + Sync {
    async fn paused_info(
        &self,
        sandbox_id: &str,
        auth_header: Option<&str>,
        api_key_header: Option<&str>,
    ) -> Result<PausedInfo, PausedServiceError>;

    async fn resume(
        &self,
        sandbox_id: &str,
        timeout: Duration,
        auth_header: Option<&str>,
        api_key_header: Option<&str>,
    ) -> Result<(), PausedServiceError>;
}

/// gRPC client for the Paused Sandbox Service. A client is optional
/// everywhere it's consumed (§4.3: "a nil client is tolerated").
#[derive(Clone)]
pub struct PausedClient {
    inner: Grpc<Channel>,
}

impl PausedClient {
    pub async fn connect(addr: String) -> Result<Self, tonic::transport::Error> {
        let channel = Channel::from_shared(addr)
            .expect("paused service address must be a valid URI")
            .connect()
            .await?;
        Ok(PausedClient {
            inner: Grpc::new(channel),
        })
    }
}

#[async_trait]
impl PausedSandboxService for PausedClient {
    /// Queries `(paused?, auto_resume_policy)`. Best-effort: timeouts and
    /// transport errors are surfaced, not retried here (§4.5 owns retries).
    async fn paused_info(
        &self,
        sandbox_id: &str,
        auth_header: Option<&str>,
        api_key_header: Option<&str>,
    ) -> Result<PausedInfo, PausedServiceError> {
        let mut grpc = self.inner.clone();
        grpc.ready().await.map_err(ready_err)?;

        let request = build_request(
            PausedInfoRequest {
                sandbox_id: sandbox_id.to_string(),
            },
            auth_header,
            api_key_header,
        );

        let response = grpc
            .unary(request, path(PAUSED_INFO_PATH), ProstCodec::default())
            .await
            .map_err(map_status)?;
        let reply = response.into_inner();

        Ok(PausedInfo {
            paused: reply.paused,
            auto_resume_policy: parse_policy(&reply.auto_resume_policy),
        })
    }

    /// Triggers a resume. A "precondition failed" signal means the server
    /// refused outright (§4.3): callers must treat this as "cannot
    /// auto-resume", never retry it blindly.
    async fn resume(
        &self,
        sandbox_id: &str,
        timeout: Duration,
        auth_header: Option<&str>,
        api_key_header: Option<&str>,
    ) -> Result<(), PausedServiceError> {
        let mut grpc = self.inner.clone();
        grpc.ready().await.map_err(ready_err)?;

        let request = build_request(
            ResumeRequest {
                sandbox_id: sandbox_id.to_string(),
                timeout_seconds: timeout.as_secs() as u32,
            },
            auth_header,
            api_key_header,
        );

        grpc.unary(request, path(RESUME_PATH), ProstCodec::default())
            .await
            .map_err(map_status)?;
        Ok(())
    }
}

fn path(p: &str) -> tonic::codegen::http::uri::PathAndQuery {
    p.parse().expect("static gRPC method path is always valid")
}

fn build_request<T>(message: T, auth_header: Option<&str>, api_key_header: Option<&str>) -> Request<T> {
    let mut request = Request::new(message);
    if let Some(v) = auth_header {
        if let Ok(value) = v.parse() {
            request.metadata_mut().insert("authorization", value);
        }
    }
    if let Some(v) = api_key_header {
        if let Ok(value) = v.parse() {
            request.metadata_mut().insert("x-api-key", value);
        }
    }
    request
}

fn parse_policy(raw: &str) -> AutoResumePolicy {
    match raw {
        "any" => AutoResumePolicy::Any,
        "authed" => AutoResumePolicy::Authed,
        "null" | "" => AutoResumePolicy::Null,
        _ => AutoResumePolicy::Unknown,
    }
}

fn map_status(status: tonic::Status) -> PausedServiceError {
    if status.code() == Code::FailedPrecondition {
        PausedServiceError::PreconditionFailed(status.message().to_string())
    } else {
        PausedServiceError::Transport(status)
    }
}

fn ready_err<E: std::fmt::Display>(e: E) -> PausedServiceError {
    PausedServiceError::Transport(tonic::Status::unavailable(format!(
        "paused service channel not ready: {e}"
    )))
}
