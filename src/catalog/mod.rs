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

pub mod fallback;
pub mod memory;
pub mod shared;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CatalogError;

/// `sandbox_id -> orchestrator location`, the catalog's value type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxInfo {
    pub orchestrator_id: String,
    pub orchestrator_ip: String,
    pub execution_id: String,
    pub sandbox_started_at: i64,
    pub sandbox_max_length_in_hours: u32,
}

/// `auto_resume_policy` as stored alongside a paused sandbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AutoResumePolicy {
    Any,
    Authed,
    Null,
    /// Any value the Paused Sandbox Service sends that we don't recognize.
    /// Treated the same as `Null` by the resume policy engine (§4.4).
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PausedSandboxInfo {
    pub auto_resume_policy: AutoResumePolicy,
    pub paused_at: i64,
}

/// Shared contract for both catalog backends (§4.2). Every operation must be
/// safe under concurrent invocation for the same `sandbox_id`.
#[async_trait]
pub trait SandboxCatalog: Send + Sync {
    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo, CatalogError>;

    async fn store(
        &self,
        sandbox_id: &str,
        info: &SandboxInfo,
        expiration: Duration,
    ) -> Result<(), CatalogError>;

    /// No-op (not an error) if `sandbox_id` is absent or its stored
    /// `execution_id` differs from `execution_id` (stale-delete protection).
    async fn delete(&self, sandbox_id: &str, execution_id: &str) -> Result<(), CatalogError>;

    async fn close(&self) -> Result<(), CatalogError>;
}

pub(crate) fn catalog_key(sandbox_id: &str) -> String {
    format!("sandbox:catalog:{sandbox_id}")
}
