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

use crate::errors::CatalogError;

use super::{SandboxCatalog, SandboxInfo};

/// Wraps a primary and secondary catalog (§4.2, optional third backend).
/// `get` only falls through to the secondary on `SandboxNotFound`; any other
/// primary error propagates. Used while migrating between backends.
pub struct FallbackCatalog<P, S> {
    primary: P,
    secondary: S,
}

impl<P, S> FallbackCatalog<P, S>
where
    P: SandboxCatalog,
    S: SandboxCatalog,
{
    pub fn new(primary: P, secondary: S) -> Self {
        FallbackCatalog { primary, secondary }
    }
}

#[async_trait]
impl<P, S> SandboxCatalog for FallbackCatalog<P, S>
where
    P: SandboxCatalog,
    S: SandboxCatalog,
{
    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo, CatalogError> {
        match self.primary.get(sandbox_id).await {
            Err(CatalogError::SandboxNotFound) => self.secondary.get(sandbox_id).await,
            other => other,
        }
    }

    async fn store(
        &self,
        sandbox_id: &str,
        info: &SandboxInfo,
        expiration: Duration,
    ) -> Result<(), CatalogError> {
        self.primary.store(sandbox_id, info, expiration).await
    }

    async fn delete(&self, sandbox_id: &str, execution_id: &str) -> Result<(), CatalogError> {
        self.primary.delete(sandbox_id, execution_id).await
    }

    async fn close(&self) -> Result<(), CatalogError> {
        self.primary.close().await?;
        self.secondary.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::memory::MemoryCatalog;

    fn info(execution_id: &str, ip: &str) -> SandboxInfo {
        SandboxInfo {
            orchestrator_id: "orc-1".to_string(),
            orchestrator_ip: ip.to_string(),
            execution_id: execution_id.to_string(),
            sandbox_started_at: 0,
            sandbox_max_length_in_hours: 1,
        }
    }

    #[tokio::test]
    async fn falls_through_to_secondary_on_not_found() {
        let primary = MemoryCatalog::new();
        let secondary = MemoryCatalog::new();
        secondary
            .store("sbx1", &info("exec-a", "10.0.0.5"), Duration::from_secs(60))
            .await
            .unwrap();

        let fallback = FallbackCatalog::new(primary, secondary);
        let got = fallback.get("sbx1").await.unwrap();
        assert_eq!(got.orchestrator_ip, "10.0.0.5");
    }

    #[tokio::test]
    async fn prefers_primary_when_present() {
        let primary = MemoryCatalog::new();
        primary
            .store("sbx1", &info("exec-a", "10.0.0.1"), Duration::from_secs(60))
            .await
            .unwrap();
        let secondary = MemoryCatalog::new();
        secondary
            .store("sbx1", &info("exec-b", "10.0.0.2"), Duration::from_secs(60))
            .await
            .unwrap();

        let fallback = FallbackCatalog::new(primary, secondary);
        let got = fallback.get("sbx1").await.unwrap();
        assert_eq!(got.orchestrator_ip, "10.0.0.1");
    }
}
