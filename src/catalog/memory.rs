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

use std::time::{Duration, Instant};

use ahash::RandomState;
use async_trait::async_trait;
use scc::HashMap;

use crate::errors::CatalogError;

use super::{SandboxCatalog, SandboxInfo};

struct Entry {
    info: SandboxInfo,
    expires_at: Instant,
}

/// In-memory backend (§4.2): a TTL map with no inter-process consistency.
/// Used standalone for tests and single-node deployments.
pub struct MemoryCatalog {
    entries: HashMap<String, Entry, RandomState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        MemoryCatalog {
            entries: HashMap::with_hasher(RandomState::new()),
        }
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxCatalog for MemoryCatalog {
    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo, CatalogError> {
        match self.entries.read_async(sandbox_id, |_, v| v.info.clone()).await {
            Some(info) => {
                let expired = self
                    .entries
                    .read_async(sandbox_id, |_, v| v.expires_at <= Instant::now())
                    .await
                    .unwrap_or(true);
                if expired {
                    self.entries.remove_async(sandbox_id).await;
                    Err(CatalogError::SandboxNotFound)
                } else {
                    Ok(info)
                }
            }
            None => Err(CatalogError::SandboxNotFound),
        }
    }

    async fn store(
        &self,
        sandbox_id: &str,
        info: &SandboxInfo,
        expiration: Duration,
    ) -> Result<(), CatalogError> {
        let entry = Entry {
            info: info.clone(),
            expires_at: Instant::now() + expiration,
        };
        self.entries.upsert_async(sandbox_id.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, sandbox_id: &str, execution_id: &str) -> Result<(), CatalogError> {
        self.entries
            .remove_if_async(sandbox_id, |entry| entry.info.execution_id == execution_id)
            .await;
        Ok(())
    }

    async fn close(&self) -> Result<(), CatalogError> {
        self.entries.clear_async().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    async fn get_on_empty_catalog_is_not_found() {
        let catalog = MemoryCatalog::new();
        assert!(matches!(
            catalog.get("sbx1").await,
            Err(CatalogError::SandboxNotFound)
        ));
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let catalog = MemoryCatalog::new();
        let stored = info("exec-a", "10.0.0.1");
        catalog
            .store("sbx1", &stored, Duration::from_secs(60))
            .await
            .unwrap();
        let got = catalog.get("sbx1").await.unwrap();
        assert_eq!(got, stored);
    }

    #[tokio::test]
    async fn delete_with_mismatched_execution_id_is_a_no_op() {
        let catalog = MemoryCatalog::new();
        let stored = info("exec-a", "10.0.0.1");
        catalog
            .store("sbx1", &stored, Duration::from_secs(60))
            .await
            .unwrap();

        catalog.delete("sbx1", "exec-b").await.unwrap();

        let got = catalog.get("sbx1").await.unwrap();
        assert_eq!(got.execution_id, "exec-a");
    }

    #[tokio::test]
    async fn delete_with_matching_execution_id_removes_the_entry() {
        let catalog = MemoryCatalog::new();
        let stored = info("exec-a", "10.0.0.1");
        catalog
            .store("sbx1", &stored, Duration::from_secs(60))
            .await
            .unwrap();

        catalog.delete("sbx1", "exec-a").await.unwrap();

        assert!(matches!(
            catalog.get("sbx1").await,
            Err(CatalogError::SandboxNotFound)
        ));
    }

    #[tokio::test]
    async fn delete_of_absent_id_is_a_no_op() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.delete("never-stored", "exec-a").await.is_ok());
    }

    #[tokio::test]
    async fn entry_expires_after_its_ttl() {
        let catalog = MemoryCatalog::new();
        let stored = info("exec-a", "10.0.0.1");
        catalog
            .store("sbx1", &stored, Duration::from_millis(20))
            .await
            .unwrap();

        assert!(catalog.get("sbx1").await.is_ok());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(
            catalog.get("sbx1").await,
            Err(CatalogError::SandboxNotFound)
        ));
    }
}
