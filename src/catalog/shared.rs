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
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use scc::HashMap;

use crate::errors::CatalogError;

use super::{catalog_key, SandboxCatalog, SandboxInfo};

/// L1 TTL kept intentionally tiny (§4.2): a resume landing on a different
/// orchestrator must become visible to every edge node within half a second.
/// Do not raise this.
const L1_TTL: Duration = Duration::from_millis(500);
const L2_READ_TIMEOUT: Duration = Duration::from_secs(1);

struct L1Entry {
    info: SandboxInfo,
    expires_at: Instant,
}

/// Shared-store backend (§4.2): a short-TTL local cache layered over a
/// remote key-value store so every edge node converges on the same view.
pub struct SharedCatalog {
    l1: HashMap<String, L1Entry, RandomState>,
    l2: ConnectionManager,
}

impl SharedCatalog {
    pub async fn connect(redis_url: &str) -> Result<Self, CatalogError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| CatalogError::Backend(e.into()))?;
        let l2 = client
            .get_connection_manager()
            .await
            .map_err(|e| CatalogError::Backend(e.into()))?;
        Ok(SharedCatalog {
            l1: HashMap::with_hasher(RandomState::new()),
            l2,
        })
    }

    async fn l2_get(&self, sandbox_id: &str) -> Result<Option<SandboxInfo>, CatalogError> {
        let mut conn = self.l2.clone();
        let key = catalog_key(sandbox_id);
        let raw: Option<String> = tokio::time::timeout(L2_READ_TIMEOUT, conn.get(&key))
            .await
            .map_err(|_| CatalogError::Backend(anyhow::anyhow!("shared store read timed out")))?
            .map_err(|e| CatalogError::Backend(e.into()))?;
        match raw {
            Some(raw) => {
                let info: SandboxInfo = serde_json::from_str(&raw)
                    .map_err(|e| CatalogError::Backend(e.into()))?;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    fn l1_put(&self, sandbox_id: &str, info: SandboxInfo) {
        self.l1.upsert(
            sandbox_id.to_string(),
            L1Entry {
                info,
                expires_at: Instant::now() + L1_TTL,
            },
        );
    }
}

#[async_trait]
impl SandboxCatalog for SharedCatalog {
    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo, CatalogError> {
        if let Some(info) = self
            .l1
            .read_async(sandbox_id, |_, v| {
                (v.expires_at > Instant::now()).then(|| v.info.clone())
            })
            .await
            .flatten()
        {
            return Ok(info);
        }

        match self.l2_get(sandbox_id).await? {
            Some(info) => {
                self.l1_put(sandbox_id, info.clone());
                Ok(info)
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
        let key = catalog_key(sandbox_id);
        let value = serde_json::to_string(info).map_err(|e| CatalogError::Backend(e.into()))?;
        let mut conn = self.l2.clone();
        let ttl_seconds = expiration.as_secs().max(1);
        let _: () = conn
            .set_ex(&key, value, ttl_seconds)
            .await
            .map_err(|e| CatalogError::Backend(e.into()))?;
        self.l1_put(sandbox_id, info.clone());
        Ok(())
    }

    async fn delete(&self, sandbox_id: &str, execution_id: &str) -> Result<(), CatalogError> {
        let current = match self.l2_get(sandbox_id).await? {
            Some(info) => info,
            None => return Ok(()),
        };
        if current.execution_id != execution_id {
            return Ok(());
        }
        let key = catalog_key(sandbox_id);
        let mut conn = self.l2.clone();
        let _: () = conn
            .del(&key)
            .await
            .map_err(|e| CatalogError::Backend(e.into()))?;
        self.l1.remove(sandbox_id);
        Ok(())
    }

    async fn close(&self) -> Result<(), CatalogError> {
        self.l1.clear();
        Ok(())
    }
}
