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

use async_trait::async_trait;

/// One orchestrator instance as handed back by a discovery adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub ip: String,
    pub port: u16,
}

/// The single polymorphism point for service discovery: DNS, EC2, K8s,
/// Nomad and static-list adapters all implement this and nothing else.
/// Concrete adapters are an edge-API concern and are out of scope here
/// (spec's discovery Non-goal) -- this crate only depends on the contract.
#[async_trait]
pub trait ListInstances: Send + Sync {
    async fn list_instances(&self) -> anyhow::Result<Vec<Instance>>;
}

/// Fixed list, for tests and for deployments that pin a single orchestrator
/// fleet by address instead of discovering it.
pub struct StaticInstances(pub Vec<Instance>);

#[async_trait]
impl ListInstances for StaticInstances {
    async fn list_instances(&self) -> anyhow::Result<Vec<Instance>> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_instances_returns_fixed_list() {
        let instances = StaticInstances(vec![Instance {
            ip: "10.0.0.5".to_string(),
            port: 5007,
        }]);
        let listed = instances.list_instances().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ip, "10.0.0.5");
    }
}
