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

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Healthy,
    Draining,
    Unhealthy,
}

/// Process-wide Service Info (§3, §4.8). Transitions are monotonic
/// (`Healthy -> Draining -> Unhealthy`); a backwards transition is rejected
/// and logged rather than silently applied.
pub struct ServiceInfo {
    status: RwLock<Status>,
    terminating: AtomicBool,
}

impl ServiceInfo {
    pub fn new() -> Self {
        ServiceInfo {
            status: RwLock::new(Status::Healthy),
            terminating: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> Status {
        *self.status.read()
    }

    pub fn terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }

    pub fn set_draining(&self) {
        self.transition(Status::Draining);
    }

    pub fn set_unhealthy(&self) {
        self.transition(Status::Unhealthy);
    }

    pub fn set_terminating(&self) {
        self.terminating.store(true, Ordering::Relaxed);
    }

    fn transition(&self, to: Status) {
        let mut status = self.status.write();
        if rank(*status) > rank(to) {
            warn!(from = ?*status, to = ?to, "rejected backwards lifecycle transition");
            return;
        }
        *status = to;
    }
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self::new()
    }
}

fn rank(status: Status) -> u8 {
    match status {
        Status::Healthy => 0,
        Status::Draining => 1,
        Status::Unhealthy => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy_and_not_terminating() {
        let info = ServiceInfo::new();
        assert_eq!(info.status(), Status::Healthy);
        assert!(!info.terminating());
    }

    #[test]
    fn transitions_forward_through_the_full_sequence() {
        let info = ServiceInfo::new();
        info.set_draining();
        assert_eq!(info.status(), Status::Draining);
        info.set_unhealthy();
        assert_eq!(info.status(), Status::Unhealthy);
    }

    #[test]
    fn backwards_transition_is_rejected() {
        let info = ServiceInfo::new();
        info.set_unhealthy();
        info.set_draining();
        assert_eq!(info.status(), Status::Unhealthy);
    }

    #[test]
    fn repeated_transitions_are_idempotent() {
        let info = ServiceInfo::new();
        info.set_draining();
        info.set_draining();
        assert_eq!(info.status(), Status::Draining);
    }

    #[test]
    fn terminating_is_one_way() {
        let info = ServiceInfo::new();
        info.set_terminating();
        assert!(info.terminating());
    }
}
