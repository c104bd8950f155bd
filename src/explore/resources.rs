// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Port and resource-limit allocation for exploration worktrees.
//!
//! Allocations are held in memory only. A port is never handed to two live
//! allocations at once, across every exploration served by this allocator.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::ExploreError;

/// Request for one worktree's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub exploration_id: String,
    /// 1-based worktree index.
    pub worktree_index: u32,
    pub cpu_limit: String,
    pub memory_limit: String,
    /// Inclusive port range overriding the allocator's own.
    pub port_range: Option<(u16, u16)>,
}

impl AllocationRequest {
    pub fn new(exploration_id: impl Into<String>, worktree_index: u32) -> Self {
        Self {
            exploration_id: exploration_id.into(),
            worktree_index,
            cpu_limit: "2".to_string(),
            memory_limit: "4g".to_string(),
            port_range: None,
        }
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = Some((start.min(end), start.max(end)));
        self
    }

    pub fn with_limits(mut self, cpu_limit: impl Into<String>, memory_limit: impl Into<String>) -> Self {
        self.cpu_limit = cpu_limit.into();
        self.memory_limit = memory_limit.into();
        self
    }
}

/// Resources held by one worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAllocation {
    pub exploration_id: String,
    pub worktree_index: u32,
    pub port: u16,
    pub cpu_limit: String,
    pub memory_limit: String,
}

type AllocationKey = (String, u32);

/// Hands out non-conflicting ports from an inclusive range.
#[derive(Debug)]
pub struct ResourceAllocator {
    port_range_start: u16,
    port_range_end: u16,
    allocations: Mutex<BTreeMap<AllocationKey, ResourceAllocation>>,
}

impl ResourceAllocator {
    /// Create an allocator over `start..=end`. The bounds are swapped if given
    /// in reverse.
    pub fn new(port_range_start: u16, port_range_end: u16) -> Self {
        let (start, end) = if port_range_start <= port_range_end {
            (port_range_start, port_range_end)
        } else {
            (port_range_end, port_range_start)
        };
        Self {
            port_range_start: start,
            port_range_end: end,
            allocations: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.port_range_start, self.port_range_end)
    }

    /// Allocate resources for one worktree.
    ///
    /// The preferred port is `start + (index - 1) % range_len`; when taken the
    /// search probes forward and wraps. Allocating a key that is already held
    /// returns the existing allocation unchanged.
    pub fn allocate(&self, request: AllocationRequest) -> Result<ResourceAllocation, ExploreError> {
        let mut allocations = self.allocations.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (request.exploration_id.clone(), request.worktree_index);
        if let Some(existing) = allocations.get(&key) {
            return Ok(existing.clone());
        }

        let (start, end) = request
            .port_range
            .unwrap_or((self.port_range_start, self.port_range_end));
        let used: HashSet<u16> = allocations.values().map(|a| a.port).collect();
        let range_len = u32::from(end - start) + 1;
        let offset = request.worktree_index.saturating_sub(1) % range_len;

        let port = (0..range_len)
            .map(|step| (offset + step) % range_len)
            .map(|slot| start + slot as u16)
            .find(|port| !used.contains(port))
            .ok_or_else(|| {
                ExploreError::ResourceExhaustion(format!(
                    "no free port in {}-{} for {} worktree {}",
                    start, end, request.exploration_id, request.worktree_index
                ))
            })?;

        let allocation = ResourceAllocation {
            exploration_id: request.exploration_id,
            worktree_index: request.worktree_index,
            port,
            cpu_limit: request.cpu_limit,
            memory_limit: request.memory_limit,
        };
        debug!(
            exploration = %allocation.exploration_id,
            index = allocation.worktree_index,
            port,
            "Allocated resources"
        );
        allocations.insert(key, allocation.clone());
        Ok(allocation)
    }

    /// Hold an allocation made elsewhere, such as by another process.
    ///
    /// Returns false when the key is already held or the port is taken.
    pub fn reserve(&self, allocation: ResourceAllocation) -> bool {
        let mut allocations = self.allocations.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (allocation.exploration_id.clone(), allocation.worktree_index);
        if allocations.contains_key(&key) || allocations.values().any(|a| a.port == allocation.port) {
            return false;
        }
        debug!(
            exploration = %allocation.exploration_id,
            index = allocation.worktree_index,
            port = allocation.port,
            "Reserved port"
        );
        allocations.insert(key, allocation);
        true
    }

    /// Release one allocation, returning it if it was held.
    pub fn release(&self, exploration_id: &str, worktree_index: u32) -> Option<ResourceAllocation> {
        let mut allocations = self.allocations.lock().unwrap_or_else(PoisonError::into_inner);
        allocations.remove(&(exploration_id.to_string(), worktree_index))
    }

    /// Release every allocation of one exploration.
    pub fn release_all(&self, exploration_id: &str) -> Vec<ResourceAllocation> {
        let mut allocations = self.allocations.lock().unwrap_or_else(PoisonError::into_inner);
        let keys: Vec<AllocationKey> = allocations
            .keys()
            .filter(|(id, _)| id == exploration_id)
            .cloned()
            .collect();
        keys.iter().filter_map(|key| allocations.remove(key)).collect()
    }

    /// Current allocations of one exploration, ordered by worktree index.
    pub fn allocations(&self, exploration_id: &str) -> Vec<ResourceAllocation> {
        let allocations = self.allocations.lock().unwrap_or_else(PoisonError::into_inner);
        allocations
            .values()
            .filter(|a| a.exploration_id == exploration_id)
            .cloned()
            .collect()
    }
}

impl Default for ResourceAllocator {
    fn default() -> Self {
        Self::new(3000, 3099)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_indexes_get_distinct_ports() {
        let allocator = ResourceAllocator::new(4000, 4009);
        let ports: HashSet<u16> = (1..=10)
            .map(|i| allocator.allocate(AllocationRequest::new("exp-a", i)).unwrap().port)
            .collect();
        assert_eq!(ports.len(), 10);
    }

    #[test]
    fn test_preferred_port_follows_index() {
        let allocator = ResourceAllocator::new(4000, 4009);
        assert_eq!(allocator.allocate(AllocationRequest::new("exp-a", 3)).unwrap().port, 4002);
        assert_eq!(allocator.allocate(AllocationRequest::new("exp-a", 1)).unwrap().port, 4000);
    }

    #[test]
    fn test_reserved_port_is_skipped() {
        let allocator = ResourceAllocator::new(4000, 4009);
        let held = ResourceAllocation {
            exploration_id: "exp-other".to_string(),
            worktree_index: 1,
            port: 4000,
            cpu_limit: "2".to_string(),
            memory_limit: "4g".to_string(),
        };
        assert!(allocator.reserve(held.clone()));
        assert!(!allocator.reserve(held.clone()));
        assert!(!allocator.reserve(ResourceAllocation { worktree_index: 2, ..held }));

        let fresh = allocator.allocate(AllocationRequest::new("exp-new", 1)).unwrap();
        assert_eq!(fresh.port, 4001);
    }

    #[test]
    fn test_ports_unique_across_explorations() {
        let allocator = ResourceAllocator::new(4000, 4009);
        let a = allocator.allocate(AllocationRequest::new("exp-a", 1)).unwrap();
        let b = allocator.allocate(AllocationRequest::new("exp-b", 1)).unwrap();
        assert_ne!(a.port, b.port);
        assert_eq!(b.port, 4001);
    }

    #[test]
    fn test_probe_wraps_around() {
        let allocator = ResourceAllocator::new(4000, 4002);
        allocator.allocate(AllocationRequest::new("other", 3)).unwrap();
        let wrapped = allocator.allocate(AllocationRequest::new("exp-a", 3)).unwrap();
        assert_eq!(wrapped.port, 4000);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = ResourceAllocator::new(4000, 4001);
        allocator.allocate(AllocationRequest::new("exp-a", 1)).unwrap();
        allocator.allocate(AllocationRequest::new("exp-a", 2)).unwrap();
        let err = allocator.allocate(AllocationRequest::new("exp-a", 3)).unwrap_err();
        assert!(matches!(err, ExploreError::ResourceExhaustion(_)));
    }

    #[test]
    fn test_reallocating_same_key_is_stable() {
        let allocator = ResourceAllocator::default();
        let first = allocator
            .allocate(AllocationRequest::new("exp-a", 2).with_limits("1", "2g"))
            .unwrap();
        let second = allocator.allocate(AllocationRequest::new("exp-a", 2)).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.memory_limit, "2g");
    }

    #[test]
    fn test_release_then_reuse() {
        let allocator = ResourceAllocator::new(4000, 4000);
        let first = allocator.allocate(AllocationRequest::new("exp-a", 1)).unwrap();
        assert!(allocator.allocate(AllocationRequest::new("exp-b", 1)).is_err());

        assert_eq!(allocator.release("exp-a", 1), Some(first.clone()));
        assert_eq!(allocator.release("exp-a", 1), None);

        let reused = allocator.allocate(AllocationRequest::new("exp-b", 1)).unwrap();
        assert_eq!(reused.port, first.port);
    }

    #[test]
    fn test_release_all_only_touches_one_exploration() {
        let allocator = ResourceAllocator::default();
        for i in 1..=3 {
            allocator.allocate(AllocationRequest::new("exp-a", i)).unwrap();
        }
        allocator.allocate(AllocationRequest::new("exp-b", 1)).unwrap();

        let released = allocator.release_all("exp-a");
        assert_eq!(released.len(), 3);
        assert!(allocator.allocations("exp-a").is_empty());
        assert_eq!(allocator.allocations("exp-b").len(), 1);
    }

    #[test]
    fn test_request_range_override() {
        let allocator = ResourceAllocator::new(4000, 4009);
        let a = allocator
            .allocate(AllocationRequest::new("exp-a", 2).with_port_range(5001, 5000))
            .unwrap();
        assert_eq!(a.port, 5001);
        let b = allocator
            .allocate(AllocationRequest::new("exp-b", 2).with_port_range(5000, 5001))
            .unwrap();
        assert_eq!(b.port, 5000);
    }

    #[test]
    fn test_reversed_range_is_normalized() {
        let allocator = ResourceAllocator::new(5010, 5000);
        assert_eq!(allocator.port_range(), (5000, 5010));
    }
}
