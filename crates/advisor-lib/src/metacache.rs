//! Meta-cache: the concurrent node-local index of containers and pools
//!
//! Single writer (the advisor loop), many readers. Region membership is
//! recorded on both sides: containers carry region names, pools carry the
//! regions serving them.

use crate::models::{pools, ContainerInfo, PoolInfo};
use anyhow::{bail, Result};
use dashmap::DashMap;
use tracing::debug;

/// Key: (pod uid, container name)
type ContainerKey = (String, String);

pub struct MetaCache {
    containers: DashMap<ContainerKey, ContainerInfo>,
    pool_entries: DashMap<String, PoolInfo>,
}

impl MetaCache {
    /// The `reserve` pool always exists after init
    pub fn new() -> Self {
        let cache = Self {
            containers: DashMap::new(),
            pool_entries: DashMap::new(),
        };
        cache
            .pool_entries
            .insert(pools::RESERVE.to_string(), PoolInfo::new(pools::RESERVE));
        cache
    }

    pub fn set_container(&self, info: ContainerInfo) {
        let key = (info.pod_uid.clone(), info.container_name.clone());
        self.containers.insert(key, info);
    }

    pub fn get_container(&self, pod_uid: &str, container_name: &str) -> Option<ContainerInfo> {
        self.containers
            .get(&(pod_uid.to_string(), container_name.to_string()))
            .map(|r| r.clone())
    }

    pub fn remove_container(&self, pod_uid: &str, container_name: &str) {
        self.containers
            .remove(&(pod_uid.to_string(), container_name.to_string()));
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    /// Iterate containers read-only; the callback returns false to stop early
    pub fn range_container(&self, mut f: impl FnMut(&ContainerInfo) -> bool) {
        for entry in self.containers.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// Iterate containers with per-element mutation; the callback returns
    /// false to stop early
    pub fn range_and_update_container(&self, mut f: impl FnMut(&mut ContainerInfo) -> bool) {
        for mut entry in self.containers.iter_mut() {
            if !f(entry.value_mut()) {
                break;
            }
        }
    }

    pub fn set_pool_info(&self, info: PoolInfo) {
        self.pool_entries.insert(info.pool_name.clone(), info);
    }

    pub fn get_pool_info(&self, pool_name: &str) -> Option<PoolInfo> {
        self.pool_entries.get(pool_name).map(|r| r.clone())
    }

    pub fn get_pool_size(&self, pool_name: &str) -> Option<u32> {
        self.pool_entries.get(pool_name).map(|r| r.pool_size())
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pool_entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn remove_pool(&self, pool_name: &str) {
        if pool_name == pools::RESERVE {
            debug!("refusing to remove the reserve pool");
            return;
        }
        self.pool_entries.remove(pool_name);
    }

    /// Record which regions serve a pool; the pool must exist
    pub fn set_pool_regions(&self, pool_name: &str, region_names: Vec<String>) -> Result<()> {
        match self.pool_entries.get_mut(pool_name) {
            Some(mut entry) => {
                entry.region_names = region_names;
                Ok(())
            }
            None => bail!("pool {} does not exist", pool_name),
        }
    }

    pub fn get_pool_regions(&self, pool_name: &str) -> Vec<String> {
        self.pool_entries
            .get(pool_name)
            .map(|r| r.region_names.clone())
            .unwrap_or_default()
    }

    /// Record region membership on a container
    pub fn set_container_regions(
        &self,
        pod_uid: &str,
        container_name: &str,
        region_names: Vec<String>,
    ) {
        if let Some(mut entry) = self
            .containers
            .get_mut(&(pod_uid.to_string(), container_name.to_string()))
        {
            entry.region_names = region_names;
        }
    }
}

impl Default for MetaCache {
    fn default() -> Self {
        Self::new()
    }
}
