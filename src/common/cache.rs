/*
 * This file is part of the Obvia ERP.
 *
 * Copyright (C) 2025 Kovács Dávid <kapcsolat@kovacsdavid.dev>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::common::error::RepositoryError;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    last_touched: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Process-local, bounded, TTL-aware map shared by the tenant registry's
/// local tier and the audit cache's L1 tier. Eviction is
/// least-recently-touched once `capacity` is exceeded; expiry is lazy,
/// checked on read and swept on insert.
///
/// Guarded by `std::sync::RwLock`, matching the synchronous map guard the
/// connection manager's tenant-pool table already uses.
pub struct TtlCache<K, V> {
    capacity: usize,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Result<Option<V>, RepositoryError> {
        {
            let read_guard = self
                .entries
                .read()
                .map_err(|e| RepositoryError::RwLockReadGuard(e.to_string()))?;
            match read_guard.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // expired: drop it under a write guard, then report a miss.
        let mut write_guard = self
            .entries
            .write()
            .map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?;
        write_guard.remove(key);
        Ok(None)
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) -> Result<(), RepositoryError> {
        let mut write_guard = self
            .entries
            .write()
            .map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?;

        write_guard.retain(|_, entry| !entry.is_expired());

        if write_guard.len() >= self.capacity && !write_guard.contains_key(&key) {
            if let Some(oldest_key) = write_guard
                .iter()
                .min_by_key(|(_, entry)| entry.last_touched)
                .map(|(k, _)| k.clone())
            {
                write_guard.remove(&oldest_key);
            }
        }

        let now = Instant::now();
        write_guard.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                ttl,
                last_touched: now,
            },
        );
        Ok(())
    }

    pub fn invalidate(&self, key: &K) -> Result<(), RepositoryError> {
        let mut write_guard = self
            .entries
            .write()
            .map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?;
        write_guard.remove(key);
        Ok(())
    }

    /// Invalidates every entry whose key satisfies `predicate` (pattern-based
    /// invalidation, e.g. "everything under this tenant").
    pub fn invalidate_matching<F>(&self, predicate: F) -> Result<usize, RepositoryError>
    where
        F: Fn(&K) -> bool,
    {
        let mut write_guard = self
            .entries
            .write()
            .map_err(|e| RepositoryError::RwLockWriteGuard(e.to_string()))?;
        let before = write_guard.len();
        write_guard.retain(|k, _| !predicate(k));
        Ok(before - write_guard.len())
    }

    pub fn len(&self) -> Result<usize, RepositoryError> {
        Ok(self
            .entries
            .read()
            .map_err(|e| RepositoryError::RwLockReadGuard(e.to_string()))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool, RepositoryError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn inserts_and_reads_back() {
        let cache: TtlCache<String, i32> = TtlCache::new(10);
        cache
            .insert("a".to_string(), 1, Duration::from_secs(60))
            .unwrap();
        assert_eq!(cache.get(&"a".to_string()).unwrap(), Some(1));
    }

    #[test]
    fn expired_entry_reads_as_miss() {
        let cache: TtlCache<String, i32> = TtlCache::new(10);
        cache
            .insert("a".to_string(), 1, Duration::from_millis(0))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"a".to_string()).unwrap(), None);
    }

    #[test]
    fn evicts_least_recently_touched_when_capacity_exceeded() {
        let cache: TtlCache<String, i32> = TtlCache::new(2);
        cache
            .insert("a".to_string(), 1, Duration::from_secs(60))
            .unwrap();
        cache
            .insert("b".to_string(), 2, Duration::from_secs(60))
            .unwrap();
        cache
            .insert("c".to_string(), 3, Duration::from_secs(60))
            .unwrap();
        assert_eq!(cache.len().unwrap(), 2);
        assert_eq!(cache.get(&"a".to_string()).unwrap(), None);
        assert_eq!(cache.get(&"c".to_string()).unwrap(), Some(3));
    }

    #[test]
    fn invalidate_matching_removes_by_predicate() {
        let cache: TtlCache<String, i32> = TtlCache::new(10);
        cache
            .insert("tenant-a:x".to_string(), 1, Duration::from_secs(60))
            .unwrap();
        cache
            .insert("tenant-a:y".to_string(), 2, Duration::from_secs(60))
            .unwrap();
        cache
            .insert("tenant-b:z".to_string(), 3, Duration::from_secs(60))
            .unwrap();
        let removed = cache
            .invalidate_matching(|k| k.starts_with("tenant-a:"))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.len().unwrap(), 1);
    }
}
