//! Read-through cache in front of the resolver.
//!
//! Entries are keyed per subject (role or principal), never per
//! principal x instance, so a grant change on a role touches one key space
//! rather than one entry per member. Every entry is stamped with the
//! generation counters it was computed under; invalidation bumps the counter
//! before purging, so a value fetched concurrently with an invalidation can
//! never be served afterwards. An entry derived from an expiring grant is
//! dropped the moment that grant expires. The TTL only bounds how long an
//! entry lives if an invalidation is missed.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::resolver::Expiring;
use crate::error::Result;
use crate::store::{Invalidation, InvalidationSink};
use crate::types::{EntityRef, InstanceRef, Permission, Subject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    owner: u64,
    graph: u64,
}

/// Misses between two sweeps of stale entries.
const SWEEP_EVERY: u64 = 256;

#[derive(Debug)]
struct Cached<T> {
    value: T,
    stamp: Stamp,
    stored_at: Instant,
    expires_at: Option<DateTime<Utc>>,
}

impl<T> Cached<T> {
    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.stored_at.elapsed() < ttl && self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct PermissionCache {
    ttl: Duration,
    subject_generations: DashMap<Subject, u64>,
    membership_generations: DashMap<String, u64>,
    graph_generation: AtomicU64,
    roles: DashMap<String, Cached<Vec<String>>>,
    deny: DashMap<(Subject, String), Cached<Arc<HashSet<InstanceRef>>>>,
    type_level: DashMap<(Subject, String), Cached<Option<Permission>>>,
    instance_level: DashMap<(Subject, EntityRef), Cached<Option<Permission>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PermissionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            subject_generations: DashMap::new(),
            membership_generations: DashMap::new(),
            graph_generation: AtomicU64::new(0),
            roles: DashMap::new(),
            deny: DashMap::new(),
            type_level: DashMap::new(),
            instance_level: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn subject_generation(&self, subject: &Subject) -> u64 {
        self.subject_generations.get(subject).map_or(0, |g| *g)
    }

    fn membership_generation(&self, principal_id: &str) -> u64 {
        self.membership_generations
            .get(principal_id)
            .map_or(0, |g| *g)
    }

    fn graph_generation(&self) -> u64 {
        self.graph_generation.load(Ordering::Acquire)
    }

    fn read_through<K, V>(
        &self,
        map: &DashMap<K, Cached<V>>,
        key: K,
        current: impl Fn() -> Stamp,
        fetch: impl FnOnce() -> Result<Expiring<V>>,
    ) -> Result<V>
    where
        K: Eq + Hash,
        V: Clone,
    {
        let stamp = current();
        if let Some(entry) = map.get(&key)
            && entry.stamp == stamp
            && entry.is_fresh(self.ttl, Utc::now())
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.value.clone());
        }

        let misses = self.misses.fetch_add(1, Ordering::Relaxed) + 1;
        if misses % SWEEP_EVERY == 0 {
            self.sweep();
        }

        let fetched = fetch()?;
        if current() == stamp {
            map.insert(
                key,
                Cached {
                    value: fetched.value.clone(),
                    stamp,
                    stored_at: Instant::now(),
                    expires_at: fetched.expires_at,
                },
            );
        }
        Ok(fetched.value)
    }

    /// Active role ids of a principal.
    pub fn roles(
        &self,
        principal_id: &str,
        fetch: impl FnOnce() -> Result<Vec<String>>,
    ) -> Result<Vec<String>> {
        self.read_through(
            &self.roles,
            principal_id.to_string(),
            || Stamp {
                owner: self.membership_generation(principal_id),
                graph: 0,
            },
            || fetch().map(Expiring::never),
        )
    }

    /// Deny targets a subject holds on an entity type.
    pub fn deny(
        &self,
        subject: &Subject,
        entity_type: &str,
        fetch: impl FnOnce() -> Result<Expiring<HashSet<InstanceRef>>>,
    ) -> Result<Arc<HashSet<InstanceRef>>> {
        self.read_through(
            &self.deny,
            (subject.clone(), entity_type.to_string()),
            || Stamp {
                owner: self.subject_generation(subject),
                graph: 0,
            },
            || {
                fetch().map(|denied| Expiring {
                    value: Arc::new(denied.value),
                    expires_at: denied.expires_at,
                })
            },
        )
    }

    /// Type-level allow a subject holds on an entity type.
    pub fn type_level(
        &self,
        subject: &Subject,
        entity_type: &str,
        fetch: impl FnOnce() -> Result<Expiring<Option<Permission>>>,
    ) -> Result<Option<Permission>> {
        self.read_through(
            &self.type_level,
            (subject.clone(), entity_type.to_string()),
            || Stamp {
                owner: self.subject_generation(subject),
                graph: 0,
            },
            fetch,
        )
    }

    /// Resolved contribution of a subject for one instance, ancestors included.
    pub fn instance_level(
        &self,
        subject: &Subject,
        entity: &EntityRef,
        fetch: impl FnOnce() -> Result<Expiring<Option<Permission>>>,
    ) -> Result<Option<Permission>> {
        self.read_through(
            &self.instance_level,
            (subject.clone(), entity.clone()),
            || Stamp {
                owner: self.subject_generation(subject),
                graph: self.graph_generation(),
            },
            fetch,
        )
    }

    pub fn invalidate_subject(&self, subject: &Subject) {
        *self.subject_generations.entry(subject.clone()).or_insert(0) += 1;
        self.deny.retain(|(s, _), _| s != subject);
        self.type_level.retain(|(s, _), _| s != subject);
        self.instance_level.retain(|(s, _), _| s != subject);
        self.sweep();
    }

    pub fn invalidate_membership(&self, principal_id: &str) {
        *self
            .membership_generations
            .entry(principal_id.to_string())
            .or_insert(0) += 1;
        self.roles.remove(principal_id);
    }

    pub fn invalidate_graph(&self) {
        self.graph_generation.fetch_add(1, Ordering::AcqRel);
        self.instance_level.clear();
    }

    /// Drops entries past their TTL or past the expiry of a grant they were
    /// derived from. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let (ttl, now) = (self.ttl, Utc::now());
        let before = self.len();
        self.roles.retain(|_, entry| entry.is_fresh(ttl, now));
        self.deny.retain(|_, entry| entry.is_fresh(ttl, now));
        self.type_level.retain(|_, entry| entry.is_fresh(ttl, now));
        self.instance_level.retain(|_, entry| entry.is_fresh(ttl, now));
        let removed = before.saturating_sub(self.len());
        if removed > 0 {
            tracing::debug!("Swept {removed} stale cache entries");
        }
        removed
    }

    fn len(&self) -> usize {
        self.roles.len() + self.deny.len() + self.type_level.len() + self.instance_level.len()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.graph_generation.fetch_add(1, Ordering::AcqRel);
        for mut generation in self.subject_generations.iter_mut() {
            *generation += 1;
        }
        for mut generation in self.membership_generations.iter_mut() {
            *generation += 1;
        }
        self.roles.clear();
        self.deny.clear();
        self.type_level.clear();
        self.instance_level.clear();
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl InvalidationSink for PermissionCache {
    fn invalidate(&self, event: &Invalidation) {
        match event {
            Invalidation::Subject(subject) => self.invalidate_subject(subject),
            Invalidation::Membership(principal_id) => self.invalidate_membership(principal_id),
            Invalidation::Graph => self.invalidate_graph(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counting<'a, T: 'a>(calls: &'a Cell<u32>, value: T) -> impl FnOnce() -> Result<Expiring<T>> + 'a {
        move || {
            calls.set(calls.get() + 1);
            Ok(Expiring::never(value))
        }
    }

    #[test]
    fn test_read_through_hits_after_first_fetch() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        let calls = Cell::new(0);
        let subject = Subject::principal("u-1");

        let a = cache
            .type_level(&subject, "task", counting(&calls, Some(Permission::EDIT)))
            .unwrap();
        let b = cache.type_level(&subject, "task", counting(&calls, None)).unwrap();

        assert_eq!(a, b);
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_subject_invalidation_is_scoped() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        let calls = Cell::new(0);
        let r1 = Subject::role("r-1");
        let r2 = Subject::role("r-2");

        cache.type_level(&r1, "project", counting(&calls, Some(Permission::EDIT))).unwrap();
        cache.type_level(&r2, "project", counting(&calls, Some(Permission::VIEW))).unwrap();
        cache.invalidate(&Invalidation::Subject(r1.clone()));

        let level = cache.type_level(&r1, "project", counting(&calls, None)).unwrap();
        assert_eq!(level, None);
        let level = cache.type_level(&r2, "project", counting(&calls, None)).unwrap();
        assert_eq!(level, Some(Permission::VIEW));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_graph_invalidation_only_drops_instance_levels() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        let calls = Cell::new(0);
        let subject = Subject::role("r-1");
        let task = EntityRef::new("task", "t-1");

        cache.instance_level(&subject, &task, counting(&calls, Some(Permission::OWNER))).unwrap();
        cache.type_level(&subject, "task", counting(&calls, None)).unwrap();
        cache.invalidate(&Invalidation::Graph);

        cache.instance_level(&subject, &task, counting(&calls, None)).unwrap();
        cache.type_level(&subject, "task", counting(&calls, None)).unwrap();
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_fetch_racing_invalidation_is_not_served() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        let subject = Subject::principal("u-1");

        // The invalidation lands while the stale value is being fetched.
        let stale = cache
            .deny(&subject, "project", || {
                cache.invalidate_subject(&subject);
                Ok(Expiring::never(HashSet::new()))
            })
            .unwrap();
        assert!(stale.is_empty());

        let fresh = cache
            .deny(&subject, "project", || {
                Ok(Expiring::never(HashSet::from([InstanceRef::All])))
            })
            .unwrap();
        assert!(fresh.contains(&InstanceRef::All));
    }

    #[test]
    fn test_ttl_expiry_refetches() {
        let cache = PermissionCache::new(Duration::ZERO);
        let calls = Cell::new(0);

        for _ in 0..2 {
            cache
                .roles("u-1", || {
                    calls.set(calls.get() + 1);
                    Ok(vec![])
                })
                .unwrap();
        }
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_entry_dropped_when_source_grant_expires() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        let calls = Cell::new(0);
        let subject = Subject::role("r-1");
        let task = EntityRef::new("task", "t-1");
        let expiring = || Expiring {
            value: Some(Permission::OWNER),
            expires_at: Some(Utc::now() + chrono::Duration::milliseconds(50)),
        };

        let first = cache
            .instance_level(&subject, &task, || {
                calls.set(calls.get() + 1);
                Ok(expiring())
            })
            .unwrap();
        assert_eq!(first, Some(Permission::OWNER));
        cache.instance_level(&subject, &task, counting(&calls, None)).unwrap();
        assert_eq!(calls.get(), 1);

        std::thread::sleep(Duration::from_millis(100));
        let after = cache.instance_level(&subject, &task, counting(&calls, None)).unwrap();
        assert_eq!(after, None);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_sweep_drops_stale_entries() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        let subject = Subject::role("r-1");
        let gone = Utc::now() - chrono::Duration::seconds(1);

        cache
            .type_level(&subject, "task", || {
                Ok(Expiring {
                    value: Some(Permission::VIEW),
                    expires_at: Some(gone),
                })
            })
            .unwrap();
        cache
            .type_level(&subject, "project", counting(&Cell::new(0), Some(Permission::VIEW)))
            .unwrap();
        assert_eq!(cache.stats().entries, 2);

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_misses_trigger_periodic_sweep() {
        let cache = PermissionCache::new(Duration::ZERO);
        for i in 0..SWEEP_EVERY * 2 {
            let entity = EntityRef::new("task", format!("t-{i}"));
            cache
                .instance_level(&Subject::role("r-1"), &entity, || Ok(Expiring::never(None)))
                .unwrap();
        }
        assert!(cache.stats().entries <= SWEEP_EVERY as usize);
    }

    #[test]
    fn test_clear_drops_everything() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        cache.roles("u-1", || Ok(vec!["r-1".to_string()])).unwrap();
        cache
            .type_level(&Subject::role("r-1"), "task", || Ok(Expiring::never(None)))
            .unwrap();

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        let roles = cache.roles("u-1", || Ok(vec![])).unwrap();
        assert!(roles.is_empty());
    }

    #[test]
    fn test_membership_invalidation() {
        let cache = PermissionCache::new(Duration::from_secs(60));
        cache.roles("u-1", || Ok(vec!["r-1".to_string()])).unwrap();
        cache.invalidate(&Invalidation::Membership("u-1".into()));
        let roles = cache.roles("u-1", || Ok(vec![])).unwrap();
        assert!(roles.is_empty());
    }
}
