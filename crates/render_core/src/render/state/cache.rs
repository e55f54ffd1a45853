//! Deduplication of immutable GPU state objects
//!
//! Samplers and depth/stencil objects are created at most once per distinct
//! descriptor. Descriptors pack into a 64-bit key; the cache maps keys to
//! backend handles and never evicts while the device lives.

use std::collections::HashMap;

use crate::render::backend::{DepthStencilDescriptor, SamplerDescriptor};

/// A descriptor with a collision-free 64-bit key
pub trait StateDescriptor {
    /// Packed key
    fn cache_key(&self) -> u64;
}

impl StateDescriptor for SamplerDescriptor {
    fn cache_key(&self) -> u64 {
        self.key()
    }
}

impl StateDescriptor for DepthStencilDescriptor {
    fn cache_key(&self) -> u64 {
        self.key()
    }
}

/// Hit/miss counters of a [`StateObjectCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Objects currently cached
    pub entries: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that created an object
    pub misses: u64,
}

/// Map from descriptor key to created object
#[derive(Debug)]
pub struct StateObjectCache<K> {
    objects: HashMap<u64, K>,
    hits: u64,
    misses: u64,
}

impl<K> Default for StateObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }
}

impl<K: Copy> StateObjectCache<K> {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the object for `desc`, creating it with `create` on first use
    ///
    /// A failed creation leaves the cache untouched.
    pub fn get_or_create<D, E>(
        &mut self,
        desc: &D,
        create: impl FnOnce(&D) -> Result<K, E>,
    ) -> Result<K, E>
    where
        D: StateDescriptor,
    {
        let key = desc.cache_key();
        if let Some(object) = self.objects.get(&key) {
            self.hits += 1;
            return Ok(*object);
        }

        let object = create(desc)?;
        self.misses += 1;
        self.objects.insert(key, object);
        Ok(object)
    }

    /// Cached object for `desc`, if any
    pub fn get<D: StateDescriptor>(&self, desc: &D) -> Option<K> {
        self.objects.get(&desc.cache_key()).copied()
    }

    /// Objects cached
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.objects.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    /// Remove and return every cached object, for teardown
    pub fn drain(&mut self) -> Vec<K> {
        self.objects.drain().map(|(_, object)| object).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::types::{CompareMode, FilterMode};

    #[test]
    fn test_identical_descriptors_share_object() {
        let mut cache = StateObjectCache::<u32>::new();
        let mut created = 0;
        let desc = SamplerDescriptor::default();

        let a = cache
            .get_or_create(&desc, |_| -> Result<u32, ()> {
                created += 1;
                Ok(created)
            })
            .unwrap();
        let b = cache
            .get_or_create(&SamplerDescriptor::default(), |_| -> Result<u32, ()> {
                created += 1;
                Ok(created)
            })
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(created, 1);
        assert_eq!(cache.stats(), CacheStats { entries: 1, hits: 1, misses: 1 });
    }

    #[test]
    fn test_distinct_descriptors_create_distinct_objects() {
        let mut cache = StateObjectCache::<u64>::new();
        let linear = SamplerDescriptor::default();
        let nearest = SamplerDescriptor {
            mag_filter: FilterMode::Nearest,
            ..linear
        };

        let a = cache.get_or_create(&linear, |d| Ok::<_, ()>(d.key())).unwrap();
        let b = cache.get_or_create(&nearest, |d| Ok::<_, ()>(d.key())).unwrap();
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_creation_is_not_cached() {
        let mut cache = StateObjectCache::<u32>::new();
        let desc = DepthStencilDescriptor {
            stencil_compare: CompareMode::Equal,
            ..DepthStencilDescriptor::default()
        };

        assert!(cache.get_or_create(&desc, |_| Err("out of memory")).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_create(&desc, |_| Ok::<_, &str>(9)), Ok(9));
    }
}
