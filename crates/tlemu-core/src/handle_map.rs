use dashmap::DashMap;

/// Concurrent map from an opaque Vulkan handle value to layer-side data.
///
/// Every lookup takes only a shard lock inside the map, never a device lock,
/// so it is safe to consult while a device lock is held and vice versa.
pub struct ObjectMap<V> {
    objects: DashMap<u64, V>,
}

impl<V: Clone> ObjectMap<V> {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    /// Register `value` under `key`, replacing any previous entry.
    pub fn insert(&self, key: u64, value: V) -> Option<V> {
        self.objects.insert(key, value)
    }

    pub fn find(&self, key: u64) -> Option<V> {
        self.objects.get(&key).map(|v| v.clone())
    }

    pub fn contains(&self, key: u64) -> bool {
        self.objects.contains_key(&key)
    }

    pub fn remove(&self, key: u64) -> Option<V> {
        self.objects.remove(&key).map(|(_, v)| v)
    }

    /// Snapshot of every registered key.
    pub fn keys(&self) -> Vec<u64> {
        self.objects.iter().map(|e| *e.key()).collect()
    }

    /// Return number of registered objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl<V: Clone> Default for ObjectMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
