use std::collections::HashMap;

/// In-memory key/value storage: the authoritative map for keys whose hash
/// falls in this node's range, plus an optional read-through cache holding
/// answers learned from other nodes.
///
/// The cache is only allocated when the feature is enabled, so a disabled
/// cache can never be populated by accident.
#[derive(Debug)]
pub struct Store {
    map: HashMap<String, String>,
    cache: Option<HashMap<String, String>>,
}

impl Store {
    pub fn new(cache_enabled: bool) -> Self {
        Store {
            map: HashMap::new(),
            cache: cache_enabled.then(HashMap::new),
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.map.get(key)
    }

    /// Insert or overwrite; a missing value removes the key.
    pub fn put(&mut self, key: &str, val: Option<&str>) {
        match val {
            Some(v) => {
                self.map.insert(key.to_string(), v.to_string());
            }
            None => {
                self.map.remove(key);
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn insert(&mut self, key: String, val: String) {
        self.map.insert(key, val);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &String)> {
        self.map.iter()
    }

    /// Take every pair out of the map, leaving it empty. Used when handing a
    /// range (or the whole store) to another node.
    pub fn drain(&mut self) -> Vec<(String, String)> {
        self.map.drain().collect()
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache_get(&self, key: &str) -> Option<&String> {
        self.cache.as_ref()?.get(key)
    }

    pub fn cache_put(&mut self, key: String, val: String) {
        if let Some(cache) = self.cache.as_mut() {
            cache.insert(key, val);
        }
    }

    pub fn cache_entries(&self) -> impl Iterator<Item = (&String, &String)> {
        self.cache.iter().flatten()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_get_remove() {
        let mut store = Store::new(false);
        store.put("dungeons", Some("dragons"));
        assert_eq!(store.get("dungeons").map(String::as_str), Some("dragons"));
        store.put("dungeons", Some("dice"));
        assert_eq!(store.get("dungeons").map(String::as_str), Some("dice"));
        store.put("dungeons", None);
        assert_eq!(store.get("dungeons"), None);
    }

    #[test]
    fn disabled_cache_swallows_inserts() {
        let mut store = Store::new(false);
        assert!(!store.cache_enabled());
        store.cache_put("k".into(), "v".into());
        assert_eq!(store.cache_get("k"), None);
    }

    #[test]
    fn enabled_cache_serves_reads() {
        let mut store = Store::new(true);
        store.cache_put("k".into(), "v".into());
        assert_eq!(store.cache_get("k").map(String::as_str), Some("v"));
        // cache entries do not leak into the authoritative map
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn drain_empties_the_map() {
        let mut store = Store::new(false);
        store.put("a", Some("1"));
        store.put("b", Some("2"));
        let mut pairs = store.drain();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![("a".into(), "1".into()), ("b".into(), "2".into())]
        );
        assert!(store.is_empty());
    }
}
