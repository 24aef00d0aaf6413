use std::collections::BTreeMap;

/// The applied key→value state. Only committed log entries reach this map,
/// in log order, so every replica that has applied the same prefix holds an
/// identical mapping.
#[derive(Default)]
pub struct KeyValueStore {
    data: BTreeMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> KeyValueStore {
        KeyValueStore {
            data: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, key: &str, value: &str) {
        self.data.insert(key.to_string(), value.to_string());
    }

    /// Reads never fail: a key that was never written maps to "".
    pub fn get(&self, key: &str) -> &str {
        self.data.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_reads_empty() {
        let store = KeyValueStore::new();
        assert_eq!(store.get("zzz"), "");
    }

    #[test]
    fn last_write_wins() {
        let mut store = KeyValueStore::new();
        store.apply("x", "1");
        store.apply("x", "2");
        assert_eq!(store.get("x"), "2");
        assert_eq!(store.len(), 1);
    }
}
