// File: src/map.rs
//
// `FunMap`: the insertion-ordered string-keyed dictionary backing Fun's
// `Map` value (spec §3.3). Grounded on `original_source/src/value.h`'s
// `map_set`/`map_get_copy`/`map_has`/`map_keys_array`/`map_values_array`
// contract, reimplemented as an append-only entry vector plus an index so
// iteration order matches insertion order exactly — `ruff`'s own
// `Value::Dict` uses a plain `HashMap` with no order guarantee, so it is
// not reused here.

use ahash::AHashMap;

use crate::value::Value;

#[derive(Clone, Default)]
pub struct FunMap {
    entries: Vec<(String, Value)>,
    index: AHashMap<String, usize>,
}

impl FunMap {
    pub fn new() -> Self {
        Self { entries: Vec::new(), index: AHashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Updates an existing key in place (keeping its original position) or
    /// appends a new entry, preserving insertion order (spec §3.3).
    pub fn set(&mut self, key: &str, value: Value) {
        if let Some(&i) = self.index.get(key) {
            self.entries[i].1 = value;
        } else {
            self.index.insert(key.to_string(), self.entries.len());
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn get_copy(&self, key: &str) -> Option<Value> {
        self.index.get(key).map(|&i| self.entries[i].1.clone())
    }

    pub fn has(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.iter().map(|(k, _)| Value::Str(k.clone())).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.entries.iter()
    }

    pub fn deep_clone(&self) -> FunMap {
        let entries: Vec<(String, Value)> =
            self.entries.iter().map(|(k, v)| (k.clone(), v.deep_clone())).collect();
        let index = self.index.clone();
        FunMap { entries, index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order() {
        let mut m = FunMap::new();
        m.set("b", Value::Int(2));
        m.set("a", Value::Int(1));
        m.set("b", Value::Int(22));
        let keys: Vec<String> = m.keys().into_iter().map(|v| match v {
            Value::Str(s) => s,
            _ => unreachable!(),
        }).collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
        assert!(matches!(m.get_copy("b"), Some(Value::Int(22))));
    }

    #[test]
    fn has_and_missing_key() {
        let mut m = FunMap::new();
        m.set("k", Value::Nil);
        assert!(m.has("k"));
        assert!(!m.has("missing"));
        assert!(m.get_copy("missing").is_none());
    }
}
