/// Ordered key/value records shared by request headers and query
/// parameters. Insertion order is preserved and lookups compare keys
/// case-insensitively. The container always owns its strings; callers
/// that want zero-copy access receive borrowed slices.
#[derive(Debug, Clone, Default)]
pub struct KeyVal {
    pairs: Vec<(String, String)>,
}

impl KeyVal {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// First value recorded under `key`, ignoring ASCII case.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// Every value recorded under `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.pairs
            .iter()
            .filter(move |(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// Replace the first record under `key` and drop any later
    /// duplicates, or append if absent. After a `set` the key maps to
    /// exactly one value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        match self.pairs.iter().position(|(name, _)| name.eq_ignore_ascii_case(key)) {
            Some(first) => {
                self.pairs[first].1 = value.into();
                let mut idx = 0;
                self.pairs.retain(|(name, _)| {
                    let keep = idx <= first || !name.eq_ignore_ascii_case(key);
                    idx += 1;
                    keep
                });
            }
            None => self.pairs.push((key.to_string(), value.into())),
        }
    }

    /// Drop every record under `key`. Returns true when something was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.pairs.len();
        self.pairs.retain(|(name, _)| !name.eq_ignore_ascii_case(key));
        self.pairs.len() != before
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for KeyVal {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            pairs: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut kv = KeyVal::new();
        kv.push("Content-Type", "text/plain");
        assert_eq!(kv.get("content-type"), Some("text/plain"));
        assert_eq!(kv.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(kv.get("content-length"), None);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut kv = KeyVal::new();
        kv.push("b", "2");
        kv.push("a", "1");
        kv.push("c", "3");
        let keys: Vec<&str> = kv.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn get_returns_first_of_duplicates() {
        let mut kv = KeyVal::new();
        kv.push("Set-Cookie", "a=1");
        kv.push("set-cookie", "b=2");
        assert_eq!(kv.get("Set-Cookie"), Some("a=1"));
        assert_eq!(kv.get_all("set-cookie").count(), 2);
    }

    #[test]
    fn set_replaces_and_remove_drops_all() {
        let mut kv = KeyVal::new();
        kv.push("X", "1");
        kv.push("x", "2");
        kv.set("x", "3");
        assert_eq!(kv.get("X"), Some("3"));
        assert!(kv.remove("x"));
        assert!(kv.is_empty());
        assert!(!kv.remove("x"));
    }

    #[test]
    fn set_collapses_duplicates_in_place() {
        let mut kv = KeyVal::new();
        kv.push("Content-Length", "4");
        kv.push("Host", "a");
        kv.push("content-length", "7");
        kv.set("Content-Length", "12");
        assert_eq!(kv.len(), 2);
        assert_eq!(kv.get_all("content-length").count(), 1);
        // The surviving record keeps the original position.
        let keys: Vec<&str> = kv.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Content-Length", "Host"]);
        assert_eq!(kv.get("content-length"), Some("12"));
    }
}
