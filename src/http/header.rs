//! Ordered, case-insensitive header table.

/// An ordered multi-map of header fields.
///
/// Lookups compare names case-insensitively; iteration yields fields in the
/// order they were added, repeated names included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table with room for `n` fields.
    pub fn with_capacity(n: usize) -> Self {
        Self {
            entries: Vec::with_capacity(n),
        }
    }

    /// Add a field, keeping any existing fields with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every field named `name` with a single value.
    ///
    /// The new field takes the position of the first replaced one, or goes last.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => {
                self.entries[idx] = (name.clone(), value);
                let mut i = idx + 1;
                while i < self.entries.len() {
                    if self.entries[i].0.eq_ignore_ascii_case(&name) {
                        self.entries.remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
            None => self.entries.push((name, value)),
        }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether any field is named `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Remove every field named `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Whether the comma-separated values of `name` contain `token`
    /// (case-insensitive token match, not substring match).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Iterate over `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (k, v) in iter {
            map.append(k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.append("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert!(headers.contains("Content-type"));
    }

    #[test]
    fn preserves_order_and_repeats() {
        let headers: HeaderMap = [("a", "1"), ("B", "2"), ("A", "3")].into_iter().collect();
        let names: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a", "B", "A"]);
        let values: Vec<_> = headers.get_all("a").collect();
        assert_eq!(values, vec!["1", "3"]);
    }

    #[test]
    fn insert_replaces_all() {
        let mut headers: HeaderMap = [("x", "1"), ("y", "2"), ("X", "3")].into_iter().collect();
        headers.insert("x", "9");
        let pairs: Vec<_> = headers.iter().collect();
        assert_eq!(pairs, vec![("x", "9"), ("y", "2")]);
    }

    #[test]
    fn remove_returns_count() {
        let mut headers: HeaderMap = [("x", "1"), ("X", "2"), ("y", "3")].into_iter().collect();
        assert_eq!(headers.remove("x"), 2);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn token_match_not_substring() {
        let mut headers = HeaderMap::new();
        headers.append("Connection", "keep-alive, Upgrade");
        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("connection", "keep-alive"));
        assert!(!headers.has_token("connection", "grade"));

        let mut other = HeaderMap::new();
        other.append("Connection", "upgraded");
        assert!(!other.has_token("connection", "upgrade"));
    }
}
