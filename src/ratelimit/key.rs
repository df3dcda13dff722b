//! Limiter key generation and handling.

use std::borrow::Borrow;
use std::fmt;

/// A key that partitions one limiter into independent quotas.
///
/// The key is opaque to the limiter. [`LimiterKey::scoped`] builds keys from a
/// scope and ordered key-value pairs, in the form `scope:k1=v1,k2=v2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimiterKey(String);

impl LimiterKey {
    /// Create a key from any string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a key from a scope and its entries, preserving entry order.
    pub fn scoped<K, V>(scope: &str, entries: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let entries_str: Vec<String> = entries
            .iter()
            .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
            .collect();

        Self(format!("{}:{}", scope, entries_str.join(",")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for LimiterKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for LimiterKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LimiterKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for LimiterKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_scoped_key() {
        let key = LimiterKey::scoped("route", &[("method", "GET"), ("path", "/users")]);
        assert_eq!(key.as_str(), "route:method=GET,path=/users");
    }

    #[test]
    fn test_scoped_key_without_entries() {
        let entries: [(&str, &str); 0] = [];
        let key = LimiterKey::scoped("global", &entries);
        assert_eq!(key.to_string(), "global:");
    }

    #[test]
    fn test_key_equality() {
        let key1 = LimiterKey::from("client:10.0.0.1");
        let key2 = LimiterKey::new(String::from("client:10.0.0.1"));
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(LimiterKey::from("tenant:acme"), 7);
        assert_eq!(map.get("tenant:acme"), Some(&7));
    }
}
