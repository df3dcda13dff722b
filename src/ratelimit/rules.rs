//! Per-key quota rules.
//!
//! Rules override the limiter's default window for keys sharing a prefix.
//! When several rules match a key, the one with the longest prefix wins, so
//! `tenant:premium:` can carve an exception out of a broader `tenant:` rule.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::ledger::WindowConfig;
use crate::error::{Result, WindowkeeperError};

/// A quota override for keys starting with `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRule {
    /// Key prefix this rule applies to. An empty prefix matches every key.
    pub prefix: String,
    /// Maximum admissions inside the window
    pub max_requests: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Optional name/description for this rule
    #[serde(default)]
    pub name: Option<String>,
}

impl KeyRule {
    /// Create a rule. Windows longer than `u64::MAX` milliseconds are clamped.
    pub fn new(prefix: impl Into<String>, max_requests: u64, window: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            max_requests,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            name: None,
        }
    }

    /// The validated window configuration described by this rule.
    pub fn window_config(&self) -> Result<WindowConfig> {
        WindowConfig::from_millis(self.max_requests, self.window_ms).map_err(|e| {
            WindowkeeperError::Config(format!("Invalid rule for prefix {:?}: {}", self.prefix, e))
        })
    }
}

/// An ordered, validated set of [`KeyRule`]s.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<KeyRule>", into = "Vec<KeyRule>")]
pub struct KeyRules {
    rules: Vec<ResolvedRule>,
}

#[derive(Debug, Clone)]
struct ResolvedRule {
    rule: KeyRule,
    config: WindowConfig,
}

impl KeyRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and collect rules.
    pub fn from_rules(rules: Vec<KeyRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let config = rule.window_config()?;
                Ok(ResolvedRule { rule, config })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading key rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a bare list of rules or a mapping with a `rules` list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Wrapped {
            rules: Vec<KeyRule>,
        }

        if let Ok(rules) = serde_yaml::from_str::<Vec<KeyRule>>(yaml) {
            return Self::from_rules(rules);
        }

        let wrapped: Wrapped = serde_yaml::from_str(yaml)
            .map_err(|e| WindowkeeperError::Config(format!("Failed to parse key rules: {}", e)))?;
        Self::from_rules(wrapped.rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate over the rules in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyRule> {
        self.rules.iter().map(|r| &r.rule)
    }

    /// Find the most specific rule matching `key`.
    ///
    /// Among rules with equally long prefixes, the first declared wins.
    pub fn find(&self, key: &str) -> Option<&KeyRule> {
        self.find_resolved(key).map(|r| &r.rule)
    }

    /// The window configuration for `key`, or `default` when no rule matches.
    pub fn config_for(&self, key: &str, default: WindowConfig) -> WindowConfig {
        self.find_resolved(key).map_or(default, |r| r.config)
    }

    fn find_resolved(&self, key: &str) -> Option<&ResolvedRule> {
        let mut best_match: Option<&ResolvedRule> = None;

        for resolved in &self.rules {
            if !key.starts_with(resolved.rule.prefix.as_str()) {
                continue;
            }
            let more_specific = best_match
                .map_or(true, |best| resolved.rule.prefix.len() > best.rule.prefix.len());
            if more_specific {
                best_match = Some(resolved);
            }
        }

        best_match
    }
}

impl TryFrom<Vec<KeyRule>> for KeyRules {
    type Error = WindowkeeperError;

    fn try_from(rules: Vec<KeyRule>) -> Result<Self> {
        Self::from_rules(rules)
    }
}

impl From<KeyRules> for Vec<KeyRule> {
    fn from(rules: KeyRules) -> Self {
        rules.rules.into_iter().map(|r| r.rule).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> WindowConfig {
        WindowConfig::new(100, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_parse_rule_list() {
        let yaml = r#"
- prefix: "client:"
  max_requests: 10
  window_ms: 1000
"#;
        let rules = KeyRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.iter().next().unwrap().prefix, "client:");
    }

    #[test]
    fn test_parse_wrapped_rules() {
        let yaml = r#"
rules:
  - prefix: "tenant:"
    max_requests: 50
    window_ms: 60000
    name: tenants
  - prefix: "route:"
    max_requests: 5
    window_ms: 1000
"#;
        let rules = KeyRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.find("tenant:acme").unwrap().name.as_deref(), Some("tenants"));
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let yaml = r#"
- prefix: "client:"
  max_requests: 0
  window_ms: 1000
"#;
        let err = KeyRules::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, WindowkeeperError::Config(_)));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        let err = KeyRules::from_yaml("rules: [prefix: oops").unwrap_err();
        assert!(matches!(err, WindowkeeperError::Config(_)));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let rules = KeyRules::from_rules(vec![
            KeyRule::new("tenant:", 50, Duration::from_secs(60)),
            KeyRule::new("tenant:premium:", 5000, Duration::from_secs(60)),
        ])
        .unwrap();

        assert_eq!(rules.config_for("tenant:basic:42", default_config()).max_requests(), 50);
        assert_eq!(rules.config_for("tenant:premium:7", default_config()).max_requests(), 5000);
    }

    #[test]
    fn test_first_declared_wins_on_tie() {
        let mut second = KeyRule::new("api:", 2, Duration::from_secs(1));
        second.name = Some("second".to_string());
        let mut first = KeyRule::new("api:", 1, Duration::from_secs(1));
        first.name = Some("first".to_string());

        let rules = KeyRules::from_rules(vec![first, second]).unwrap();
        assert_eq!(rules.find("api:key").unwrap().name.as_deref(), Some("first"));
    }

    #[test]
    fn test_no_match_falls_back_to_default() {
        let rules = KeyRules::from_rules(vec![KeyRule::new("route:", 5, Duration::from_secs(1))]).unwrap();

        assert!(rules.find("client:10.0.0.1").is_none());
        assert_eq!(rules.config_for("client:10.0.0.1", default_config()), default_config());
    }

    #[test]
    fn test_empty_prefix_matches_everything() {
        let rules = KeyRules::from_rules(vec![KeyRule::new("", 3, Duration::from_secs(1))]).unwrap();
        assert_eq!(rules.config_for("anything", default_config()).max_requests(), 3);
    }

    #[test]
    fn test_oversized_window_is_clamped() {
        let rule = KeyRule::new("slow:", 1, Duration::MAX);
        assert_eq!(rule.window_ms, u64::MAX);
        assert_eq!(rule.window_config().unwrap().window(), Duration::from_millis(u64::MAX));
    }
}
