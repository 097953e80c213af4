//! Key-value configuration store.
//!
//! Keys are dotted strings (`tcp.port`, `alice.password`). Values are kept as
//! strings and coerced on access. Key iteration order is sorted, so anything
//! derived from `keys()` (such as the server's user listing) is deterministic.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    entries: BTreeMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Loads a `.properties` style file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses `key = value` lines. Blank lines and lines starting with `#` or
    /// `!` are ignored; `:` is accepted as separator too.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut entries = BTreeMap::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }

            let split = line
                .find(&['=', ':'][..])
                .ok_or_else(|| ConfigError::Malformed {
                    line: index + 1,
                    content: raw.to_string(),
                })?;
            let key = line[..split].trim();
            let value = line[split + 1..].trim();
            if key.is_empty() {
                return Err(ConfigError::Malformed {
                    line: index + 1,
                    content: raw.to_string(),
                });
            }
            entries.insert(key.to_string(), value.to_string());
        }

        Ok(Self { entries })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_string(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    pub fn get_int<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
    {
        let value = self.get_string(key)?;
        value.parse().map_err(|_| ConfigError::NotAnInteger {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// All keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_properties() {
        let config = Config::parse(
            "# chat server\n\
             tcp.port = 13460\n\
             udp.port:13461\n\
             \n\
             ! legacy comment\n\
             host=127.0.0.1\n",
        )
        .unwrap();

        assert_eq!(config.len(), 3);
        assert_eq!(config.get_int::<u16>("tcp.port").unwrap(), 13460);
        assert_eq!(config.get_int::<u16>("udp.port").unwrap(), 13461);
        assert_eq!(config.get_string("host").unwrap(), "127.0.0.1");
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let err = Config::parse("tcp.port = 1\nnonsense\n").unwrap_err();
        match err {
            ConfigError::Malformed { line, .. } => assert_eq!(line, 2),
            other => panic!("Unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_and_non_integer_keys() {
        let config = Config::from_pairs([("tcp.port", "eighty")]);

        assert!(matches!(
            config.get_string("udp.port"),
            Err(ConfigError::MissingKey(_))
        ));
        assert!(matches!(
            config.get_int::<u16>("tcp.port"),
            Err(ConfigError::NotAnInteger { .. })
        ));
    }

    #[test]
    fn test_keys_are_sorted() {
        let config = Config::from_pairs([
            ("bob.password", "x"),
            ("alice.password", "y"),
            ("carol.password", "z"),
        ]);
        let keys: Vec<&str> = config.keys().collect();
        assert_eq!(keys, vec!["alice.password", "bob.password", "carol.password"]);
    }

    #[test]
    fn test_value_may_contain_separator() {
        let config = Config::parse("chatserver.host = fe80::1\n").unwrap();
        assert_eq!(config.get("chatserver.host"), Some("fe80::1"));
    }
}
