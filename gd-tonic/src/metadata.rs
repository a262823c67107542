//! Call metadata.
//!
//! Metadata is an ordered list of string pairs. Real gRPC runtimes add their
//! own pairs in transmission, and application code that asserts on metadata
//! must tolerate that. The fixtures reproduce it by appending one sentinel
//! pair to every metadata value they materialize.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of the pair the fixtures append to materialized metadata.
pub const RUNTIME_METADATA_KEY: &str = "grpc.metadata_added_by_runtime";

/// Value of the pair the fixtures append to materialized metadata.
pub const RUNTIME_METADATA_VALUE: &str =
    "gRPC is allowed to add metadata in transmission and does so.";

/// Ordered `(key, value)` pairs attached to a call.
///
/// Keys may repeat; [`Metadata::get`] returns the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pairs: Vec<(String, String)>,
}

impl Metadata {
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
            pairs: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Whether the runtime sentinel is the last pair.
    pub fn is_fussed(&self) -> bool {
        self.pairs
            .last()
            .is_some_and(|(k, v)| k == RUNTIME_METADATA_KEY && v == RUNTIME_METADATA_VALUE)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {value}")?;
        }
        f.write_str("}")
    }
}

/// Metadata as the runtime would deliver it: `metadata` (or nothing) followed
/// by the runtime sentinel.
///
/// Applying this to metadata that already ends with the sentinel returns it
/// unchanged, so metadata that passes through several fixture layers carries
/// exactly one sentinel.
pub fn fuss_with_metadata(metadata: Option<&Metadata>) -> Metadata {
    match metadata {
        Some(metadata) if metadata.is_fussed() => metadata.clone(),
        Some(metadata) => {
            let mut fussed = metadata.clone();
            fussed.push(RUNTIME_METADATA_KEY, RUNTIME_METADATA_VALUE);
            fussed
        }
        None => fussed_empty_metadata(),
    }
}

/// The metadata synthesized when a side never supplied any.
pub fn fussed_empty_metadata() -> Metadata {
    Metadata::from_pairs([(RUNTIME_METADATA_KEY, RUNTIME_METADATA_VALUE)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentinel_count(metadata: &Metadata) -> usize {
        metadata
            .iter()
            .filter(|(k, _)| *k == RUNTIME_METADATA_KEY)
            .count()
    }

    #[test]
    fn fussing_appends_the_sentinel_once() {
        let once = fuss_with_metadata(None);
        let twice = fuss_with_metadata(Some(&once));
        assert_eq!(once, fussed_empty_metadata());
        assert_eq!(twice, once);
        assert_eq!(sentinel_count(&twice), 1);
    }

    #[test]
    fn fussing_keeps_caller_pairs_in_order() {
        let supplied = Metadata::from_pairs([("a", "1"), ("b", "2"), ("a", "3")]);
        let fussed = fuss_with_metadata(Some(&supplied));

        let pairs: Vec<_> = fussed.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("a", "1"),
                ("b", "2"),
                ("a", "3"),
                (RUNTIME_METADATA_KEY, RUNTIME_METADATA_VALUE),
            ]
        );
        assert_eq!(fussed.get("a"), Some("1"));
        assert_eq!(fussed.get("missing"), None);
    }

    #[test]
    fn empty_metadata_is_not_fussed() {
        let empty = Metadata::new();
        assert!(empty.is_empty());
        assert!(!empty.is_fussed());
        assert_eq!(fuss_with_metadata(Some(&empty)).len(), 1);
    }

    #[test]
    fn display_lists_pairs() {
        let metadata: Metadata = [("k", "v"), ("x", "y")].into_iter().collect();
        assert_eq!(metadata.to_string(), "{k: v, x: y}");
    }
}
