//! Broker topic set

use thiserror::Error;

/// Separator used by the `Topics` property
pub const TOPIC_SEPARATOR: char = ',';

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic {0} already exists")]
    Duplicate(String),
    #[error("topic must not be empty")]
    Empty,
}

/// Set of broker topic filters
///
/// Iteration follows insertion order so subscriptions are issued in the order
/// the operator listed them, but equality ignores order.
#[derive(Debug, Clone, Default)]
pub struct TopicSet {
    topics: Vec<String>,
}

impl TopicSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the comma-separated property form
    ///
    /// Entries are trimmed; empty entries and repeats are skipped.
    pub fn parse(source: &str) -> Self {
        let mut set = Self::new();
        for topic in source.split(TOPIC_SEPARATOR) {
            // Duplicates and blanks in operator input are not fatal
            let _ = set.add(topic.trim());
        }
        set
    }

    /// Insert a topic, rejecting one that is already present
    pub fn add(&mut self, topic: impl Into<String>) -> Result<(), TopicError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(TopicError::Empty);
        }
        if self.contains(&topic) {
            return Err(TopicError::Duplicate(topic));
        }
        self.topics.push(topic);
        Ok(())
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.iter().any(|t| t == topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.topics.clear();
    }

    /// Comma-separated form stored in the `Topics` property
    pub fn to_property_value(&self) -> String {
        self.topics.join(",")
    }
}

impl PartialEq for TopicSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|topic| other.contains(topic))
    }
}

impl Eq for TopicSet {}

impl<'a> IntoIterator for &'a TopicSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.topics.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_property_value() {
        let set = TopicSet::parse("/gw/#, SENSO8/#");

        assert_eq!(set.len(), 2);
        assert!(set.contains("/gw/#"));
        assert!(set.contains("SENSO8/#"));
        assert_eq!(set.to_property_value(), "/gw/#,SENSO8/#");
    }

    #[test]
    fn test_parse_skips_blank_and_repeated_entries() {
        let set = TopicSet::parse("a,,b, a ,");

        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_empty_string_is_empty_set() {
        assert!(TopicSet::parse("").is_empty());
    }

    #[test]
    fn test_duplicate_add_is_rejected() {
        let mut set = TopicSet::parse("sensors/+/temp");

        let result = set.add("sensors/+/temp");

        assert_eq!(
            result,
            Err(TopicError::Duplicate("sensors/+/temp".to_string()))
        );
        assert_eq!(set.len(), 1);
        assert_eq!(
            result.unwrap_err().to_string(),
            "topic sensors/+/temp already exists"
        );
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        let mut set = TopicSet::new();
        assert_eq!(set.add(""), Err(TopicError::Empty));
        assert!(set.is_empty());
    }

    #[test]
    fn test_equality_ignores_order() {
        assert_eq!(TopicSet::parse("a,b,c"), TopicSet::parse("c,a,b"));
        assert_ne!(TopicSet::parse("a,b"), TopicSet::parse("a,b,c"));
    }

    proptest! {
        #[test]
        fn prop_resubmitting_any_member_leaves_set_unchanged(
            topics in proptest::collection::vec("[a-z/#+]{1,12}", 1..8),
            pick in any::<proptest::sample::Index>(),
        ) {
            let mut set = TopicSet::new();
            for topic in &topics {
                let _ = set.add(topic.clone());
            }
            let before = set.clone();
            let member = topics[pick.index(topics.len())].clone();

            let result = set.add(member.clone());

            prop_assert_eq!(result, Err(TopicError::Duplicate(member)));
            prop_assert_eq!(set.len(), before.len());
            prop_assert_eq!(set, before);
        }

        #[test]
        fn prop_property_value_round_trips(
            topics in proptest::collection::hash_set("[a-zA-Z0-9/#+]{1,12}", 0..8),
        ) {
            let mut set = TopicSet::new();
            for topic in &topics {
                set.add(topic.clone()).unwrap();
            }

            prop_assert_eq!(TopicSet::parse(&set.to_property_value()), set);
        }
    }
}
