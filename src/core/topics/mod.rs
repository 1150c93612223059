//! Topic-pattern routing.
//!
//! A subscription pattern is matched against published topic names:
//! `"*"` matches every topic, an exact pattern matches only itself, and a
//! pattern ending in `.*` matches any topic under that prefix
//! (`orders.*` matches `orders.created` but not `orders` or `ordersx.y`).
//! No other wildcard forms are supported.

/// Returns true when `topic` satisfies `pattern`.
///
/// Stateless and side-effect free. A topic may satisfy several patterns at
/// once; the broker fans the message out to each matching subscription
/// independently.
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern == topic {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.len() > 1 && rest.starts_with('.'));
    }
    false
}
