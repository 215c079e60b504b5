//! Task identifier generation.
//!
//! Identifiers are "slugs": a UUIDv4 encoded as 22 characters of URL-safe
//! base64 without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use uuid::Uuid;

/// Produces fresh, globally-unique task identifiers.
pub trait IdGenerator: Send + Sync {
    /// Returns a new identifier on every call.
    fn generate(&self) -> String;
}

/// Encodes a UUID as a slug.
#[must_use]
pub fn encode_slug(uuid: &Uuid) -> String {
    URL_SAFE_NO_PAD.encode(uuid.as_bytes())
}

/// Generates a random v4 slug.
#[must_use]
pub fn v4_slug() -> String {
    encode_slug(&Uuid::new_v4())
}

/// Generates a slug that never starts with `-` or `_`.
///
/// Clearing the top bit of the first byte keeps the first character in
/// `[A-Za-f]`, so the slug is safe to pass as a command line argument.
#[must_use]
pub fn nice_slug() -> String {
    let mut bytes = *Uuid::new_v4().as_bytes();
    bytes[0] &= 0x7f;
    encode_slug(&Uuid::from_bytes(bytes))
}

/// The production identifier generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlugIdGenerator;

impl IdGenerator for SlugIdGenerator {
    fn generate(&self) -> String {
        nice_slug()
    }
}

/// Deterministic generator yielding `<prefix>-0000`, `<prefix>-0001`, ...
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    next: Mutex<usize>,
}

impl SequentialIdGenerator {
    /// Creates a generator with the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: Mutex::new(0),
        }
    }

    /// Returns how many identifiers were handed out.
    #[must_use]
    pub fn issued(&self) -> usize {
        *self.next.lock()
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new("task")
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self) -> String {
        let mut next = self.next.lock();
        let id = format!("{}-{:04}", self.prefix, *next);
        *next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_slug_length_and_alphabet() {
        let slug = v4_slug();
        assert_eq!(slug.len(), 22);
        assert!(slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_nice_slug_first_char() {
        for _ in 0..200 {
            let slug = nice_slug();
            let first = slug.chars().next().unwrap();
            assert!(first.is_ascii_uppercase() || ('a'..='f').contains(&first), "{slug}");
        }
    }

    #[test]
    fn test_slug_generator_is_unique() {
        let generator = SlugIdGenerator;
        let ids: HashSet<String> = (0..500).map(|_| generator.generate()).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn test_sequential_generator() {
        let generator = SequentialIdGenerator::new("new");
        assert_eq!(generator.generate(), "new-0000");
        assert_eq!(generator.generate(), "new-0001");
        assert_eq!(generator.issued(), 2);
    }
}
