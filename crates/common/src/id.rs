//! Message identifier generation.

use ulid::Ulid;

/// ID generator for queued messages.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    prefix: Option<String>,
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { prefix: None }
    }

    /// Create an ID generator whose IDs start with `prefix_`.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    /// Generate a new ULID-based ID.
    ///
    /// ULIDs sort by creation time, which keeps log lines for the same burst
    /// of messages adjacent.
    #[must_use]
    pub fn generate(&self) -> String {
        let id = Ulid::new().to_string().to_lowercase();
        match &self.prefix {
            Some(prefix) => format!("{prefix}_{id}"),
            None => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ulid() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.generate();
        let id2 = id_gen.generate();

        assert_eq!(id1.len(), 26);
        assert_eq!(id2.len(), 26);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_generate_with_prefix() {
        let id_gen = IdGenerator::with_prefix("msg");
        let id = id_gen.generate();

        assert!(id.starts_with("msg_"));
        assert_eq!(id.len(), 30);
    }
}
