use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = waypoint_common::id::prefixed_ulid("cli");
/// assert!(id.starts_with("cli_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// One per accepted relay connection.
    pub const CLIENT: &str = "cli";
    pub const TRIP: &str = "trip";
    pub const USER: &str = "usr";
    pub const ACTIVITY: &str = "act";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ulid_format() {
        let id = prefixed_ulid("cli");
        assert!(id.starts_with("cli_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 4 + 26);
    }

    #[test]
    fn uniqueness() {
        let a = prefixed_ulid("cli");
        let b = prefixed_ulid("cli");
        assert_ne!(a, b);
    }
}
