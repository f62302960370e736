/// Configuration for the `PostgreSQL` advisory-lock backend.
///
/// The connection pool itself is supplied by the caller; this only covers the
/// lock namespace.
#[derive(Debug, Clone)]
pub struct PostgresLockConfig {
    /// Prefix hashed together with every lock key, namespacing this
    /// deployment's advisory lock ids.
    pub key_prefix: String,
}

impl Default for PostgresLockConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::from("ncps:lock:"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = PostgresLockConfig::default();
        assert_eq!(cfg.key_prefix, "ncps:lock:");
    }
}
