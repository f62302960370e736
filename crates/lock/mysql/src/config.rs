/// Configuration for the MySQL/MariaDB advisory-lock backend.
///
/// The connection pool itself is supplied by the caller; this only covers the
/// lock namespace.
#[derive(Debug, Clone)]
pub struct MysqlLockConfig {
    /// Prefix hashed together with every lock key, namespacing this
    /// deployment's named locks.
    pub key_prefix: String,
}

impl Default for MysqlLockConfig {
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
        let cfg = MysqlLockConfig::default();
        assert_eq!(cfg.key_prefix, "ncps:lock:");
    }
}
