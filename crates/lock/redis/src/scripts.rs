//! Lua scripts executed atomically on the Redis server.

/// Release a lock key only when it still carries the caller's owner value.
///
/// KEYS[1] — lock key
/// ARGV[1] — owner value written at acquisition
///
/// Returns 1 when the key was deleted, 0 when it was absent or owned by
/// someone else (expired and reacquired since).
pub const LOCK_RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";
