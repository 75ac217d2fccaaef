//! Runtime configuration knobs.
//!
//! Defaults are deliberately conservative; each knob can be overridden
//! through an environment variable so deployed programs can be tuned without
//! rebuilding.

/// Tunable limits for one VM instance.
#[derive(Debug, Clone)]
pub struct VoltConfig {
    /// Maximum interpreter call depth before the VM refuses to recurse.
    pub max_call_depth: usize,
    /// Worker threads in the blocking pool (lazily started).
    pub blocking_threads: usize,
    /// Concatenations at or below this many total bytes materialize a flat
    /// string instead of a concat node.
    pub string_concat_inline_max: u64,
}

impl Default for VoltConfig {
    fn default() -> Self {
        VoltConfig {
            max_call_depth: 4096,
            blocking_threads: 4,
            string_concat_inline_max: 128,
        }
    }
}

impl VoltConfig {
    /// Defaults with environment overrides applied
    /// (`VOLT_MAX_CALL_DEPTH`, `VOLT_POOL_THREADS`).
    pub fn from_env() -> Self {
        let mut config = VoltConfig::default();
        if let Some(depth) = read_env("VOLT_MAX_CALL_DEPTH") {
            config.max_call_depth = depth;
        }
        if let Some(threads) = read_env("VOLT_POOL_THREADS") {
            config.blocking_threads = threads.max(1);
        }
        config
    }
}

fn read_env(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = VoltConfig::default();
        assert_eq!(c.string_concat_inline_max, 128);
        assert!(c.max_call_depth > 0);
        assert!(c.blocking_threads > 0);
    }
}
