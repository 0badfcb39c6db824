// Engine configuration
//
// Plain builder struct. Defaults are sensible for tests; `from_env` lets a
// deployment tune thresholds without recompiling.

use std::env;
use std::str::FromStr;

/// Tunables for an [`crate::Engine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Elementwise loops at or above this many elements run on the rayon pool.
    pub element_threshold: usize,
    /// TAD loops with at least this many tiles run on the rayon pool.
    pub tad_threshold: usize,
    /// Log every dispatch at debug level.
    pub debug: bool,
    /// Log operand shapes and timings with each dispatch.
    pub verbose: bool,
    /// Default for [`crate::ExecutionContext::allow_helpers`] on new contexts.
    pub helpers_allowed: bool,
    /// Root seed for random ops that run inside graphs.
    pub graph_seed: i64,
    /// Upper bound on iterations of a scoped `While` before it is aborted.
    pub max_loop_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            element_threshold: 32_768,
            tad_threshold: 64,
            debug: false,
            verbose: false,
            helpers_allowed: true,
            graph_seed: 119,
            max_loop_iterations: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn with_element_threshold(mut self, n: usize) -> Self {
        self.element_threshold = n;
        self
    }

    pub fn with_tad_threshold(mut self, n: usize) -> Self {
        self.tad_threshold = n;
        self
    }

    pub fn with_debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    pub fn with_verbose(mut self, on: bool) -> Self {
        self.verbose = on;
        self
    }

    pub fn with_helpers_allowed(mut self, on: bool) -> Self {
        self.helpers_allowed = on;
        self
    }

    pub fn with_graph_seed(mut self, seed: i64) -> Self {
        self.graph_seed = seed;
        self
    }

    pub fn with_max_loop_iterations(mut self, n: usize) -> Self {
        self.max_loop_iterations = n;
        self
    }

    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `KESTREL_ELEMENT_THRESHOLD` - parallel threshold for elementwise loops
    /// - `KESTREL_TAD_THRESHOLD` - parallel threshold for TAD loops
    /// - `KESTREL_DEBUG` - `true`/`false` (or `1`/`0`)
    /// - `KESTREL_VERBOSE` - `true`/`false` (or `1`/`0`)
    /// - `KESTREL_GRAPH_SEED` - root seed for random ops in graphs
    ///
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("KESTREL_ELEMENT_THRESHOLD") {
            config.element_threshold = v;
        }
        if let Some(v) = env_parse("KESTREL_TAD_THRESHOLD") {
            config.tad_threshold = v;
        }
        if let Some(v) = env_flag("KESTREL_DEBUG") {
            config.debug = v;
        }
        if let Some(v) = env_flag("KESTREL_VERBOSE") {
            config.verbose = v;
        }
        if let Some(v) = env_parse("KESTREL_GRAPH_SEED") {
            config.graph_seed = v;
        }
        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable configuration value");
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unparsable configuration flag");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 5] = [
        "KESTREL_ELEMENT_THRESHOLD",
        "KESTREL_TAD_THRESHOLD",
        "KESTREL_DEBUG",
        "KESTREL_VERBOSE",
        "KESTREL_GRAPH_SEED",
    ];

    #[test]
    fn test_builder() {
        let c = EngineConfig::default()
            .with_element_threshold(8)
            .with_debug(true)
            .with_graph_seed(5);
        assert_eq!(c.element_threshold, 8);
        assert!(c.debug);
        assert_eq!(c.graph_seed, 5);
        assert_eq!(c.tad_threshold, EngineConfig::default().tad_threshold);
    }

    #[test]
    fn test_from_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        for k in KEYS {
            env::remove_var(k);
        }
        env::set_var("KESTREL_ELEMENT_THRESHOLD", "100");
        env::set_var("KESTREL_DEBUG", "1");
        env::set_var("KESTREL_TAD_THRESHOLD", "lots");
        let c = EngineConfig::from_env();
        assert_eq!(c.element_threshold, 100);
        assert!(c.debug);
        assert_eq!(c.tad_threshold, EngineConfig::default().tad_threshold);
        for k in KEYS {
            env::remove_var(k);
        }
    }
}
