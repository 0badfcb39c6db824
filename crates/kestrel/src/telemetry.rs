// Telemetry — tracing subscriber setup
//
// Library code only emits `tracing` events. Binaries and tests that want to
// see them call `init_tracing` once; later calls are no-ops, so every test in
// a binary can call it freely.

use std::env;
use std::sync::OnceLock;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// How the global subscriber should behave.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Filter directives, e.g. `kestrel=debug,info`. When absent `RUST_LOG`
    /// is used, then [`TracingConfig::default_directive`].
    pub directives: Option<String>,
    pub default_directive: String,
    pub include_targets: bool,
    pub ansi: bool,
    /// Emit span close events (with busy/idle timings).
    pub span_timings: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_timings: false,
        }
    }
}

impl TracingConfig {
    /// Plain output for test harnesses and CI logs.
    pub fn for_tests() -> Self {
        Self {
            directives: None,
            default_directive: "warn".to_string(),
            include_targets: true,
            ansi: false,
            span_timings: false,
        }
    }

    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    fn filter(&self) -> EnvFilter {
        let from = |s: &str| EnvFilter::try_new(s).ok();
        self.directives
            .as_deref()
            .and_then(from)
            .or_else(|| env::var("RUST_LOG").ok().as_deref().and_then(from))
            .unwrap_or_else(|| EnvFilter::new(&self.default_directive))
    }
}

/// Install the global fmt subscriber. Returns `true` if this call installed
/// it, `false` if a subscriber was already in place.
pub fn init_tracing(config: &TracingConfig) -> bool {
    let mut installed_now = false;
    INSTALLED.get_or_init(|| {
        let spans = if config.span_timings {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        installed_now = tracing_subscriber::fmt()
            .with_env_filter(config.filter())
            .with_target(config.include_targets)
            .with_ansi(config.ansi)
            .with_span_events(spans)
            .try_init()
            .is_ok();
        installed_now
    });
    installed_now
}
