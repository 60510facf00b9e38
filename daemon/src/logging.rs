//! Logging setup.
//!
//! `RUST_LOG` takes precedence over the `[daemon] log_level` config key:
//! ```bash
//! RUST_LOG=debug vagrant-monitor watch
//! RUST_LOG=vagrant_monitor::detector=trace vagrant-monitor watch
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static INIT: Once = Once::new();

/// Compact time format: HH:MM:SS.mmm
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Builds the filter: `RUST_LOG` if set and valid, otherwise `level`.
fn filter_for(level: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
    }
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_LEVEL))
}

/// Initializes the global subscriber. Only the first call takes effect.
pub fn init(level: &str) {
    INIT.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_timer(CompactTime)
            .with_level(true)
            .with_filter(filter_for(level));

        tracing_subscriber::registry().with(fmt_layer).init();
    });
}
