//! Process-wide logger setup.

use env_logger::{Builder, Env};
use std::sync::Once;

const LOG_ENV: &str = "JMVOLUME_LOG";
const LOG_STYLE_ENV: &str = "JMVOLUME_LOG_STYLE";

static INIT: Once = Once::new();

/// Install the `env_logger` backend for the `log` facade.
///
/// `JMVOLUME_LOG` takes precedence over `RUST_LOG`; `default_level` applies
/// when neither is set. Repeated calls are no-ops.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        let fallback = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
        let env = Env::new()
            .filter_or(LOG_ENV, fallback)
            .write_style(LOG_STYLE_ENV);
        let _ = Builder::from_env(env).format_timestamp_secs().try_init();
    });
}
