//! Logging bootstrap shared by the keyward binaries.

use env_logger::{Builder, Env};
use std::sync::Once;

static INIT: Once = Once::new();

/// Install the global logger. `RUST_LOG` overrides `default_level`.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        let env = Env::default().default_filter_or(default_level);
        let _ = Builder::from_env(env)
            .format_timestamp_secs()
            .format_target(false)
            .try_init();
    });
}
