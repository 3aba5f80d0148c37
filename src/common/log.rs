//! Logger setup
//!
//! `RUST_LOG` wins over the configured level when both are present.

/// Initialize the global logger
///
/// # Parameters
///
/// * `level` - Default filter used when `RUST_LOG` is unset
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    // A second initialisation (tests, embedding) is not an error worth surfacing
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}
