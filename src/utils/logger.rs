//! Tracing subscriber setup and the `log_*!` shorthands used by commands

use tracing_subscriber::EnvFilter;

/// Default filter for a `-v` count. Our own crate gets the chosen level while
/// kube and hyper stay at `warn` until `-vvv`.
pub fn filter_for_verbosity(verbose: u8) -> String {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => return "trace".to_string(),
    };
    format!("warn,fluxburst_gke={}", level)
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the verbosity flag when it is set.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_for_verbosity(verbose)));

    // A second init (tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .try_init();
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        ::tracing::info!("{}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        ::tracing::warn!("{}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        ::tracing::error!("{}", format_args!($($arg)*))
    };
}
