//! Diagnostics on stderr for following a session while it runs.
//!
//! `RUST_LOG` wins when set. Otherwise the level follows the CLI's `-v`
//! count. Traces written by `io::transcript` are product output and do not
//! depend on either.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset: `warn`, then `mobile_use=info`,
/// then `mobile_use=debug` for each `-v`.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,mobile_use=info",
        _ => "warn,mobile_use=debug",
    }
}

/// Install the global subscriber: compact format on stderr.
///
/// ```bash
/// RUST_LOG=mobile_use::session=debug mobile-use run "check battery level"
/// ```
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_crate_level_only() {
        assert_eq!(default_directive(0), "warn");
        assert!(default_directive(1).ends_with("mobile_use=info"));
        assert_eq!(default_directive(5), default_directive(2));
        for v in 0..3 {
            assert!(default_directive(v).parse::<EnvFilter>().is_ok());
        }
    }
}
