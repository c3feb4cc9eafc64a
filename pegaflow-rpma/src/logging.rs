use std::sync::Once;

use log::LevelFilter;
use logforth::diagnostic::ThreadLocalDiagnostic;

static INIT: Once = Once::new();

/// Installs the stderr logger once per process.
///
/// `RUST_LOG` wins when set; otherwise `level` applies to this crate and
/// everything else logs at `info`.
///
/// Nothing is installed when another logger is already active, or when
/// `level` is `Off`; an embedding application keeps its own logger that way
/// and a later call with a real level can still install ours.
pub fn ensure_initialized(level: LevelFilter) {
    if log::max_level() != LevelFilter::Off || level == LevelFilter::Off {
        return;
    }

    INIT.call_once(|| {
        let filter_str = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| default_directive(level));
        let filter: logforth::filter::EnvFilter =
            filter_str.parse().unwrap_or_else(|_| "info".into());

        let mut builder = logforth::starter_log::builder();
        builder = builder.dispatch(|d| {
            d.filter(filter)
                .diagnostic(ThreadLocalDiagnostic::default())
                .append(logforth::append::Stderr::default())
        });
        builder.apply();
    });
}

fn default_directive(level: LevelFilter) -> String {
    let level = level.to_string().to_lowercase();
    format!("info,pegaflow_rpma={level},rpma_flush_client={level},rpma_flush_server={level}")
}
