use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("PIDLOG_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Initialize the stderr logger based on `PIDLOG_LOG`/`RUST_LOG`.
///
/// `verbose` lowers the default to `debug` when neither variable is set to a
/// more detailed level. Safe to call more than once; only the first call wins.
pub fn init_logging(verbose: bool) {
    let mut level = env_level();
    if verbose && level < LevelFilter::Debug {
        level = LevelFilter::Debug;
    }
    LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(false)
            .format_target(true)
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_back() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(level_to_str(level).parse::<LevelFilter>().ok(), Some(level));
        }
    }
}
