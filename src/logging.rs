// src/logging.rs
//! Logger installation. The library itself only talks to the `log` facade;
//! hosts call [`init_logging`] once, early.

use std::sync::Once;

/// `filter` uses `env_logger` syntax, e.g. `"slop_render=debug,wgpu_core=warn"`.
/// When `None`, `RUST_LOG` wins, then the build-profile default.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter: Option<String>,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            timestamps: true,
        }
    }
}

impl LoggingConfig {
    /// Debug builds log at `debug`, release builds at `warn`.
    pub fn default_level() -> log::LevelFilter {
        if cfg!(debug_assertions) {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        }
    }
}

static INIT: Once = Once::new();

/// Idempotent; later calls are ignored.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(LoggingConfig::default_level());
        // wgpu is chatty at debug level
        builder.filter_module("wgpu_core", log::LevelFilter::Warn);
        builder.filter_module("wgpu_hal", log::LevelFilter::Warn);
        builder.filter_module("naga", log::LevelFilter::Warn);

        match &config.filter {
            Some(filter) => {
                builder.parse_filters(filter);
            }
            None => {
                builder.parse_default_env();
            }
        }

        if config.timestamps {
            builder.format_timestamp_millis();
        } else {
            builder.format_timestamp(None);
        }
        builder.format_target(false);

        installed(builder.try_init(), "env_logger");
    });
}

#[cfg(target_arch = "wasm32")]
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        let level = config
            .filter
            .as_deref()
            .and_then(|f| f.parse::<log::Level>().ok())
            .unwrap_or(log::Level::Debug);
        installed(console_log::init_with_level(level), "console_log");
    });
}

/// A host that installed its own logger first keeps it; say so through that
/// logger instead of dropping the error.
fn installed(result: Result<(), log::SetLoggerError>, backend: &str) -> bool {
    match result {
        Ok(()) => {
            log::debug!("logging initialized ({backend})");
            true
        }
        Err(err) => {
            log::warn!("{backend} not installed, keeping the existing logger: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        let config = LoggingConfig {
            filter: Some("warn".into()),
            timestamps: false,
        };
        init_logging(&config);
        init_logging(&LoggingConfig::default());
        log::warn!("still alive after double init");
    }

    #[test]
    fn a_second_logger_is_reported_not_installed() {
        init_logging(&LoggingConfig::default());
        let again = env_logger::Builder::new().is_test(true).try_init();
        assert!(!installed(again, "env_logger"));
    }
}
