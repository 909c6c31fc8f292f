//! Process-wide tracing setup.

use egress_core::util::{env_bool, env_string};
use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Rolling file sink settings (`EGRESS_LOG_*`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileLog {
    dir: String,
    prefix: String,
    rotation: String,
}

impl FileLog {
    /// `None` unless `EGRESS_LOG_ROLL` is set to a truthy value.
    fn from_env() -> Option<Self> {
        if !env_bool("EGRESS_LOG_ROLL").unwrap_or(false) {
            return None;
        }
        Some(Self {
            dir: env_string("EGRESS_LOG_DIR").unwrap_or_else(|| "logs".into()),
            prefix: env_string("EGRESS_LOG_PREFIX").unwrap_or_else(|| "egress".into()),
            rotation: env_string("EGRESS_LOG_ROTATION")
                .map(|r| r.to_ascii_lowercase())
                .unwrap_or_else(|| "daily".into()),
        })
    }
}

/// Install the console subscriber (`RUST_LOG`, default `info`). With
/// `EGRESS_LOG_ROLL=1` a rolling file layer is added under `EGRESS_LOG_DIR`.
/// Safe to call more than once; only the first call installs anything.
pub fn init() {
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(env_filter()));
    let Some(file) = FileLog::from_env() else {
        let _ = registry.try_init();
        return;
    };

    let dir_ok = std::fs::create_dir_all(&file.dir).is_ok();
    let writer = match file.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&file.dir, &file.prefix),
        "minutely" => tracing_appender::rolling::minutely(&file.dir, &file.prefix),
        _ => tracing_appender::rolling::daily(&file.dir, &file.prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(env_filter());
    let _ = registry.with(file_layer).try_init();
    if !dir_ok {
        tracing::warn!(directory = %file.dir, "failed to create log directory");
    }
}
