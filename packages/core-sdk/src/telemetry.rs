use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::{Lazy, OnceCell};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::filter_fn, fmt, prelude::*, EnvFilter};

static TELEMETRY_ENABLED: Lazy<std::sync::RwLock<bool>> =
    Lazy::new(|| std::sync::RwLock::new(false));

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/** \brief 日志级别覆盖变量，语法同 `RUST_LOG`。 */
pub const LOG_ENV: &str = "OPENWORK_LOG";

/** \brief 日志文件名。 */
pub const LOG_FILE: &str = "openwork.log";

/**
 * \brief 安装全局 tracing 订阅者：stderr 输出，遥测开启时追加写入日志文件。
 * \param log_dir 日志目录
 * \param enabled 是否开启文件日志
 * \param default_level 未设置 `OPENWORK_LOG` 时的级别
 */
pub fn init(log_dir: &Path, enabled: bool, default_level: &str) -> Result<()> {
    set_enabled(enabled);
    let env_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    // 文件层只在启动时开启遥测才安装；安装后 set_enabled 可暂停或恢复写入
    let file_layer = if enabled {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("create log dir {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter_fn(|_| is_enabled())),
        )
    } else {
        None
    };

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

/**
 * \brief 更新遥测开关状态；未安装文件层时开启无效。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 当前是否真的在写日志文件。
 */
pub fn is_enabled() -> bool {
    FILE_GUARD.get().is_some() && TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    tracing::info!(target: "openwork::telemetry", category, "{}", message);
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    tracing::error!(target: "openwork::telemetry", category, "{}", message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_toggle_and_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        // 文件层未安装前开关不生效
        set_enabled(true);
        assert!(!is_enabled());

        init(&logs, true, "info").expect("first init");
        assert!(logs.is_dir());
        assert!(is_enabled());

        init(&logs, false, "info").expect("second init is a no-op");
        assert!(!is_enabled());
        set_enabled(true);
        assert!(is_enabled());
        log_event("test", "hello");
        log_error("test", "boom");
        set_enabled(false);
    }
}
