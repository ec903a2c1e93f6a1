use std::path::PathBuf;
use std::time::Duration;

use crate::config;
use crate::credentials::DEFAULT_SERVICE;
use crate::error::{ProviderError, Result};
use crate::llm::DEFAULT_TIMEOUT;

/**
 * \brief 应用级设置，来自 `OPENWORK_*` 环境变量，命令行参数可再覆盖。
 */
#[derive(Debug, Clone)]
pub struct AppSettings {
    /** \brief opencode.json 路径 */
    pub config_path: PathBuf,
    /** \brief 钥匙串服务名 */
    pub keychain_service: String,
    /** \brief 日志目录 */
    pub log_dir: PathBuf,
    /** \brief 是否写入日志文件 */
    pub telemetry_enabled: bool,
    /** \brief 请求读超时 */
    pub request_timeout: Duration,
    /** \brief `serve` 使用的静态前端目录 */
    pub ui_dir: PathBuf,
}

impl AppSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 以任意键值来源构造，便于测试。
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config_path = match var("OPENWORK_CONFIG_PATH") {
            Some(path) => PathBuf::from(path),
            None => config::default_path()?,
        };
        let keychain_service =
            var("OPENWORK_KEYCHAIN_SERVICE").unwrap_or_else(|| DEFAULT_SERVICE.to_string());
        // 引用格式为 keychain:<service>/<account>，服务名里不能有 '/'
        if keychain_service.contains('/') {
            return Err(ProviderError::Config(format!(
                "OPENWORK_KEYCHAIN_SERVICE must not contain '/': {}",
                keychain_service
            )));
        }
        let log_dir = var("OPENWORK_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_log_dir);
        let telemetry_enabled = var("OPENWORK_TELEMETRY")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let request_timeout = match var("OPENWORK_REQUEST_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    tracing::warn!(value = %raw, "ignoring invalid OPENWORK_REQUEST_TIMEOUT_SECS");
                    DEFAULT_TIMEOUT
                }
            },
            None => DEFAULT_TIMEOUT,
        };
        let ui_dir = var("OPENWORK_UI_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("web"));

        Ok(Self {
            config_path,
            keychain_service,
            log_dir,
            telemetry_enabled,
            request_timeout,
            ui_dir,
        })
    }
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("Openwork").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}
