use std::fmt;
use std::path::PathBuf;

use reqwest::Url;
use serde::Deserialize;

use crate::config::ConfigGenerator;
use crate::credentials::CredentialStore;
use crate::error::{ProviderError, Result};
use crate::models::{ProviderProfile, ResolvedProvider};

/**
 * \brief 设置表单的四个字段：Provider Name / Server URL / API Key / Model ID。
 */
#[derive(Clone, Default, Deserialize)]
pub struct SettingsForm {
    pub provider_name: String,
    pub server_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model_id: String,
}

impl fmt::Debug for SettingsForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsForm")
            .field("provider_name", &self.provider_name)
            .field("server_url", &self.server_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model_id", &self.model_id)
            .finish()
    }
}

/**
 * \brief 校验通过的表单；空白密钥已归一为 `None`。
 */
#[derive(Clone)]
pub struct ValidatedForm {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_id: String,
}

impl fmt::Debug for ValidatedForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedForm")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl ValidatedForm {
    /**
     * \brief 不经过凭据库与配置文件，直接用于连接测试。
     */
    pub fn into_resolved(self) -> ResolvedProvider {
        ResolvedProvider {
            name: self.name,
            base_url: self.base_url,
            model_id: self.model_id,
            api_key: self.api_key,
        }
    }
}

impl SettingsForm {
    pub fn new(
        provider_name: impl Into<String>,
        server_url: impl Into<String>,
        api_key: Option<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            server_url: server_url.into(),
            api_key,
            model_id: model_id.into(),
        }
    }

    /**
     * \brief 校验表单；只有 Server URL 做格式检查，且不发起任何网络请求。
     */
    pub fn validate(&self) -> Result<ValidatedForm> {
        let name = self.provider_name.trim();
        if name.is_empty() {
            return Err(ProviderError::InvalidForm(
                "provider name must not be empty".into(),
            ));
        }
        let model_id = self.model_id.trim();
        if model_id.is_empty() {
            return Err(ProviderError::InvalidForm("model ID must not be empty".into()));
        }
        let base_url = validate_base_url(&self.server_url)?;
        let api_key = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        Ok(ValidatedForm {
            name: name.to_string(),
            base_url,
            api_key,
            model_id: model_id.to_string(),
        })
    }
}

/**
 * \brief 要求带 http/https scheme 与主机名的绝对地址；路径原样保留。
 */
pub fn validate_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let invalid = |reason: &str| ProviderError::InvalidBaseUrl {
        url: trimmed.to_string(),
        reason: reason.to_string(),
    };
    if trimmed.is_empty() {
        return Err(invalid("server URL must not be empty"));
    }
    let parsed = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        _ => return Err(invalid("missing http:// or https:// scheme")),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(trimmed.to_string())
}

/**
 * \brief 点击 "Connect" 后的结果。
 */
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub profile: ProviderProfile,
    pub config_path: PathBuf,
    /** \brief 被替换掉的旧 Provider 名称 */
    pub replaced: Option<String>,
}

/**
 * \brief 提交表单：写入凭据库（如有密钥），再整体覆盖配置文件。
 */
pub fn connect(
    form: &SettingsForm,
    store: &dyn CredentialStore,
    generator: &ConfigGenerator,
) -> Result<ConnectOutcome> {
    let validated = form.validate()?;

    let previous = match generator.load() {
        Ok(previous) => previous,
        Err(err) => {
            tracing::warn!(target: "openwork::form", error = %err, "ignoring unreadable previous configuration");
            None
        }
    };

    let api_key_ref = match validated.api_key.as_deref() {
        Some(secret) => Some(store.store(&validated.name, secret)?),
        None => {
            // 无密钥提交时清理同名旧密钥，失败不影响连接
            if let Err(err) = store.delete(&store.key_ref(&validated.name)) {
                tracing::warn!(target: "openwork::form", error = %err, "could not clear stale api key");
            }
            None
        }
    };

    let profile = ProviderProfile {
        name: validated.name,
        base_url: validated.base_url,
        model_id: validated.model_id,
        api_key_ref,
    };
    let config_path = generator.render(&profile)?;

    let replaced = previous.map(|old| old.name).filter(|old| *old != profile.name);
    if let Some(old_name) = replaced.as_deref() {
        if let Err(err) = store.delete(&store.key_ref(old_name)) {
            tracing::warn!(target: "openwork::form", provider = %old_name, error = %err, "could not remove replaced provider key");
        }
    }

    tracing::info!(
        target: "openwork::form",
        provider = %profile.name,
        base_url = %profile.base_url,
        model = %profile.model_id,
        has_api_key = profile.api_key_ref.is_some(),
        "connected custom provider"
    );

    Ok(ConnectOutcome {
        profile,
        config_path,
        replaced,
    })
}

/**
 * \brief 断开：删除密钥与配置文件；未配置时返回 `None`。
 * \details 配置文件损坏时无法定位密钥，仍然删除文件以便重新连接。
 */
pub fn disconnect(
    store: &dyn CredentialStore,
    generator: &ConfigGenerator,
) -> Result<Option<ProviderProfile>> {
    let profile = match generator.load() {
        Ok(profile) => profile,
        Err(err) => {
            tracing::warn!(target: "openwork::form", error = %err, "removing unreadable configuration, api key left in place");
            None
        }
    };
    if let Some(profile) = profile.as_ref() {
        let key_ref = profile
            .api_key_ref
            .clone()
            .unwrap_or_else(|| store.key_ref(&profile.name));
        store.delete(&key_ref)?;
    }
    generator.remove()?;
    if let Some(profile) = profile.as_ref() {
        tracing::info!(target: "openwork::form", provider = %profile.name, "disconnected custom provider");
    }
    Ok(profile)
}
