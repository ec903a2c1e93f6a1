use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, Result};
use crate::models::{ApiKeyRef, ProviderProfile, ADAPTER_ID, ADAPTER_NPM};

const SCHEMA_URL: &str = "https://opencode.ai/config.json";

#[derive(Debug, Serialize, Deserialize)]
struct OpencodeConfig {
    #[serde(rename = "$schema", default)]
    schema: String,
    #[serde(default)]
    provider: BTreeMap<String, ProviderEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderEntry {
    npm: String,
    #[serde(default)]
    adapter: String,
    name: String,
    options: ProviderOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_key_ref: Option<ApiKeyRef>,
    #[serde(default)]
    models: BTreeMap<String, ModelEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProviderOptions {
    #[serde(rename = "baseURL")]
    base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelEntry {
    name: String,
}

impl ProviderEntry {
    fn is_openai_compatible(&self) -> bool {
        self.adapter == ADAPTER_ID || self.npm == ADAPTER_NPM
    }
}

/**
 * \brief 生成供 OpenCode 适配层读取的 opencode.json。
 * \details 每次写入整体覆盖文件，保证只有一个自定义 Provider 生效。
 */
#[derive(Debug, Clone)]
pub struct ConfigGenerator {
    path: PathBuf,
}

impl ConfigGenerator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /**
     * \brief 使用平台默认路径。
     */
    pub fn with_default_path() -> Result<Self> {
        Ok(Self::new(default_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /**
     * \brief 渲染配置文件并返回写入路径；文件中只有密钥引用，没有密钥。
     */
    pub fn render(&self, profile: &ProviderProfile) -> Result<PathBuf> {
        let mut models = BTreeMap::new();
        models.insert(
            profile.model_id.clone(),
            ModelEntry {
                name: profile.model_id.clone(),
            },
        );
        let mut provider = BTreeMap::new();
        provider.insert(
            profile.name.clone(),
            ProviderEntry {
                npm: ADAPTER_NPM.to_string(),
                adapter: ADAPTER_ID.to_string(),
                name: profile.name.clone(),
                options: ProviderOptions {
                    base_url: profile.base_url.clone(),
                },
                api_key_ref: profile.api_key_ref.clone(),
                models,
            },
        );
        let doc = OpencodeConfig {
            schema: SCHEMA_URL.to_string(),
            provider,
            model: Some(format!("{}/{}", profile.name, profile.model_id)),
        };

        let body = serde_json::to_string_pretty(&doc)?;
        write_atomic(&self.path, body.as_bytes())?;
        tracing::info!(
            target: "openwork::config",
            path = %self.path.display(),
            provider = %profile.name,
            model = %profile.model_id,
            "rendered provider configuration"
        );
        Ok(self.path.clone())
    }

    /**
     * \brief 读取当前生效的 Provider；文件不存在时返回 `None`。
     */
    pub fn load(&self) -> Result<Option<ProviderProfile>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let doc: OpencodeConfig = serde_json::from_str(&content).map_err(|e| {
            ProviderError::Config(format!("failed to parse {}: {}", self.path.display(), e))
        })?;

        let Some((key, entry)) = doc
            .provider
            .iter()
            .find(|(_, entry)| entry.is_openai_compatible())
        else {
            return Ok(None);
        };

        let model_id = doc
            .model
            .as_deref()
            .and_then(|m| m.strip_prefix(key.as_str()))
            .and_then(|m| m.strip_prefix('/'))
            .map(str::to_string)
            .or_else(|| entry.models.keys().next().cloned())
            .ok_or_else(|| {
                ProviderError::Config(format!("provider `{}` has no model configured", key))
            })?;

        Ok(Some(ProviderProfile {
            name: entry.name.clone(),
            base_url: entry.options.base_url.clone(),
            model_id,
            api_key_ref: entry.api_key_ref.clone(),
        }))
    }

    /**
     * \brief 删除配置文件；返回文件此前是否存在。
     */
    pub fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::info!(target: "openwork::config", path = %self.path.display(), "removed provider configuration");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/**
 * \brief 平台相关的固定路径：
 * macOS `~/Library/Application Support/Openwork/opencode/opencode.json`，
 * Windows `%APPDATA%/Openwork/opencode/opencode.json`，
 * Linux `$XDG_CONFIG_HOME/Openwork/opencode/opencode.json`。
 */
pub fn default_path() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| ProviderError::Config("cannot determine the user config directory".into()))?;
    Ok(base.join("Openwork").join("opencode").join("opencode.json"))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}
