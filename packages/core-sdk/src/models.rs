use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/** \brief 配置文件中使用的适配器标识。 */
pub const ADAPTER_ID: &str = "openai-compatible";

/** \brief 适配器对应的 npm 包名，由 OpenCode 运行时加载。 */
pub const ADAPTER_NPM: &str = "@ai-sdk/openai-compatible";

const KEYCHAIN_SCHEME: &str = "keychain:";

/**
 * \brief 指向系统凭据库中密钥的间接引用。
 * \details 文本形式为 `keychain:<service>/<account>`，永远不包含密钥本身。
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiKeyRef {
    /** \brief 凭据库服务名 */
    pub service: String,
    /** \brief 账户名，即 Provider 名称 */
    pub account: String,
}

impl ApiKeyRef {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }
}

impl fmt::Display for ApiKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", KEYCHAIN_SCHEME, self.service, self.account)
    }
}

impl FromStr for ApiKeyRef {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(KEYCHAIN_SCHEME)
            .ok_or_else(|| ProviderError::Config(format!("unsupported apiKeyRef: {}", s)))?;
        // 账户名可能包含 '/'，服务名不会
        let (service, account) = rest
            .split_once('/')
            .ok_or_else(|| ProviderError::Config(format!("malformed apiKeyRef: {}", s)))?;
        if service.is_empty() || account.is_empty() {
            return Err(ProviderError::Config(format!("malformed apiKeyRef: {}", s)));
        }
        Ok(ApiKeyRef::new(service, account))
    }
}

impl Serialize for ApiKeyRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ApiKeyRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/**
 * \brief 当前生效的自定义 Provider 配置。
 * \details 同一时间只有一个自定义 Provider；配置中只保存密钥引用。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    /** \brief Provider 显示名称 */
    pub name: String,
    /** \brief API 基地址，路径部分（如 `/v1`）由用户决定 */
    pub base_url: String,
    /** \brief 模型 ID，不与远端列表校验 */
    pub model_id: String,
    /** \brief 凭据引用（未提供密钥时为空） */
    pub api_key_ref: Option<ApiKeyRef>,
}

impl ProviderProfile {
    /**
     * \brief 拼接端点地址，只去掉基地址末尾的 `/`。
     */
    pub fn endpoint(&self, path: &str) -> String {
        join_endpoint(&self.base_url, path)
    }
}

pub(crate) fn join_endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/**
 * \brief 已解析密钥、可直接发起请求的 Provider。
 */
#[derive(Clone)]
pub struct ResolvedProvider {
    pub name: String,
    pub base_url: String,
    pub model_id: String,
    pub api_key: Option<String>,
}

impl ResolvedProvider {
    pub fn endpoint(&self, path: &str) -> String {
        join_endpoint(&self.base_url, path)
    }
}

impl fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model_id", &self.model_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }
}

/**
 * \brief 一次完整的助手回复；流式结果重组后与非流式结果一致。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub content: String,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_ref_text_form() {
        let r = ApiKeyRef::new("openwork", "my/vllm");
        let text = r.to_string();
        assert_eq!(text, "keychain:openwork/my/vllm");
        let parsed: ApiKeyRef = text.parse().expect("parse ref");
        assert_eq!(parsed, r);

        assert!("env:KEY".parse::<ApiKeyRef>().is_err());
        assert!("keychain:openwork".parse::<ApiKeyRef>().is_err());
        assert!("keychain:/acct".parse::<ApiKeyRef>().is_err());
    }

    #[test]
    fn test_endpoint_keeps_caller_path() {
        let profile = ProviderProfile {
            name: "local".into(),
            base_url: "http://localhost:8000/v1/".into(),
            model_id: "m".into(),
            api_key_ref: None,
        };
        assert_eq!(
            profile.endpoint("chat/completions"),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(
            join_endpoint("http://host:1234", "/models"),
            "http://host:1234/models"
        );
    }

    #[test]
    fn test_resolved_provider_debug_hides_key() {
        let p = ResolvedProvider {
            name: "n".into(),
            base_url: "http://x".into(),
            model_id: "m".into(),
            api_key: Some("sk-secret".into()),
        };
        let dbg = format!("{:?}", p);
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
