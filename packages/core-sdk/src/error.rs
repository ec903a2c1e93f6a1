use thiserror::Error;

/**
 * \brief 自定义模型服务相关的错误分类。
 * \details 所有错误都直接呈现给用户，系统本身不做自动重试。
 */
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid settings: {0}")]
    InvalidForm(String),

    #[error("invalid server url `{url}`: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("no custom provider is configured")]
    NotConfigured,

    #[error("connection to {url} failed: {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("authentication failed ({status}): {message}")]
    AuthenticationFailed { status: u16, message: String },

    #[error("model invocation failed ({status}): {message}")]
    ModelInvocationFailed { status: u16, message: String },

    #[error("malformed response payload: {0}")]
    MalformedStream(String),

    #[error("credential store unavailable: {0}")]
    CredentialStoreUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

impl ProviderError {
    /**
     * \brief 面向用户的排查建议。
     */
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ProviderError::InvalidBaseUrl { .. } => {
                Some("use an absolute URL including the scheme, e.g. http://localhost:8000/v1")
            }
            ProviderError::NotConfigured => Some("run `openwork connect` to configure a provider"),
            ProviderError::ConnectionFailed { .. } => Some(
                "check the server is reachable: curl <server-url>/models; reverse proxies need a read timeout of at least 60s",
            ),
            ProviderError::AuthenticationFailed { .. } => Some(
                "verify the API key: curl -H \"Authorization: Bearer $KEY\" <server-url>/models",
            ),
            ProviderError::ModelInvocationFailed { .. } => {
                Some("check the model ID matches one listed by `openwork models` and inspect the server logs")
            }
            ProviderError::MalformedStream(_) => {
                Some("the server did not answer in the OpenAI chat-completion format; inspect the server logs")
            }
            ProviderError::CredentialStoreUnavailable(_) => {
                Some("the OS keychain could not be accessed; unlock it or re-enter the API key")
            }
            _ => None,
        }
    }

    /**
     * \brief 是否为远端服务侧的错误（用于 HTTP 状态映射）。
     */
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ProviderError::ConnectionFailed { .. }
                | ProviderError::ModelInvocationFailed { .. }
                | ProviderError::MalformedStream(_)
        )
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hints_cover_user_facing_failures() {
        let auth = ProviderError::AuthenticationFailed {
            status: 401,
            message: "bad key".into(),
        };
        assert!(auth.hint().unwrap().contains("Authorization"));
        assert!(!auth.is_upstream());

        let conn = ProviderError::ConnectionFailed {
            url: "http://localhost:1".into(),
            message: "refused".into(),
        };
        assert!(conn.is_upstream());
        assert!(conn.to_string().contains("http://localhost:1"));
        assert!(ProviderError::Config("x".into()).hint().is_none());
    }
}
