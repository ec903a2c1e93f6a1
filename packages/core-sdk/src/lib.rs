pub mod config;
pub mod credentials;
pub mod error;
pub mod form;
pub mod llm;
pub mod models;
pub mod server;
pub mod settings;
pub mod telemetry;

pub use error::{ProviderError, Result};

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::{self, ConfigGenerator};
    pub use crate::credentials::{CredentialStore, KeyringStore, MemoryStore};
    pub use crate::error::ProviderError;
    pub use crate::form::{self, SettingsForm};
    pub use crate::llm::{self, RequestRouter};
    pub use crate::models::{ApiKeyRef, ChatReply, Message, ProviderProfile};
    pub use crate::server;
    pub use crate::settings::AppSettings;
    pub use crate::telemetry;
}
