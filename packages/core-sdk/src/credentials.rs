use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use keyring::Entry;

use crate::error::{ProviderError, Result};
use crate::models::ApiKeyRef;

/** \brief 默认的系统凭据库服务名。 */
pub const DEFAULT_SERVICE: &str = "openwork";

/**
 * \brief 凭据存储适配器：密钥只进入安全存储，不写入配置文件。
 */
pub trait CredentialStore: Send + Sync {
    /**
     * \brief 以 Provider 名称为键写入密钥，返回引用。
     */
    fn store(&self, profile_name: &str, secret: &str) -> Result<ApiKeyRef>;

    /**
     * \brief 读取引用对应的密钥；条目不存在时返回 `None`。
     */
    fn resolve(&self, key_ref: &ApiKeyRef) -> Result<Option<String>>;

    /**
     * \brief 删除条目；不存在视为成功。
     */
    fn delete(&self, key_ref: &ApiKeyRef) -> Result<()>;

    /**
     * \brief 该存储为某个 Provider 生成的引用。
     */
    fn key_ref(&self, profile_name: &str) -> ApiKeyRef;
}

/**
 * \brief 基于操作系统钥匙串（macOS Keychain / Windows Credential Manager / Secret Service）的实现。
 */
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key_ref: &ApiKeyRef) -> Result<Entry> {
        Entry::new(&key_ref.service, &key_ref.account).map_err(unavailable)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

fn unavailable(err: keyring::Error) -> ProviderError {
    ProviderError::CredentialStoreUnavailable(err.to_string())
}

impl CredentialStore for KeyringStore {
    fn store(&self, profile_name: &str, secret: &str) -> Result<ApiKeyRef> {
        let key_ref = self.key_ref(profile_name);
        self.entry(&key_ref)?
            .set_password(secret)
            .map_err(unavailable)?;
        tracing::info!(target: "openwork::credentials", key_ref = %key_ref, "stored api key in keychain");
        Ok(key_ref)
    }

    fn resolve(&self, key_ref: &ApiKeyRef) -> Result<Option<String>> {
        match self.entry(key_ref)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(unavailable(err)),
        }
    }

    fn delete(&self, key_ref: &ApiKeyRef) -> Result<()> {
        match self.entry(key_ref)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                tracing::debug!(target: "openwork::credentials", key_ref = %key_ref, "removed keychain entry");
                Ok(())
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    fn key_ref(&self, profile_name: &str) -> ApiKeyRef {
        ApiKeyRef::new(&self.service, profile_name)
    }
}

/**
 * \brief 进程内存中的凭据存储，用于测试或自行管理密钥的嵌入方。
 */
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    service: String,
    inner: Arc<Mutex<HashMap<ApiKeyRef, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            inner: Arc::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ApiKeyRef, String>>> {
        self.inner
            .lock()
            .map_err(|_| ProviderError::CredentialStoreUnavailable("memory store poisoned".into()))
    }
}

impl CredentialStore for MemoryStore {
    fn store(&self, profile_name: &str, secret: &str) -> Result<ApiKeyRef> {
        let key_ref = self.key_ref(profile_name);
        self.lock()?.insert(key_ref.clone(), secret.to_string());
        Ok(key_ref)
    }

    fn resolve(&self, key_ref: &ApiKeyRef) -> Result<Option<String>> {
        Ok(self.lock()?.get(key_ref).cloned())
    }

    fn delete(&self, key_ref: &ApiKeyRef) -> Result<()> {
        self.lock()?.remove(key_ref);
        Ok(())
    }

    fn key_ref(&self, profile_name: &str) -> ApiKeyRef {
        let service = if self.service.is_empty() {
            DEFAULT_SERVICE
        } else {
            &self.service
        };
        ApiKeyRef::new(service, profile_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip_and_delete() {
        let store = MemoryStore::new();
        let key_ref = store.store("vllm", "sk-1").expect("store");
        assert_eq!(key_ref.to_string(), "keychain:openwork/vllm");
        assert_eq!(store.resolve(&key_ref).unwrap().as_deref(), Some("sk-1"));

        store.store("vllm", "sk-2").expect("overwrite");
        assert_eq!(store.len(), 1);
        assert_eq!(store.resolve(&key_ref).unwrap().as_deref(), Some("sk-2"));

        store.delete(&key_ref).expect("delete");
        store.delete(&key_ref).expect("delete missing is ok");
        assert!(store.resolve(&key_ref).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_default_memory_store_still_uses_service_name() {
        let store = MemoryStore::default();
        assert_eq!(store.key_ref("x").service, DEFAULT_SERVICE);
    }

    #[test]
    fn test_keyring_store_refs_use_configured_service() {
        let store = KeyringStore::new("openwork-test");
        let r = store.key_ref("local");
        assert_eq!(r.service, "openwork-test");
        assert_eq!(r.account, "local");
    }
}
