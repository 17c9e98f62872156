//! Persistent token storage
//!
//! The discovery engine only ever reads from a store. Writes happen when a
//! caller learns a token some other way (pairing, manual entry) and wants it
//! remembered across restarts.

use super::Token;
use crate::error::{MiioError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Key-value store mapping device id to token
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Look up the stored token for a device
    async fn get(&self, id: &str) -> Result<Option<Token>>;

    /// Remember a token for a device
    async fn put(&self, id: &str, token: Token) -> Result<()>;
}

/// In-memory token store
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, Token>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: HashMap<String, Token>) -> Self {
        Self {
            tokens: RwLock::new(tokens),
        }
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, id: &str) -> Result<Option<Token>> {
        Ok(self.tokens.read().await.get(id).copied())
    }

    async fn put(&self, id: &str, token: Token) -> Result<()> {
        self.tokens.write().await.insert(id.to_string(), token);
        Ok(())
    }
}

/// JSON file backed token store.
///
/// The file is read on first access and rewritten on every `put`.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    tokens: RwLock<Option<HashMap<String, Token>>>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tokens: RwLock::new(None),
        }
    }

    /// Store located in the user's data directory
    pub fn default_location() -> Result<Self> {
        let path = default_token_path()
            .ok_or_else(|| MiioError::token_store("no data directory for this platform"))?;
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, Token>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let tokens: HashMap<String, Token> = serde_json::from_str(&contents)?;
                info!(
                    "Loaded {} tokens from {}",
                    tokens.len(),
                    self.path.display()
                );
                Ok(tokens)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No token file at {}", self.path.display());
                Ok(HashMap::new())
            }
            Err(e) => Err(MiioError::token_store(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn save(&self, tokens: &HashMap<String, Token>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string_pretty(tokens)?;
        tokio::fs::write(&self.path, serialized).await?;
        debug!("Saved {} tokens to {}", tokens.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, id: &str) -> Result<Option<Token>> {
        if let Some(tokens) = self.tokens.read().await.as_ref() {
            return Ok(tokens.get(id).copied());
        }

        let mut guard = self.tokens.write().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard.as_ref().and_then(|tokens| tokens.get(id).copied()))
    }

    async fn put(&self, id: &str, token: Token) -> Result<()> {
        let mut guard = self.tokens.write().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        let tokens = guard.get_or_insert_with(HashMap::new);
        tokens.insert(id.to_string(), token);
        self.save(tokens).await
    }
}

/// Default token file: `<data dir>/miio/tokens.json`
pub fn default_token_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("miio").join("tokens.json"))
}
