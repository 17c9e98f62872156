//! Token resolution policy
//!
//! Priority: a real token on the wire, then the persistent store, then the
//! manually configured map. Store failures and slow lookups degrade to the
//! next source and are only logged.

use super::{Token, TokenStore};
use crate::error::MiioError;
use crate::packet::CHECKSUM_LEN;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Grace window for a single token store lookup
pub const TOKEN_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Token chosen for a service record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenResolution {
    pub token: Option<Token>,
    /// True when the token was read from the wire
    pub auto_token: bool,
}

/// Decides which token to attach to a discovered device
#[derive(Clone)]
pub struct TokenResolver {
    store: Option<Arc<dyn TokenStore>>,
    manual: HashMap<String, Token>,
    lookup_timeout: Duration,
}

impl TokenResolver {
    pub fn new(store: Option<Arc<dyn TokenStore>>, manual: HashMap<String, Token>) -> Self {
        Self {
            store,
            manual,
            lookup_timeout: TOKEN_LOOKUP_TIMEOUT,
        }
    }

    /// Resolve the token for `id` given the checksum field of its reply
    pub async fn resolve(&self, id: &str, field: &[u8; CHECKSUM_LEN]) -> TokenResolution {
        if let Some(token) = Token::from_wire(field) {
            return TokenResolution {
                token: Some(token),
                auto_token: true,
            };
        }

        let token = match self.stored_token(id).await {
            Some(token) => Some(token),
            None => self.manual.get(id).copied(),
        };

        TokenResolution {
            token,
            auto_token: false,
        }
    }

    async fn stored_token(&self, id: &str) -> Option<Token> {
        let store = self.store.as_ref()?;

        let result = match timeout(self.lookup_timeout, store.get(id)).await {
            Ok(result) => result,
            Err(_) => Err(MiioError::timeout(format!(
                "token lookup gave no answer within {:?}",
                self.lookup_timeout
            ))),
        };

        match result {
            Ok(token) => {
                debug!(device = id, found = token.is_some(), "Token store lookup");
                token
            }
            Err(e) => {
                warn!(device = id, error_type = e.error_type(), "Token store lookup failed: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for TokenResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResolver")
            .field("store", &self.store.is_some())
            .field("manual", &self.manual.len())
            .field("lookup_timeout", &self.lookup_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MiioError, Result};
    use crate::tokens::MemoryTokenStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    const WIRE: &str = "00112233445566778899aabbccddeeff";
    const STORED: &str = "0102030405060708090a0b0c0d0e0f10";
    const MANUAL: &str = "a0a1a2a3a4a5a6a7a8a9aaabacadaeaf";

    fn token(hex: &str) -> Token {
        hex.parse().unwrap()
    }

    fn field(hex: &str) -> [u8; 16] {
        *token(hex).as_bytes()
    }

    fn manual() -> HashMap<String, Token> {
        HashMap::from([("7".to_string(), token(MANUAL))])
    }

    fn store() -> Arc<dyn TokenStore> {
        Arc::new(MemoryTokenStore::with_tokens(HashMap::from([(
            "7".to_string(),
            token(STORED),
        )])))
    }

    struct FailingStore;

    #[async_trait]
    impl TokenStore for FailingStore {
        async fn get(&self, _id: &str) -> Result<Option<Token>> {
            Err(MiioError::token_store("disk on fire"))
        }

        async fn put(&self, _id: &str, _token: Token) -> Result<()> {
            Ok(())
        }
    }

    struct HangingStore;

    #[async_trait]
    impl TokenStore for HangingStore {
        async fn get(&self, _id: &str) -> Result<Option<Token>> {
            std::future::pending().await
        }

        async fn put(&self, _id: &str, _token: Token) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_wire_token_wins() {
        let resolver = TokenResolver::new(Some(store()), manual());
        let resolution = resolver.resolve("7", &field(WIRE)).await;
        assert_eq!(
            resolution,
            TokenResolution {
                token: Some(token(WIRE)),
                auto_token: true
            }
        );
    }

    #[tokio::test]
    async fn test_stored_token_before_manual() {
        let resolver = TokenResolver::new(Some(store()), manual());
        let resolution = resolver.resolve("7", &[0xff; 16]).await;
        assert_eq!(resolution.token, Some(token(STORED)));
        assert!(!resolution.auto_token);
    }

    #[tokio::test]
    async fn test_manual_token_without_store() {
        let resolver = TokenResolver::new(None, manual());
        let resolution = resolver.resolve("7", &[0x00; 16]).await;
        assert_eq!(resolution.token, Some(token(MANUAL)));
        assert!(!resolution.auto_token);
    }

    #[tokio::test]
    async fn test_manual_token_when_store_misses() {
        let empty: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
        let resolver = TokenResolver::new(Some(empty), manual());
        let resolution = resolver.resolve("7", &[0xff; 16]).await;
        assert_eq!(resolution.token, Some(token(MANUAL)));
    }

    #[tokio::test]
    async fn test_no_token_anywhere() {
        let resolver = TokenResolver::new(Some(store()), manual());
        let resolution = resolver.resolve("8", &[0xff; 16]).await;
        assert_eq!(
            resolution,
            TokenResolution {
                token: None,
                auto_token: false
            }
        );
    }

    #[tokio::test]
    async fn test_failing_store_falls_back_to_manual() {
        let resolver = TokenResolver::new(Some(Arc::new(FailingStore)), manual());
        let resolution = resolver.resolve("7", &[0xff; 16]).await;
        assert_eq!(resolution.token, Some(token(MANUAL)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out() {
        let resolver = TokenResolver::new(Some(Arc::new(HangingStore)), manual());
        let resolution = resolver.resolve("7", &[0xff; 16]).await;
        assert_eq!(resolution.token, Some(token(MANUAL)));
        assert!(!resolution.auto_token);
    }
}
