use tokio::sync::RwLock;

/// Access + refresh token issued by the backend's auth flow. Both halves are
/// opaque to the client; expiry is discovered reactively through a rejected
/// request, never tracked locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

/// Process-wide credential store. All credential mutation funnels through
/// `set`/`clear`; readers take a clone of the current pair.
#[derive(Debug, Default)]
pub struct SessionStore {
    tokens: RwLock<Option<TokenPair>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<TokenPair> {
        self.tokens.read().await.clone()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.tokens.read().await.as_ref().map(|pair| pair.access.clone())
    }

    pub async fn set(&self, pair: TokenPair) {
        *self.tokens.write().await = Some(pair);
    }

    pub async fn clear(&self) {
        *self.tokens.write().await = None;
    }

    pub async fn is_authenticated(&self) -> bool {
        self.tokens.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_replaces_and_clear_destroys_the_pair() {
        let store = SessionStore::new();
        assert!(!store.is_authenticated().await);

        store.set(TokenPair::new("a1", "r1")).await;
        assert_eq!(store.access_token().await.as_deref(), Some("a1"));

        store.set(TokenPair::new("a2", "r2")).await;
        assert_eq!(store.get().await, Some(TokenPair::new("a2", "r2")));

        store.clear().await;
        assert_eq!(store.get().await, None);
    }
}
