use anyhow::Result;
use async_trait::async_trait;

/// Issues short-lived access tokens for the upstream git host. Private
/// chart clones, commit statuses, and observer fetches all authenticate
/// through this seam; app-based token issuance lives behind it in a
/// separate integration.
#[async_trait]
pub trait TokenManager: Send + Sync + 'static {
    /// Returns `(token, user)`.
    async fn token(&self) -> Result<(String, String)>;
}

/// Serves a configured long-lived token (a PAT or a deploy token).
pub struct StaticTokenManager {
    token: String,
    user: String,
}

impl StaticTokenManager {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into(), user: "oauth2".to_string() }
    }
}

#[async_trait]
impl TokenManager for StaticTokenManager {
    async fn token(&self) -> Result<(String, String)> {
        Ok((self.token.clone(), self.user.clone()))
    }
}
