use std::collections::HashMap;

use async_trait::async_trait;
use tasklane_core::TokenGrant;
use tasklane_types::{Identity, UserDto};

/// Maps a bearer token to the identity it was issued for.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Identity>;
}

/// Verifier backed by a fixed token table from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new(grants: impl IntoIterator<Item = TokenGrant>) -> Self {
        let tokens = grants
            .into_iter()
            .map(|grant| {
                (
                    grant.token,
                    Identity {
                        sub: grant.sub,
                        email: grant.email,
                        sign_in_name: grant.sign_in_name,
                    },
                )
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

/// Request extension set by the auth gate for every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub identity: Identity,
    pub user: UserDto,
}

impl AuthedUser {
    pub fn id(&self) -> &str {
        &self.user.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_resolves_known_tokens_only() {
        let verifier = StaticTokenVerifier::new(vec![TokenGrant {
            token: "t-1".to_string(),
            sub: "u1".to_string(),
            email: "u1@example.com".to_string(),
            sign_in_name: "one".to_string(),
        }]);
        assert_eq!(verifier.len(), 1);
        let identity = verifier.verify("t-1").await.expect("identity");
        assert_eq!(identity.sub, "u1");
        assert!(verifier.verify("t-2").await.is_none());
    }
}
