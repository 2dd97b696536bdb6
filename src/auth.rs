//! Shared-secret and allow-list authorization

use subtle::ConstantTimeEq;

/// Stateless request authorization against the shared token and user list
#[derive(Clone)]
pub struct AuthGuard {
    token: String,
    users: Vec<String>,
}

impl AuthGuard {
    pub fn new(token: impl Into<String>, users: Vec<String>) -> Self {
        Self {
            token: token.into(),
            users,
        }
    }

    /// True iff `candidate` equals the shared token. The byte comparison
    /// runs in constant time; only the length check short-circuits.
    pub fn validate_token(&self, candidate: &str) -> bool {
        if candidate.len() != self.token.len() {
            return false;
        }
        bool::from(candidate.as_bytes().ct_eq(self.token.as_bytes()))
    }

    /// True iff `candidate` is in the allow-list
    pub fn validate_user(&self, candidate: &str) -> bool {
        self.users.iter().any(|user| user == candidate)
    }

    /// Both checks must pass. Callers answer 401 on `false`.
    pub fn assert_permission(&self, token: &str, user: &str) -> bool {
        // Evaluate both so the user check is not skipped on a bad token
        let token_ok = self.validate_token(token);
        let user_ok = self.validate_user(user);
        token_ok && user_ok
    }

    /// The shared token, needed to build redirect and base URLs
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for AuthGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGuard")
            .field("token", &"<redacted>")
            .field("users", &self.users)
            .finish()
    }
}
