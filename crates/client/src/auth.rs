//! Credential lookup consumed by the connection manager.

/// Identity attached to every connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub token: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

/// Read-only source of the current user's credentials.
///
/// Consulted on every connect and reconnect attempt, so a refreshed token
/// is picked up without restarting the manager.
pub trait AuthLookup: Send + Sync {
    fn credentials(&self) -> Option<Credentials>;
}

impl<F> AuthLookup for F
where
    F: Fn() -> Option<Credentials> + Send + Sync,
{
    fn credentials(&self) -> Option<Credentials> {
        self()
    }
}

/// Fixed credentials, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    credentials: Option<Credentials>,
}

impl StaticAuth {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            credentials: Some(Credentials::new(user_id, token)),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl AuthLookup for StaticAuth {
    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }
}
