//! Credential access
//!
//! Credential storage and token refresh live outside the engine. The sync
//! manager only needs to know which credentials exist and whether the
//! server still accepts them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::config::SessionConfig;
use crate::realtime::RealtimeScope;
use crate::remote::RemoteError;

/// What is stored locally right now
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub email: Option<String>,
    /// An authorization token is stored
    pub has_token: bool,
    /// Congregation (admin) credentials are stored
    pub admin: bool,
    /// Phone-territory credentials are stored
    pub phone: bool,
    pub congregation: Option<String>,
    /// The user is coming back from the verification flow
    pub back_from_verification: bool,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.email.is_some() && self.has_token
    }
}

/// Server verdict on the stored credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialCheck {
    Valid,
    UserLoginRequired,
    AdminLoginRequired,
    PhoneLoginRequired,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn session(&self) -> SessionSnapshot;

    async fn verify(&self) -> Result<CredentialCheck, RemoteError>;

    /// Realtime subscription scope for the current session
    ///
    /// `None` when no congregation is known.
    fn realtime_scope(&self) -> Option<RealtimeScope> {
        let session = self.session();
        let congregation = session.congregation.filter(|c| !c.is_empty() && c != "0")?;
        Some(RealtimeScope {
            congregation,
            user: session.email,
            admin: session.admin,
        })
    }
}

/// Credentials taken from the `[session]` table of the config file
pub struct StaticCredentials {
    session: RwLock<SessionConfig>,
    check: RwLock<CredentialCheck>,
    back_from_verification: AtomicBool,
}

impl StaticCredentials {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session: RwLock::new(session),
            check: RwLock::new(CredentialCheck::Valid),
            back_from_verification: AtomicBool::new(false),
        }
    }

    pub fn from_session(session: Option<&SessionConfig>) -> Self {
        Self::new(session.cloned().unwrap_or_default())
    }

    pub fn update(&self, session: SessionConfig) {
        if let Ok(mut current) = self.session.write() {
            *current = session;
        }
    }

    /// Verdict returned by [`CredentialProvider::verify`]
    pub fn set_check(&self, check: CredentialCheck) {
        if let Ok(mut current) = self.check.write() {
            *current = check;
        }
    }

    pub fn set_back_from_verification(&self, value: bool) {
        self.back_from_verification.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    fn session(&self) -> SessionSnapshot {
        let session = self
            .session
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        SessionSnapshot {
            has_token: present(&session.access_token),
            admin: present(&session.congregation) && present(&session.congregation_pass),
            phone: present(&session.phone_token),
            email: session.user_email.filter(|e| !e.is_empty()),
            congregation: session.congregation,
            back_from_verification: self.back_from_verification.load(Ordering::SeqCst),
        }
    }

    async fn verify(&self) -> Result<CredentialCheck, RemoteError> {
        Ok(self
            .check
            .read()
            .map(|check| *check)
            .unwrap_or(CredentialCheck::Valid))
    }
}
