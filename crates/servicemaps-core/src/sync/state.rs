//! Startup state

use std::fmt;

use serde::Serialize;

/// Which top-level mode the app should present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StartupState {
    /// Not evaluated yet
    Unknown,
    /// No stored credentials
    Welcome,
    Login,
    AdminLogin,
    PhoneLogin,
    /// Account not verified yet
    Validate,
    /// First sync still running
    Loading,
    /// Signed in with nothing to show
    Empty,
    Ready,
}

impl StartupState {
    /// `Ready` and `Empty` hold until the next explicit trigger
    pub fn is_stable(self) -> bool {
        matches!(self, StartupState::Ready | StartupState::Empty)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StartupState::Unknown => "unknown",
            StartupState::Welcome => "welcome",
            StartupState::Login => "login",
            StartupState::AdminLogin => "admin-login",
            StartupState::PhoneLogin => "phone-login",
            StartupState::Validate => "validate",
            StartupState::Loading => "loading",
            StartupState::Empty => "empty",
            StartupState::Ready => "ready",
        }
    }
}

impl fmt::Display for StartupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
