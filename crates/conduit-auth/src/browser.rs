//! Launching the system browser for user authorization.

use crate::error::{AuthError, AuthResult};

/// Opens authorization URLs for the user.
#[cfg_attr(test, mockall::automock)]
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> AuthResult<()>;
}

/// Opens URLs with the platform default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> AuthResult<()> {
        open::that(url).map_err(|e| AuthError::Browser(e.to_string()))
    }
}
