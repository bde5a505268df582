//! User interaction hooks
//!
//! The engine asks the host for a password or for confirmation of the
//! server settings through [`Prompt`]. [`Headless`] answers without a user.

use crate::server::ServerSettings;

pub trait Prompt: Send + Sync {
    /// Ask for the session password, `None` if the user declined
    fn request_password(&self) -> Option<String>;

    /// Let the user review the settings before hosting, `false` cancels
    fn confirm_server_settings(&self, settings: &mut ServerSettings) -> bool;

    /// The connection to the server was lost
    fn session_lost(&self) {}
}

/// Non-interactive prompt: no password, settings accepted as given
#[derive(Debug, Clone, Copy, Default)]
pub struct Headless;

impl Prompt for Headless {
    fn request_password(&self) -> Option<String> {
        None
    }

    fn confirm_server_settings(&self, _settings: &mut ServerSettings) -> bool {
        true
    }
}
