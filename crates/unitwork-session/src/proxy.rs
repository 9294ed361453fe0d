//! Lazy reference state machine.
//!
//! A proxy is an ordinary arena instance whose fields have not been loaded.
//! It is registered in the identity map as soon as it is created and reports
//! `MANAGED`, because its identity is already known to exist in storage.
//! Reading any field other than the identifier resolves it first.
//!
//! ```text
//! Uninitialized --begin--> Initializing --complete--> Initialized
//!                               |
//!                               +--abort--> Uninitialized
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Initialization state of an instance's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProxyState {
    /// Only the identity is known.
    Uninitialized,
    /// A load is in flight.
    Initializing,
    /// Fields are populated. Instances created from rows or by the
    /// application start here.
    #[default]
    Initialized,
}

impl ProxyState {
    pub const fn is_initialized(&self) -> bool {
        matches!(self, ProxyState::Initialized)
    }

    /// Enter `Initializing`. Returns `true` if the caller must issue the load.
    ///
    /// A proxy found in `Initializing` belongs to a load that was abandoned
    /// (its future was dropped or cancelled); the session is `&mut` for the
    /// whole resolution, so there is never a second load actually in flight.
    pub(crate) fn begin(&mut self) -> bool {
        match self {
            ProxyState::Initialized => false,
            ProxyState::Uninitialized | ProxyState::Initializing => {
                *self = ProxyState::Initializing;
                true
            }
        }
    }

    pub(crate) fn complete(&mut self) {
        *self = ProxyState::Initialized;
    }

    /// Roll back a failed or cancelled load.
    pub(crate) fn abort(&mut self) {
        if *self == ProxyState::Initializing {
            *self = ProxyState::Uninitialized;
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Uninitialized => "UNINITIALIZED",
            ProxyState::Initializing => "INITIALIZING",
            ProxyState::Initialized => "INITIALIZED",
        }
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
