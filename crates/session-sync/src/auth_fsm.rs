//! Session phase state machine using rust-fsm.
//!
//! ## State Diagram
//!
//! ```text
//! ┌─────────────────┐
//! │    Anonymous    │ (initial)
//! └────────┬────────┘
//!          │ CredentialsSubmitted / SessionEstablished
//!          ▼
//! ┌─────────────────┐  CredentialsRejected / ConfirmationPending / SyncFailed
//! │ Authenticating  │ ───────────────────────────────────────────────────────► Anonymous
//! └────────┬────────┘
//!          │ ProfileSynced / Restored
//!          ▼
//! ┌─────────────────┐
//! │  Authenticated  │ ── SignedOut ──► Anonymous
//! └─────────────────┘
//! ```
//!
//! `Restored` returns to `Authenticated` after a failed attempt when the
//! previous user/profile pair is still in place.

use rust_fsm::*;
use serde::{Deserialize, Serialize};

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub session_machine(Anonymous)

    Anonymous => {
        CredentialsSubmitted => Authenticating,
        SessionEstablished => Authenticating,
        SignedOut => Anonymous
    },
    Authenticating => {
        CredentialsSubmitted => Authenticating,
        SessionEstablished => Authenticating,
        CredentialsRejected => Anonymous,
        ConfirmationPending => Anonymous,
        ProfileSynced => Authenticated,
        SyncFailed => Anonymous,
        Restored => Authenticated,
        SignedOut => Anonymous
    },
    Authenticated => {
        CredentialsSubmitted => Authenticating,
        SessionEstablished => Authenticating,
        SignedOut => Anonymous
    }
}

pub use session_machine::Input as SessionInput;
pub use session_machine::State as SessionMachineState;
pub use session_machine::StateMachine as SessionMachine;

/// Phase of the session lifecycle, as exposed in [`AuthState`](crate::AuthState).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Anonymous,
    Authenticating,
    Authenticated,
}

impl SessionPhase {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionPhase::Authenticated)
    }
}

impl From<&SessionMachineState> for SessionPhase {
    fn from(state: &SessionMachineState) -> Self {
        match state {
            SessionMachineState::Anonymous => SessionPhase::Anonymous,
            SessionMachineState::Authenticating => SessionPhase::Authenticating,
            SessionMachineState::Authenticated => SessionPhase::Authenticated,
        }
    }
}
