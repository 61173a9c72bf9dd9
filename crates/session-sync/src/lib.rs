//! Session and profile synchronizer for the marketplace client.
//!
//! [`AuthStore`] owns the authenticated identity and reconciles it with auth
//! events pushed by the backend. Its state is published as an [`AuthState`]
//! through a `watch` channel.

mod auth_fsm;
mod error;
pub mod poll;
mod state;
mod store;

pub use auth_fsm::{SessionInput, SessionMachine, SessionMachineState, SessionPhase};
pub use error::{Cancelled, SyncError, SyncResult};
pub use state::AuthState;
pub use store::{AuthListener, AuthStore};
