//! Session registry — explicit, process-owned map of live onboarding
//! sessions keyed by user identity.
//!
//! Each user gets one slot guarded by its own async mutex. Locking the slot
//! for the duration of a step serializes that user's events; different
//! users' slots are independent and run in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::automation::AutomationClient;
use crate::models::ClientCredentials;

/// Discriminant of [`OnboardingSession`] for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    AwaitingCredentials,
    AwaitingCode,
    AwaitingSecondFactor,
}

impl std::fmt::Display for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AwaitingCredentials => "awaiting_credentials",
            Self::AwaitingCode => "awaiting_code",
            Self::AwaitingSecondFactor => "awaiting_second_factor",
        };
        write!(f, "{s}")
    }
}

/// Credentials plus the live connection opened with them.
pub struct LiveSignIn {
    pub creds: ClientCredentials,
    pub client: Box<dyn AutomationClient>,
}

/// Transient per-user onboarding state. Process-memory only; terminal
/// success, terminal failure, and explicit cancellation all destroy it.
///
/// The live client handle is part of the code-wait states, so "handle exists
/// iff awaiting a code or second factor" holds by construction.
pub enum OnboardingSession {
    AwaitingCredentials,
    AwaitingCode(LiveSignIn),
    AwaitingSecondFactor(LiveSignIn),
}

impl OnboardingSession {
    pub fn state(&self) -> FlowState {
        match self {
            Self::AwaitingCredentials => FlowState::AwaitingCredentials,
            Self::AwaitingCode(_) => FlowState::AwaitingCode,
            Self::AwaitingSecondFactor(_) => FlowState::AwaitingSecondFactor,
        }
    }

    /// Consume the session, disconnecting its client if one is held.
    pub async fn release(self) {
        match self {
            Self::AwaitingCredentials => {}
            Self::AwaitingCode(mut live) | Self::AwaitingSecondFactor(mut live) => {
                live.client.disconnect().await;
            }
        }
    }
}

/// One user's slot. `None` means no flow is in progress.
pub type SessionSlot = Arc<Mutex<Option<OnboardingSession>>>;

/// Registry of onboarding sessions, passed to the state machine as an
/// explicit dependency.
pub struct SessionRegistry {
    slots: Mutex<HashMap<i64, SessionSlot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or create) the slot for a user. The slot itself is what callers
    /// lock across a step; the registry map is only held long enough to
    /// clone the Arc.
    pub async fn slot(&self, user_id: i64) -> SessionSlot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(user_id).or_default())
    }

    /// Whether the user currently has a session in progress.
    pub async fn has_session(&self, user_id: i64) -> bool {
        let slot = self.slot(user_id).await;
        let guard = slot.lock().await;
        guard.is_some()
    }

    /// Current flow state for a user, if any.
    pub async fn state(&self, user_id: i64) -> Option<FlowState> {
        let slot = self.slot(user_id).await;
        let guard = slot.lock().await;
        guard.as_ref().map(OnboardingSession::state)
    }

    /// Insert a fresh session, implicitly discarding (and releasing) any
    /// prior incomplete one for the same user.
    pub async fn insert(&self, user_id: i64, session: OnboardingSession) {
        let slot = self.slot(user_id).await;
        let mut guard = slot.lock().await;
        if let Some(old) = guard.replace(session) {
            old.release().await;
            tracing::debug!(user_id, "Replaced an incomplete onboarding session");
        }
    }

    /// Remove the user's session, releasing any held client handle.
    /// Returns whether a session existed.
    pub async fn remove(&self, user_id: i64) -> bool {
        let slot = self.slot(user_id).await;
        let taken = {
            let mut guard = slot.lock().await;
            guard.take()
        };
        match taken {
            Some(session) => {
                session.release().await;
                true
            }
            None => false,
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
