//! Account onboarding — the credential-verification dialogue.

pub mod machine;
pub mod registry;

pub use machine::{OnboardingMachine, Reprompt, StepOutcome};
pub use registry::{FlowState, OnboardingSession, SessionRegistry};
