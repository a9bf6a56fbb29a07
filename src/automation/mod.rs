//! Capability interface for the remote automation provider.
//!
//! The provider's wire protocol stays outside this repo; everything the core
//! needs is expressed by these two traits. Connecting yields a live handle,
//! and whoever holds the handle is responsible for releasing it.

pub mod bridge;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::models::ClientCredentials;

pub use bridge::BridgeConnector;

/// Result of verifying a one-time sign-in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeVerification {
    /// Signed in; the session can be exported.
    Verified,
    /// The account requires an additional secret beyond the code.
    SecondFactorRequired,
}

/// Result of one remote create operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created {
        remote_id: i64,
        invite_ref: String,
        member_count: u32,
    },
    Failed {
        reason: String,
    },
}

/// A live, connected handle onto the remote platform.
///
/// `disconnect` is idempotent and always safe to call; every other method
/// assumes the handle is still connected.
#[async_trait]
pub trait AutomationClient: Send {
    /// Ask the platform to send a one-time code to the account's phone.
    async fn request_code(&mut self) -> Result<(), ClientError>;

    /// Verify the one-time code.
    async fn verify_code(&mut self, code: &str) -> Result<CodeVerification, ClientError>;

    /// Verify the second-factor secret.
    async fn verify_second_factor(&mut self, secret: &str) -> Result<(), ClientError>;

    /// Export the serialized session. Valid only after a verified sign-in.
    async fn export_session(&mut self) -> Result<String, ClientError>;

    /// Create one remote group.
    async fn create_group(&mut self, name: &str) -> Result<CreateOutcome, ClientError>;

    /// Release the connection. Safe to call more than once.
    async fn disconnect(&mut self);
}

/// Opens connections to the remote platform.
#[async_trait]
pub trait ClientConnector: Send + Sync {
    /// Connect with the given credentials and return a live handle.
    async fn connect(
        &self,
        creds: &ClientCredentials,
    ) -> Result<Box<dyn AutomationClient>, ClientError>;
}
