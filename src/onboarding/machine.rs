//! Onboarding state machine — walks one user through the
//! credential-verification exchange and produces a vault-sealed account.
//!
//! Steps for a given user are serialized by that user's registry slot;
//! the slot lock is held for the whole step, so two inbound messages for
//! the same user can never interleave against one session.

use std::sync::Arc;

use regex::Regex;
use uuid::Uuid;

use crate::automation::{AutomationClient, ClientConnector, CodeVerification};
use crate::error::FlowError;
use crate::models::{Account, ClientCredentials, User};
use crate::onboarding::registry::{LiveSignIn, OnboardingSession, SessionRegistry};
use crate::store::Store;
use crate::vault::Vault;

/// Which prompt to repeat after malformed input. The state is unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reprompt {
    /// Expecting `api_id api_hash +phone`.
    Credentials,
    /// Expecting the fixed-length numeric code.
    Code,
}

/// Result of feeding one inbound message to the machine.
#[derive(Debug)]
pub enum StepOutcome {
    /// No flow in progress for this user.
    NoSession,
    /// Input didn't validate; ask again, nothing changed.
    Prompt(Reprompt),
    /// Credentials accepted, a sign-in code is on its way to the phone.
    CodeRequested { phone: String },
    /// The code was right but the account wants its extra secret.
    SecondFactorRequired,
    /// Terminal success: the account is linked and sealed in the store.
    Linked { account_id: Uuid, phone: String },
    /// Terminal failure: the session is gone and any handle released.
    Failed(FlowError),
}

/// Drives onboarding sessions. One instance serves all users; per-user
/// serialization comes from the registry slots.
pub struct OnboardingMachine {
    store: Arc<dyn Store>,
    vault: Arc<Vault>,
    connector: Arc<dyn ClientConnector>,
    registry: Arc<SessionRegistry>,
    code_pattern: Regex,
}

impl OnboardingMachine {
    pub fn new(
        store: Arc<dyn Store>,
        vault: Arc<Vault>,
        connector: Arc<dyn ClientConnector>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            store,
            vault,
            connector,
            registry,
            // Sign-in codes are exactly five digits.
            code_pattern: Regex::new(r"^[0-9]{5}$").expect("static pattern"),
        }
    }

    /// Begin a flow for a user. Guarded by the account quota: at or over the
    /// limit the request is rejected and no session is created.
    pub async fn begin(&self, user: &User) -> Result<(), FlowError> {
        let used = self.store.count_active_accounts(user.id).await?;
        let limit = user.account_quota();
        if used >= limit {
            return Err(FlowError::Quota { used, limit });
        }
        self.registry
            .insert(user.id, OnboardingSession::AwaitingCredentials)
            .await;
        tracing::info!(user_id = user.id, "Onboarding started");
        Ok(())
    }

    /// Whether a flow is in progress for this user.
    pub async fn has_session(&self, user_id: i64) -> bool {
        self.registry.has_session(user_id).await
    }

    /// Discard any session for the user, releasing a held handle.
    /// Returns whether a session existed.
    pub async fn cancel(&self, user_id: i64) -> bool {
        let existed = self.registry.remove(user_id).await;
        if existed {
            tracing::info!(user_id, "Onboarding cancelled");
        }
        existed
    }

    /// Feed one inbound message to the user's session.
    ///
    /// The session is taken out of its slot and only put back when the flow
    /// continues, so every terminal path leaves the slot empty and every
    /// held handle released.
    pub async fn step(&self, user: &User, input: &str) -> StepOutcome {
        let slot = self.registry.slot(user.id).await;
        let mut guard = slot.lock().await;

        match guard.take() {
            None => StepOutcome::NoSession,

            Some(OnboardingSession::AwaitingCredentials) => {
                let Some(creds) = ClientCredentials::parse(input) else {
                    *guard = Some(OnboardingSession::AwaitingCredentials);
                    return StepOutcome::Prompt(Reprompt::Credentials);
                };

                let mut client = match self.connector.connect(&creds).await {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::warn!(user_id = user.id, "Connect failed during onboarding: {e}");
                        return StepOutcome::Failed(FlowError::from_client(e));
                    }
                };

                if let Err(e) = client.request_code().await {
                    client.disconnect().await;
                    return StepOutcome::Failed(FlowError::from_client(e));
                }

                let phone = creds.phone.clone();
                *guard = Some(OnboardingSession::AwaitingCode(LiveSignIn { creds, client }));
                StepOutcome::CodeRequested { phone }
            }

            Some(OnboardingSession::AwaitingCode(mut live)) => {
                let code = input.trim();
                if !self.code_pattern.is_match(code) {
                    *guard = Some(OnboardingSession::AwaitingCode(live));
                    return StepOutcome::Prompt(Reprompt::Code);
                }

                match live.client.verify_code(code).await {
                    Ok(CodeVerification::Verified) => self.complete(user, live).await,
                    Ok(CodeVerification::SecondFactorRequired) => {
                        *guard = Some(OnboardingSession::AwaitingSecondFactor(live));
                        StepOutcome::SecondFactorRequired
                    }
                    Err(e) => {
                        live.client.disconnect().await;
                        StepOutcome::Failed(FlowError::from_client(e))
                    }
                }
            }

            Some(OnboardingSession::AwaitingSecondFactor(mut live)) => {
                // Any text is accepted as the secret.
                match live.client.verify_second_factor(input.trim()).await {
                    Ok(()) => self.complete(user, live).await,
                    Err(e) => {
                        live.client.disconnect().await;
                        StepOutcome::Failed(FlowError::from_client(e))
                    }
                }
            }
        }
    }

    /// Export, seal, and persist a verified sign-in, then release the handle.
    async fn complete(&self, user: &User, live: LiveSignIn) -> StepOutcome {
        let LiveSignIn { creds, mut client } = live;

        let exported = match client.export_session().await {
            Ok(session) => session,
            Err(e) => return fail_and_release(client, FlowError::from_client(e)).await,
        };

        let session_blob = match self.vault.encrypt(&exported) {
            Ok(blob) => blob,
            Err(e) => return fail_and_release(client, FlowError::Vault(e)).await,
        };

        let account = Account::new(
            user.id,
            creds.phone.clone(),
            creds.api_id,
            creds.api_hash,
            session_blob,
        );
        if let Err(e) = self.store.insert_account(&account).await {
            return fail_and_release(client, FlowError::Store(e)).await;
        }

        client.disconnect().await;
        tracing::info!(user_id = user.id, phone = %account.phone, "Account linked");
        StepOutcome::Linked {
            account_id: account.id,
            phone: account.phone,
        }
    }
}

async fn fail_and_release(mut client: Box<dyn AutomationClient>, err: FlowError) -> StepOutcome {
    client.disconnect().await;
    StepOutcome::Failed(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use secrecy::SecretString;

    use crate::automation::CreateOutcome;
    use crate::error::ClientError;
    use crate::store::LibSqlStore;

    /// What the scripted client should answer to verify_code.
    #[derive(Clone, Copy)]
    enum VerifyScript {
        Verified,
        SecondFactor,
        WrongCode,
    }

    #[derive(Default)]
    struct Calls {
        connects: AtomicUsize,
        code_requests: AtomicUsize,
        code_verifies: AtomicUsize,
        factor_verifies: AtomicUsize,
        disconnects: AtomicUsize,
    }

    struct ScriptedClient {
        script: VerifyScript,
        second_factor_ok: bool,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl AutomationClient for ScriptedClient {
        async fn request_code(&mut self) -> Result<(), ClientError> {
            self.calls.code_requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn verify_code(&mut self, _code: &str) -> Result<CodeVerification, ClientError> {
            self.calls.code_verifies.fetch_add(1, Ordering::SeqCst);
            match self.script {
                VerifyScript::Verified => Ok(CodeVerification::Verified),
                VerifyScript::SecondFactor => Ok(CodeVerification::SecondFactorRequired),
                VerifyScript::WrongCode => Err(ClientError::Auth("invalid code".into())),
            }
        }

        async fn verify_second_factor(&mut self, _secret: &str) -> Result<(), ClientError> {
            self.calls.factor_verifies.fetch_add(1, Ordering::SeqCst);
            if self.second_factor_ok {
                Ok(())
            } else {
                Err(ClientError::Auth("wrong password".into()))
            }
        }

        async fn export_session(&mut self) -> Result<String, ClientError> {
            Ok("exported-session-material".into())
        }

        async fn create_group(&mut self, _name: &str) -> Result<CreateOutcome, ClientError> {
            unreachable!("onboarding never creates groups")
        }

        async fn disconnect(&mut self) {
            self.calls.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedConnector {
        fail_connect: bool,
        script: VerifyScript,
        second_factor_ok: bool,
        calls: Arc<Calls>,
    }

    #[async_trait]
    impl ClientConnector for ScriptedConnector {
        async fn connect(
            &self,
            _creds: &ClientCredentials,
        ) -> Result<Box<dyn AutomationClient>, ClientError> {
            if self.fail_connect {
                return Err(ClientError::Transport("connection refused".into()));
            }
            self.calls.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedClient {
                script: self.script,
                second_factor_ok: self.second_factor_ok,
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    struct Fixture {
        machine: OnboardingMachine,
        store: Arc<LibSqlStore>,
        vault: Arc<Vault>,
        calls: Arc<Calls>,
        user: User,
    }

    async fn fixture(script: VerifyScript) -> Fixture {
        fixture_with(script, false, true).await
    }

    async fn fixture_with(
        script: VerifyScript,
        fail_connect: bool,
        second_factor_ok: bool,
    ) -> Fixture {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let vault = Arc::new(Vault::new(&SecretString::from("machine-test-key")));
        let calls = Arc::new(Calls::default());
        let connector = Arc::new(ScriptedConnector {
            fail_connect,
            script,
            second_factor_ok,
            calls: Arc::clone(&calls),
        });
        let machine = OnboardingMachine::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&vault),
            connector,
            Arc::new(SessionRegistry::new()),
        );
        let user = store.upsert_user(42, "Alice", false).await.unwrap();
        Fixture {
            machine,
            store,
            vault,
            calls,
            user,
        }
    }

    const CREDS_LINE: &str = "123456 abcdef123456 +1234567890";

    #[tokio::test]
    async fn valid_credentials_request_exactly_one_code() {
        let fx = fixture(VerifyScript::Verified).await;
        fx.machine.begin(&fx.user).await.unwrap();

        let outcome = fx.machine.step(&fx.user, CREDS_LINE).await;
        assert!(matches!(
            outcome,
            StepOutcome::CodeRequested { ref phone } if phone == "+1234567890"
        ));
        assert_eq!(fx.calls.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fx.calls.code_requests.load(Ordering::SeqCst), 1);
        assert!(fx.machine.has_session(fx.user.id).await);
    }

    #[tokio::test]
    async fn two_token_input_reprompts_without_side_effects() {
        let fx = fixture(VerifyScript::Verified).await;
        fx.machine.begin(&fx.user).await.unwrap();

        let outcome = fx.machine.step(&fx.user, "123456 abcdef").await;
        assert!(matches!(
            outcome,
            StepOutcome::Prompt(Reprompt::Credentials)
        ));
        assert_eq!(fx.calls.connects.load(Ordering::SeqCst), 0);
        assert_eq!(fx.calls.code_requests.load(Ordering::SeqCst), 0);
        assert!(fx.machine.has_session(fx.user.id).await);
    }

    #[tokio::test]
    async fn connect_failure_discards_the_session() {
        let fx = fixture_with(VerifyScript::Verified, true, true).await;
        fx.machine.begin(&fx.user).await.unwrap();

        let outcome = fx.machine.step(&fx.user, CREDS_LINE).await;
        assert!(matches!(
            outcome,
            StepOutcome::Failed(FlowError::Transport(_))
        ));
        assert!(!fx.machine.has_session(fx.user.id).await);
    }

    #[tokio::test]
    async fn verified_code_links_account_and_releases_handle() {
        let fx = fixture(VerifyScript::Verified).await;
        fx.machine.begin(&fx.user).await.unwrap();
        fx.machine.step(&fx.user, CREDS_LINE).await;

        let outcome = fx.machine.step(&fx.user, "12345").await;
        let StepOutcome::Linked { account_id, phone } = outcome else {
            panic!("expected Linked, got {outcome:?}");
        };
        assert_eq!(phone, "+1234567890");
        assert_eq!(fx.calls.disconnects.load(Ordering::SeqCst), 1);
        assert!(!fx.machine.has_session(fx.user.id).await);

        // The stored blob is vault output, not the plaintext session.
        let account = fx.store.find_account(account_id).await.unwrap().unwrap();
        assert_ne!(account.session_blob, "exported-session-material");
        assert_eq!(
            fx.vault.decrypt(&account.session_blob).unwrap(),
            "exported-session-material"
        );
    }

    #[tokio::test]
    async fn malformed_code_reprompts_and_keeps_the_handle() {
        let fx = fixture(VerifyScript::Verified).await;
        fx.machine.begin(&fx.user).await.unwrap();
        fx.machine.step(&fx.user, CREDS_LINE).await;

        for bad in ["abc", "1234", "123456", "12 45"] {
            let outcome = fx.machine.step(&fx.user, bad).await;
            assert!(
                matches!(outcome, StepOutcome::Prompt(Reprompt::Code)),
                "input {bad:?} should re-prompt"
            );
        }
        assert_eq!(fx.calls.code_verifies.load(Ordering::SeqCst), 0);
        assert_eq!(fx.calls.disconnects.load(Ordering::SeqCst), 0);
        assert!(fx.machine.has_session(fx.user.id).await);
    }

    #[tokio::test]
    async fn second_factor_branch_retains_the_handle() {
        let fx = fixture(VerifyScript::SecondFactor).await;
        fx.machine.begin(&fx.user).await.unwrap();
        fx.machine.step(&fx.user, CREDS_LINE).await;

        let outcome = fx.machine.step(&fx.user, "12345").await;
        assert!(matches!(outcome, StepOutcome::SecondFactorRequired));
        assert_eq!(fx.calls.disconnects.load(Ordering::SeqCst), 0);
        assert!(fx.machine.has_session(fx.user.id).await);

        let outcome = fx.machine.step(&fx.user, "hunter2").await;
        assert!(matches!(outcome, StepOutcome::Linked { .. }));
        assert_eq!(fx.calls.factor_verifies.load(Ordering::SeqCst), 1);
        assert_eq!(fx.calls.disconnects.load(Ordering::SeqCst), 1);
        assert!(!fx.machine.has_session(fx.user.id).await);
    }

    #[tokio::test]
    async fn wrong_code_fails_and_releases_exactly_once() {
        let fx = fixture(VerifyScript::WrongCode).await;
        fx.machine.begin(&fx.user).await.unwrap();
        fx.machine.step(&fx.user, CREDS_LINE).await;

        let outcome = fx.machine.step(&fx.user, "12345").await;
        assert!(matches!(outcome, StepOutcome::Failed(FlowError::Auth(_))));
        assert_eq!(fx.calls.disconnects.load(Ordering::SeqCst), 1);
        assert!(!fx.machine.has_session(fx.user.id).await);
    }

    #[tokio::test]
    async fn wrong_second_factor_fails_and_releases() {
        let fx = fixture_with(VerifyScript::SecondFactor, false, false).await;
        fx.machine.begin(&fx.user).await.unwrap();
        fx.machine.step(&fx.user, CREDS_LINE).await;
        fx.machine.step(&fx.user, "12345").await;

        let outcome = fx.machine.step(&fx.user, "wrong").await;
        assert!(matches!(outcome, StepOutcome::Failed(FlowError::Auth(_))));
        assert_eq!(fx.calls.disconnects.load(Ordering::SeqCst), 1);
        assert!(!fx.machine.has_session(fx.user.id).await);
    }

    #[tokio::test]
    async fn quota_guard_rejects_before_any_remote_call() {
        let fx = fixture(VerifyScript::Verified).await;
        for i in 0..3 {
            let account = Account::new(
                fx.user.id,
                format!("+1{i}"),
                "id".into(),
                "hash".into(),
                "aa:bb:cc".into(),
            );
            fx.store.insert_account(&account).await.unwrap();
        }

        let err = fx.machine.begin(&fx.user).await.unwrap_err();
        assert!(matches!(err, FlowError::Quota { used: 3, limit: 3 }));
        assert!(!fx.machine.has_session(fx.user.id).await);
        assert_eq!(fx.calls.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn premium_quota_is_ten() {
        let fx = fixture(VerifyScript::Verified).await;
        let premium = fx.store.upsert_user(42, "Alice", true).await.unwrap();
        for i in 0..3 {
            let account = Account::new(
                premium.id,
                format!("+1{i}"),
                "id".into(),
                "hash".into(),
                "aa:bb:cc".into(),
            );
            fx.store.insert_account(&account).await.unwrap();
        }

        // Three linked accounts block a standard user but not a premium one.
        fx.machine.begin(&premium).await.unwrap();
        assert!(fx.machine.has_session(premium.id).await);
    }

    #[tokio::test]
    async fn cancel_releases_the_held_handle() {
        let fx = fixture(VerifyScript::Verified).await;
        fx.machine.begin(&fx.user).await.unwrap();
        fx.machine.step(&fx.user, CREDS_LINE).await;

        assert!(fx.machine.cancel(fx.user.id).await);
        assert_eq!(fx.calls.disconnects.load(Ordering::SeqCst), 1);
        assert!(!fx.machine.has_session(fx.user.id).await);
        assert!(!fx.machine.cancel(fx.user.id).await);
    }

    #[tokio::test]
    async fn step_without_session_is_no_session() {
        let fx = fixture(VerifyScript::Verified).await;
        let outcome = fx.machine.step(&fx.user, "anything").await;
        assert!(matches!(outcome, StepOutcome::NoSession));
    }

    #[tokio::test]
    async fn restarting_replaces_the_prior_session() {
        let fx = fixture(VerifyScript::Verified).await;
        fx.machine.begin(&fx.user).await.unwrap();
        fx.machine.step(&fx.user, CREDS_LINE).await;

        // A second begin discards the code-wait session and its handle.
        fx.machine.begin(&fx.user).await.unwrap();
        assert_eq!(fx.calls.disconnects.load(Ordering::SeqCst), 1);

        let outcome = fx.machine.step(&fx.user, "12345").await;
        assert!(
            matches!(outcome, StepOutcome::Prompt(Reprompt::Credentials)),
            "fresh session should be back at the credentials prompt"
        );
    }
}
