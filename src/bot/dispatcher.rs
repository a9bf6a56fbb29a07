//! Dispatcher — routes inbound chat messages into the core subsystems and
//! renders their outcomes back to the chat.
//!
//! Long-running bulk runs are spawned as independent tasks bound to the
//! initiating user, so one user's run never blocks another user's events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::authz::AdminRegistry;
use crate::bot::{InboundMessage, Outbox};
use crate::bulk::{BulkProgress, BulkRunner, BulkSummary};
use crate::error::{Error, FlowError, VaultError};
use crate::models::{Account, ClientCredentials, User};
use crate::onboarding::{OnboardingMachine, Reprompt, StepOutcome};
use crate::store::Store;
use crate::vault::Vault;

const START_TEXT: &str = "\
👋 Welcome to groupsmith!

Commands:
/addaccount — link a Telegram account
/myaccounts — list your linked accounts
/removeaccount <n> — unlink account n from the list
/creategroup <name> — create one group
/creategroups <n> — create n groups (1-20)
/cancel — stop onboarding or a running bulk job
/stats — your numbers
/status — service status";

pub struct Dispatcher {
    store: Arc<dyn Store>,
    vault: Arc<Vault>,
    machine: Arc<OnboardingMachine>,
    runner: Arc<BulkRunner>,
    outbox: Arc<dyn Outbox>,
    admins: AdminRegistry,
    /// Cancellation token of each user's in-flight bulk run.
    bulk_tasks: Arc<Mutex<HashMap<i64, CancellationToken>>>,
    started_at: Instant,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        vault: Arc<Vault>,
        machine: Arc<OnboardingMachine>,
        runner: Arc<BulkRunner>,
        outbox: Arc<dyn Outbox>,
        admins: AdminRegistry,
    ) -> Self {
        Self {
            store,
            vault,
            machine,
            runner,
            outbox,
            admins,
            bulk_tasks: Arc::new(Mutex::new(HashMap::new())),
            started_at: Instant::now(),
        }
    }

    /// Entry point for one inbound message. Never propagates; failures are
    /// logged and answered with a generic apology.
    pub async fn handle(&self, msg: InboundMessage) {
        if let Err(e) = self.dispatch(&msg).await {
            tracing::error!(user_id = msg.user_id, "Dispatch failed: {e}");
            let _ = self
                .outbox
                .send(msg.chat_id, "❌ Something went wrong. Please try again.")
                .await;
        }
    }

    async fn dispatch(&self, msg: &InboundMessage) -> Result<(), Error> {
        // Upsert on every contact: first sight creates the user, later
        // sights refresh the display name and premium tier.
        let user = match self
            .store
            .upsert_user(msg.user_id, &msg.first_name, msg.premium)
            .await
        {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(user_id = msg.user_id, "User upsert failed: {e}");
                self.outbox
                    .send(
                        msg.chat_id,
                        "⚠️ Storage is temporarily unavailable. Try again in a minute.",
                    )
                    .await?;
                return Ok(());
            }
        };

        let text = msg.text.trim();
        if let Some(rest) = text.strip_prefix('/') {
            let (cmd, args) = rest
                .split_once(char::is_whitespace)
                .unwrap_or((rest, ""));
            // Tolerate the /command@botname form used in group chats.
            let cmd = cmd.split('@').next().unwrap_or(cmd);
            return self.dispatch_command(&user, msg, cmd, args.trim()).await;
        }

        self.dispatch_text(&user, msg.chat_id, text).await
    }

    async fn dispatch_command(
        &self,
        user: &User,
        msg: &InboundMessage,
        cmd: &str,
        args: &str,
    ) -> Result<(), Error> {
        match cmd {
            "start" => {
                self.outbox.send(msg.chat_id, START_TEXT).await?;
            }
            "addaccount" => match self.machine.begin(user).await {
                Ok(()) => {
                    self.outbox
                        .send(
                            msg.chat_id,
                            "📱 Send your credentials as: api_id api_hash +phone\n\
                             Example: 123456 abcdef123456 +1234567890",
                        )
                        .await?;
                }
                Err(e) => {
                    self.outbox
                        .send(msg.chat_id, &flow_error_text(&e))
                        .await?;
                }
            },
            "myaccounts" => self.cmd_my_accounts(user, msg.chat_id).await?,
            "removeaccount" => self.cmd_remove_account(user, msg.chat_id, args).await?,
            "creategroup" => self.cmd_create_group(user, msg.chat_id, args).await?,
            "creategroups" => self.cmd_create_groups(user, msg.chat_id, args).await?,
            "cancel" => self.cmd_cancel(user, msg.chat_id).await?,
            "stats" => self.cmd_stats(user, msg).await?,
            "status" => self.cmd_status(msg.chat_id).await?,
            other => {
                tracing::debug!(user_id = user.id, command = other, "Unknown command");
                self.outbox
                    .send(msg.chat_id, "Unknown command. Try /start for the list.")
                    .await?;
            }
        }
        Ok(())
    }

    /// Free text: feed a live onboarding session, or accept a bare
    /// credential line as an implicit /addaccount. Anything else is chatter.
    async fn dispatch_text(&self, user: &User, chat_id: i64, text: &str) -> Result<(), Error> {
        if self.machine.has_session(user.id).await {
            let outcome = self.machine.step(user, text).await;
            return self.reply_outcome(chat_id, outcome).await;
        }

        if ClientCredentials::parse(text).is_some() {
            if let Err(e) = self.machine.begin(user).await {
                self.outbox.send(chat_id, &flow_error_text(&e)).await?;
                return Ok(());
            }
            let outcome = self.machine.step(user, text).await;
            return self.reply_outcome(chat_id, outcome).await;
        }

        Ok(())
    }

    async fn reply_outcome(&self, chat_id: i64, outcome: StepOutcome) -> Result<(), Error> {
        let text = match outcome {
            StepOutcome::NoSession => return Ok(()),
            StepOutcome::Prompt(Reprompt::Credentials) => {
                "That doesn't look right. Send: api_id api_hash +phone".to_string()
            }
            StepOutcome::Prompt(Reprompt::Code) => {
                "The code is 5 digits. Send just the code.".to_string()
            }
            StepOutcome::CodeRequested { phone } => {
                format!("📨 Code sent to {phone}. Reply with the 5-digit code.")
            }
            StepOutcome::SecondFactorRequired => {
                "🔐 This account has two-step verification. Send its password.".to_string()
            }
            StepOutcome::Linked { phone, .. } => {
                format!("✅ Account {phone} linked and stored securely.")
            }
            StepOutcome::Failed(e) => flow_error_text(&e),
        };
        self.outbox.send(chat_id, &text).await?;
        Ok(())
    }

    async fn cmd_my_accounts(&self, user: &User, chat_id: i64) -> Result<(), Error> {
        let accounts = match self.store.accounts_by_owner(user.id, true).await {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::warn!(user_id = user.id, "Account listing failed: {e}");
                self.outbox
                    .send(chat_id, "⚠️ Storage is temporarily unavailable. Try again soon.")
                    .await?;
                return Ok(());
            }
        };

        if accounts.is_empty() {
            self.outbox
                .send(chat_id, "📭 No accounts yet. Use /addaccount to link one.")
                .await?;
            return Ok(());
        }

        let mut text = format!(
            "📱 Your accounts ({} of {}):\n",
            accounts.len(),
            user.account_quota()
        );
        for (i, account) in accounts.iter().enumerate() {
            text.push_str(&format!(
                "{}. {} (api {})\n",
                i + 1,
                account.phone,
                mask(&account.api_id)
            ));
        }
        self.outbox.send(chat_id, &text).await?;
        Ok(())
    }

    /// Soft-deactivate the nth account from the /myaccounts listing.
    /// The row stays in the store; it just stops being usable.
    async fn cmd_remove_account(&self, user: &User, chat_id: i64, args: &str) -> Result<(), Error> {
        let Ok(index) = args.parse::<usize>() else {
            self.outbox
                .send(chat_id, "Usage: /removeaccount <n> (see /myaccounts)")
                .await?;
            return Ok(());
        };

        let accounts = match self.store.accounts_by_owner(user.id, true).await {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::warn!(user_id = user.id, "Account lookup failed: {e}");
                self.outbox
                    .send(chat_id, "⚠️ Storage is temporarily unavailable. Try again soon.")
                    .await?;
                return Ok(());
            }
        };

        let Some(account) = index.checked_sub(1).and_then(|i| accounts.get(i)) else {
            self.outbox
                .send(
                    chat_id,
                    &format!("No account {index}. You have {}.", accounts.len()),
                )
                .await?;
            return Ok(());
        };

        match self.store.deactivate_account(account.id).await {
            Ok(()) => {
                self.outbox
                    .send(chat_id, &format!("🗑 Account {} unlinked.", account.phone))
                    .await?;
            }
            Err(e) => {
                tracing::warn!(account_id = %account.id, "Deactivation failed: {e}");
                self.outbox
                    .send(chat_id, "⚠️ Could not unlink the account. Try again soon.")
                    .await?;
            }
        }
        Ok(())
    }

    async fn cmd_create_group(&self, user: &User, chat_id: i64, args: &str) -> Result<(), Error> {
        if args.is_empty() {
            self.outbox
                .send(chat_id, "Usage: /creategroup <name>")
                .await?;
            return Ok(());
        }

        let Some((account, creds)) = self.connectable_account(user, chat_id).await? else {
            return Ok(());
        };

        match self.runner.create_single(&account, creds, args).await {
            Ok(group) => {
                self.outbox
                    .send(
                        chat_id,
                        &format!("✅ Created {}\nInvite: {}", group.name, group.invite_ref),
                    )
                    .await?;
            }
            Err(e) => {
                self.outbox
                    .send(chat_id, &format!("❌ Create failed: {e}"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn cmd_create_groups(&self, user: &User, chat_id: i64, args: &str) -> Result<(), Error> {
        let Ok(count) = args.parse::<usize>() else {
            self.outbox
                .send(chat_id, "Usage: /creategroups <n> (1-20)")
                .await?;
            return Ok(());
        };

        {
            let tasks = self.bulk_tasks.lock().await;
            if tasks.contains_key(&user.id) {
                self.outbox
                    .send(chat_id, "⏳ You already have a run in progress. /cancel to stop it.")
                    .await?;
                return Ok(());
            }
        }

        let Some((account, creds)) = self.connectable_account(user, chat_id).await? else {
            return Ok(());
        };

        let cancel = CancellationToken::new();
        self.bulk_tasks
            .lock()
            .await
            .insert(user.id, cancel.clone());

        self.outbox
            .send(chat_id, &format!("🚀 Starting: {count} groups via {}", account.phone))
            .await?;

        let (tx, mut rx) = mpsc::channel::<BulkProgress>(32);

        // Progress forwarder — ends when the runner drops its sender.
        let progress_outbox = Arc::clone(&self.outbox);
        tokio::spawn(async move {
            while let Some(p) = rx.recv().await {
                let _ = progress_outbox
                    .send(
                        chat_id,
                        &format!(
                            "⏳ {}/{} done ({} ok, {} failed)",
                            p.completed, p.total, p.succeeded, p.failed
                        ),
                    )
                    .await;
            }
        });

        let runner = Arc::clone(&self.runner);
        let outbox = Arc::clone(&self.outbox);
        let bulk_tasks = Arc::clone(&self.bulk_tasks);
        let user_id = user.id;
        tokio::spawn(async move {
            let result = runner
                .run(&account, creds, count, "Group", tx, cancel)
                .await;
            bulk_tasks.lock().await.remove(&user_id);

            let text = match result {
                Ok(summary) => summary_text(&summary),
                Err(e) => format!("❌ Bulk run aborted: {e}"),
            };
            let _ = outbox.send(chat_id, &text).await;
        });

        Ok(())
    }

    async fn cmd_cancel(&self, user: &User, chat_id: i64) -> Result<(), Error> {
        let mut cancelled = Vec::new();

        if self.machine.cancel(user.id).await {
            cancelled.push("onboarding");
        }
        if let Some(token) = self.bulk_tasks.lock().await.remove(&user.id) {
            token.cancel();
            cancelled.push("bulk run");
        }

        let text = if cancelled.is_empty() {
            "Nothing to cancel.".to_string()
        } else {
            format!("🛑 Cancelled: {}.", cancelled.join(", "))
        };
        self.outbox.send(chat_id, &text).await?;
        Ok(())
    }

    async fn cmd_stats(&self, user: &User, msg: &InboundMessage) -> Result<(), Error> {
        let accounts = self
            .store
            .count_active_accounts(user.id)
            .await
            .unwrap_or(0);
        let groups = self
            .store
            .groups_by_owner(user.id)
            .await
            .map(|g| g.len())
            .unwrap_or(0);

        let mut text = format!(
            "📊 Your stats:\nAccounts: {accounts} of {}\nGroups created: {groups}",
            user.account_quota()
        );

        let user_id_text = user.id.to_string();
        let identities = msg
            .username
            .iter()
            .map(|u| u.as_str())
            .chain([user_id_text.as_str()]);
        if self.admins.is_admin(identities) {
            match self.store.counts().await {
                Ok(counts) => {
                    text.push_str(&format!(
                        "\n\nService totals:\nUsers: {}\nAccounts: {}\nGroups: {}",
                        counts.users, counts.accounts, counts.groups
                    ));
                }
                Err(e) => {
                    tracing::warn!("Service totals unavailable: {e}");
                    text.push_str("\n\nService totals temporarily unavailable.");
                }
            }
        }

        self.outbox.send(msg.chat_id, &text).await?;
        Ok(())
    }

    async fn cmd_status(&self, chat_id: i64) -> Result<(), Error> {
        let db_ok = self.store.counts().await.is_ok();
        let uptime = self.started_at.elapsed();
        let hours = uptime.as_secs() / 3600;
        let minutes = (uptime.as_secs() % 3600) / 60;

        let text = format!(
            "🖥 Service status:\nBot: ✅ online\nDatabase: {}\nUptime: {hours}h {minutes}m",
            if db_ok { "✅ connected" } else { "❌ unreachable" }
        );
        self.outbox.send(chat_id, &text).await?;
        Ok(())
    }

    /// Pick the user's most recent active account and decrypt its session.
    /// Replies (and returns None) when there is nothing usable.
    async fn connectable_account(
        &self,
        user: &User,
        chat_id: i64,
    ) -> Result<Option<(Account, ClientCredentials)>, Error> {
        let accounts = match self.store.accounts_by_owner(user.id, true).await {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::warn!(user_id = user.id, "Account lookup failed: {e}");
                self.outbox
                    .send(chat_id, "⚠️ Storage is temporarily unavailable. Try again soon.")
                    .await?;
                return Ok(None);
            }
        };

        let Some(account) = accounts.into_iter().next() else {
            self.outbox
                .send(chat_id, "📭 No linked account. Use /addaccount first.")
                .await?;
            return Ok(None);
        };

        let session = match self.vault.decrypt(&account.session_blob) {
            Ok(session) => session,
            Err(VaultError::Integrity(reason)) => {
                // Corrupt at rest is not the same as missing: tell the user.
                tracing::error!(account_id = %account.id, "Session blob failed integrity: {reason}");
                self.outbox
                    .send(
                        chat_id,
                        &format!(
                            "🚫 The stored session for {} failed its integrity check. \
                             Re-link the account with /addaccount.",
                            account.phone
                        ),
                    )
                    .await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let creds = ClientCredentials::for_account(&account, session);
        Ok(Some((account, creds)))
    }
}

fn flow_error_text(err: &FlowError) -> String {
    match err {
        FlowError::Quota { used, limit } => {
            format!("🚫 Account limit reached ({used} of {limit}). Remove one before adding more.")
        }
        FlowError::Transport(e) => {
            format!("❌ Couldn't reach the platform ({e}). Please try again later.")
        }
        FlowError::Auth(e) => format!("❌ Sign-in rejected: {e}"),
        FlowError::Vault(_) | FlowError::Store(_) => {
            format!("❌ Could not store the account: {err}")
        }
    }
}

fn summary_text(summary: &BulkSummary) -> String {
    let mut text = format!(
        "🏁 Run finished: {} of {} created, {} failed.",
        summary.succeeded, summary.requested, summary.failed
    );
    if summary.cancelled {
        text.push_str(&format!(
            " Stopped early after {} item(s).",
            summary.completed
        ));
    }
    for (item, reason) in &summary.failures {
        text.push_str(&format!("\n  item {item}: {reason}"));
    }
    text
}

/// Shorten an api id for display; listings never echo the full value.
fn mask(value: &str) -> String {
    if value.len() > 6 {
        format!("{}...", &value[..6])
    } else {
        value.to_string()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use secrecy::SecretString;

    use crate::automation::{
        AutomationClient, ClientConnector, CodeVerification, CreateOutcome,
    };
    use crate::error::{BotError, ClientError};
    use crate::onboarding::SessionRegistry;
    use crate::store::LibSqlStore;

    // ── Test doubles ────────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<(i64, String)>>,
    }

    impl RecordingOutbox {
        async fn texts(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|(_, t)| t.clone()).collect()
        }

        async fn contains(&self, needle: &str) -> bool {
            self.texts().await.iter().any(|t| t.contains(needle))
        }
    }

    #[async_trait]
    impl Outbox for RecordingOutbox {
        async fn send(&self, chat_id: i64, text: &str) -> Result<(), BotError> {
            self.sent.lock().await.push((chat_id, text.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct HappyCalls {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    /// Connector whose clients verify on the first code and create every group.
    struct HappyConnector {
        calls: Arc<HappyCalls>,
    }

    struct HappyClient {
        calls: Arc<HappyCalls>,
        serial: AtomicUsize,
    }

    #[async_trait]
    impl ClientConnector for HappyConnector {
        async fn connect(
            &self,
            _creds: &ClientCredentials,
        ) -> Result<Box<dyn AutomationClient>, ClientError> {
            self.calls.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(HappyClient {
                calls: Arc::clone(&self.calls),
                serial: AtomicUsize::new(0),
            }))
        }
    }

    #[async_trait]
    impl AutomationClient for HappyClient {
        async fn request_code(&mut self) -> Result<(), ClientError> {
            Ok(())
        }
        async fn verify_code(&mut self, _code: &str) -> Result<CodeVerification, ClientError> {
            Ok(CodeVerification::Verified)
        }
        async fn verify_second_factor(&mut self, _secret: &str) -> Result<(), ClientError> {
            Ok(())
        }
        async fn export_session(&mut self) -> Result<String, ClientError> {
            Ok("exported-session".into())
        }
        async fn create_group(&mut self, _name: &str) -> Result<CreateOutcome, ClientError> {
            let n = self.serial.fetch_add(1, Ordering::SeqCst) as i64;
            Ok(CreateOutcome::Created {
                remote_id: -100 - n,
                invite_ref: format!("https://invite/{n}"),
                member_count: 1,
            })
        }
        async fn disconnect(&mut self) {
            self.calls.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        outbox: Arc<RecordingOutbox>,
        store: Arc<LibSqlStore>,
    }

    async fn fixture() -> Fixture {
        fixture_with_admins(&[]).await
    }

    async fn fixture_with_admins(admins: &[&str]) -> Fixture {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let vault = Arc::new(Vault::new(&SecretString::from("dispatcher-test-key")));
        let connector = Arc::new(HappyConnector {
            calls: Arc::new(HappyCalls::default()),
        });
        let registry = Arc::new(SessionRegistry::new());
        let machine = Arc::new(OnboardingMachine::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&vault),
            Arc::clone(&connector) as Arc<dyn ClientConnector>,
            registry,
        ));
        let runner = Arc::new(BulkRunner::new(
            Arc::clone(&store) as Arc<dyn Store>,
            connector,
            Duration::ZERO,
        ));
        let outbox = Arc::new(RecordingOutbox::default());
        let admin_entries: Vec<String> = admins.iter().map(|s| s.to_string()).collect();
        let dispatcher = Dispatcher::new(
            Arc::clone(&store) as Arc<dyn Store>,
            vault,
            machine,
            runner,
            Arc::clone(&outbox) as Arc<dyn Outbox>,
            AdminRegistry::from_config(&admin_entries),
        );
        Fixture {
            dispatcher,
            outbox,
            store,
        }
    }

    fn msg(text: &str) -> InboundMessage {
        InboundMessage {
            chat_id: 555,
            user_id: 42,
            username: Some("alice".into()),
            first_name: "Alice".into(),
            premium: false,
            text: text.into(),
        }
    }

    async fn wait_for(outbox: &RecordingOutbox, needle: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if outbox.contains(needle).await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never saw {needle:?}"));
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_upserts_user_and_greets() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/start")).await;

        assert!(fx.outbox.contains("Commands").await);
        let user = fx.store.find_user(42).await.unwrap().unwrap();
        assert_eq!(user.display_name, "Alice");
    }

    #[tokio::test]
    async fn unknown_command_gets_a_hint() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/frobnicate")).await;
        assert!(fx.outbox.contains("Unknown command").await);
    }

    #[tokio::test]
    async fn command_with_bot_suffix_still_routes() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/start@groupsmith_bot")).await;
        assert!(fx.outbox.contains("Commands").await);
    }

    #[tokio::test]
    async fn full_onboarding_through_chat() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/addaccount")).await;
        assert!(fx.outbox.contains("api_id api_hash").await);

        fx.dispatcher
            .handle(msg("123456 abcdef123456 +1234567890"))
            .await;
        assert!(fx.outbox.contains("Code sent to +1234567890").await);

        fx.dispatcher.handle(msg("12345")).await;
        assert!(fx.outbox.contains("linked").await);

        let accounts = fx.store.accounts_by_owner(42, true).await.unwrap();
        assert_eq!(accounts.len(), 1);
    }

    #[tokio::test]
    async fn bare_credential_line_starts_onboarding() {
        let fx = fixture().await;
        fx.dispatcher
            .handle(msg("123456 abcdef123456 +1234567890"))
            .await;
        assert!(fx.outbox.contains("Code sent").await);
    }

    #[tokio::test]
    async fn ordinary_chatter_is_ignored() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("hello bot")).await;
        assert!(fx.outbox.texts().await.is_empty());
    }

    #[tokio::test]
    async fn my_accounts_lists_masked_ids() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/myaccounts")).await;
        assert!(fx.outbox.contains("No accounts yet").await);

        fx.dispatcher
            .handle(msg("123456789 abcdef123456 +1234567890"))
            .await;
        fx.dispatcher.handle(msg("12345")).await;

        fx.dispatcher.handle(msg("/myaccounts")).await;
        assert!(fx.outbox.contains("+1234567890").await);
        assert!(fx.outbox.contains("123456...").await);
        assert!(!fx.outbox.contains("123456789 ").await);
    }

    #[tokio::test]
    async fn create_groups_without_account_is_refused() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/creategroups 3")).await;
        assert!(fx.outbox.contains("No linked account").await);
    }

    #[tokio::test]
    async fn create_groups_runs_to_a_summary() {
        let fx = fixture().await;
        fx.dispatcher
            .handle(msg("123456 abcdef123456 +1234567890"))
            .await;
        fx.dispatcher.handle(msg("12345")).await;

        fx.dispatcher.handle(msg("/creategroups 3")).await;
        assert!(fx.outbox.contains("Starting: 3 groups").await);

        wait_for(&fx.outbox, "Run finished: 3 of 3").await;
        assert!(fx.outbox.contains("1/3 done").await);
        assert!(fx.outbox.contains("3/3 done").await);

        let groups = fx.store.groups_by_owner(42).await.unwrap();
        assert_eq!(groups.len(), 3);
    }

    #[tokio::test]
    async fn create_groups_rejects_garbage_count() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/creategroups lots")).await;
        assert!(fx.outbox.contains("Usage: /creategroups").await);
    }

    #[tokio::test]
    async fn out_of_range_count_aborts_the_run() {
        let fx = fixture().await;
        fx.dispatcher
            .handle(msg("123456 abcdef123456 +1234567890"))
            .await;
        fx.dispatcher.handle(msg("12345")).await;

        fx.dispatcher.handle(msg("/creategroups 21")).await;
        wait_for(&fx.outbox, "aborted").await;
        assert!(fx.store.groups_by_owner(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_single_group() {
        let fx = fixture().await;
        fx.dispatcher
            .handle(msg("123456 abcdef123456 +1234567890"))
            .await;
        fx.dispatcher.handle(msg("12345")).await;

        fx.dispatcher.handle(msg("/creategroup Project X")).await;
        assert!(fx.outbox.contains("Created Project X").await);
        assert_eq!(fx.store.groups_by_owner(42).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_account_soft_deactivates() {
        let fx = fixture().await;
        fx.dispatcher
            .handle(msg("123456 abcdef123456 +1234567890"))
            .await;
        fx.dispatcher.handle(msg("12345")).await;

        fx.dispatcher.handle(msg("/removeaccount 1")).await;
        assert!(fx.outbox.contains("unlinked").await);

        assert!(fx.store.accounts_by_owner(42, true).await.unwrap().is_empty());
        // The row survives as an inactive record.
        assert_eq!(fx.store.accounts_by_owner(42, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_account_rejects_bad_index() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/removeaccount 1")).await;
        assert!(fx.outbox.contains("No account 1").await);

        fx.dispatcher.handle(msg("/removeaccount zero")).await;
        assert!(fx.outbox.contains("Usage: /removeaccount").await);
    }

    #[tokio::test]
    async fn cancel_with_nothing_running() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/cancel")).await;
        assert!(fx.outbox.contains("Nothing to cancel").await);
    }

    #[tokio::test]
    async fn cancel_discards_an_onboarding_session() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/addaccount")).await;
        fx.dispatcher.handle(msg("/cancel")).await;
        assert!(fx.outbox.contains("Cancelled: onboarding").await);

        // The credential line no longer feeds a session; it starts a new one.
        fx.dispatcher.handle(msg("/cancel")).await;
        assert!(fx.outbox.contains("Nothing to cancel").await);
    }

    #[tokio::test]
    async fn stats_totals_are_admin_only() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/stats")).await;
        assert!(fx.outbox.contains("Your stats").await);
        assert!(!fx.outbox.contains("Service totals").await);

        let fx = fixture_with_admins(&["alice"]).await;
        fx.dispatcher.handle(msg("/stats")).await;
        assert!(fx.outbox.contains("Service totals").await);
    }

    #[tokio::test]
    async fn status_reports_uptime_and_db() {
        let fx = fixture().await;
        fx.dispatcher.handle(msg("/status")).await;
        assert!(fx.outbox.contains("Database: ✅ connected").await);
        assert!(fx.outbox.contains("Uptime: 0h 0m").await);
    }

    #[tokio::test]
    async fn corrupt_session_blob_is_surfaced_distinctly() {
        let fx = fixture().await;
        let account = Account::new(
            42,
            "+1234567890".into(),
            "123456".into(),
            "abcdef".into(),
            // Not vault output: fails integrity, not "missing".
            "00:11:22".into(),
        );
        fx.store.upsert_user(42, "Alice", false).await.unwrap();
        fx.store.insert_account(&account).await.unwrap();

        fx.dispatcher.handle(msg("/creategroup Team")).await;
        assert!(fx.outbox.contains("integrity check").await);
        assert!(!fx.outbox.contains("No linked account").await);
    }
}
