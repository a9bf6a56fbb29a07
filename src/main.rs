use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;

use groupsmith::authz::AdminRegistry;
use groupsmith::automation::{BridgeConnector, ClientConnector};
use groupsmith::bot::{Dispatcher, Outbox, TelegramBot};
use groupsmith::bulk::BulkRunner;
use groupsmith::config::Config;
use groupsmith::http::{self, AppState};
use groupsmith::onboarding::{OnboardingMachine, SessionRegistry};
use groupsmith::store::{LibSqlStore, Store};
use groupsmith::vault::Vault;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export GROUPSMITH_BOT_TOKEN=123456:ABC-...");
        eprintln!("  export GROUPSMITH_VAULT_KEY=<32-byte secret>");
        std::process::exit(1);
    });

    eprintln!("🤖 groupsmith v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Bridge: {}", config.bridge_url);
    eprintln!("   Status page: http://0.0.0.0:{}/", config.http_port);
    eprintln!(
        "   Bulk pacing: {}s between items",
        config.bulk_item_delay.as_secs()
    );

    // ── Store ───────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {e}", config.db_path);
                std::process::exit(1);
            }),
    );

    // ── Core subsystems ─────────────────────────────────────────────
    let vault = Arc::new(Vault::new(&config.vault_key));
    let connector: Arc<dyn ClientConnector> =
        Arc::new(BridgeConnector::new(config.bridge_url.clone()));
    let registry = Arc::new(SessionRegistry::new());
    let machine = Arc::new(OnboardingMachine::new(
        Arc::clone(&store),
        Arc::clone(&vault),
        Arc::clone(&connector),
        registry,
    ));
    let runner = Arc::new(BulkRunner::new(
        Arc::clone(&store),
        Arc::clone(&connector),
        config.bulk_item_delay,
    ));

    let admins = AdminRegistry::from_config(&config.admin_users);
    if config.admin_users.is_empty() {
        eprintln!("   Admins: none configured");
    } else {
        eprintln!("   Admins: {}", config.admin_users.join(", "));
    }

    // ── HTTP status page ────────────────────────────────────────────
    let app = http::routes(AppState {
        store: Arc::clone(&store),
        started_at: Instant::now(),
    });
    let http_port = config.http_port;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{http_port}"))
            .await
            .expect("Failed to bind status page port");
        tracing::info!(port = http_port, "Status page started");
        axum::serve(listener, app).await.ok();
    });

    // ── Telegram front end ──────────────────────────────────────────
    let bot = Arc::new(TelegramBot::new(config.bot_token.clone()));
    bot.health_check().await?;
    eprintln!("   Telegram: token verified\n");

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        vault,
        machine,
        runner,
        Arc::clone(&bot) as Arc<dyn Outbox>,
        admins,
    ));

    let mut updates = bot.start();
    while let Some(message) = updates.next().await {
        // Each message handles on its own task; per-user serialization is
        // enforced by the session registry slots, not by this loop.
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher.handle(message).await;
        });
    }

    Ok(())
}
