//! Transactional email delivery core: a durable message queue, a
//! concurrent SMTP worker, and a parallel webhook dispatcher, all sharing
//! one Postgres-backed `Store`.
//!
//! The HTTP request surface, DNS domain verification, and schema migration
//! tooling that surround this core are external collaborators and stay out
//! of this crate; it exposes the pieces those surfaces call into
//! (`store::Store`'s typed repositories) and the three background loops
//! that drive delivery, wired together by [`Core::spawn`].

pub mod address;
pub mod config;
pub mod dkim;
pub mod events;
pub mod ids;
pub mod listener;
pub mod models;
pub mod ratelimit;
pub mod smtp;
pub mod store;
pub mod webhook;
pub mod worker;

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use config::Config;
pub use store::Store;

/// JSON-formatted logging via `tracing-subscriber`, with verbosity gated by
/// `Config::debug` and overridable through `RUST_LOG`.
pub fn init_tracing(debug: bool) {
    let default_directive = if debug {
        format!("{}=debug,info", env!("CARGO_CRATE_NAME"))
    } else {
        format!("{}=info,warn", env!("CARGO_CRATE_NAME"))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Bundles the `Store` with the config every background loop needs, and
/// wires the Listener, Email Worker, and Webhook Dispatcher onto it. A thin
/// assembly point, not a god object — each loop only holds the `Store`
/// clone and `Notify` handle it needs.
pub struct Core {
    store: Store,
    config: Arc<Config>,
}

impl Core {
    pub fn new(pool: PgPool, config: Config) -> Self {
        Self {
            store: Store::new(pool),
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Spawns the Listener, Email Worker, and Webhook Dispatcher as
    /// independent tasks sharing `shutdown`. Returns their join handles so
    /// a caller can wait for a clean shutdown within a grace period.
    pub fn spawn(
        self,
        smtp: Arc<dyn smtp::SmtpTransport>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let message_wake = Arc::new(Notify::new());
        let webhook_wake = Arc::new(Notify::new());

        let listener = listener::Listener::new(
            self.store.clone(),
            self.config.clone(),
            message_wake.clone(),
            webhook_wake.clone(),
            shutdown.clone(),
        );
        let worker = worker::EmailWorker::new(
            self.store.clone(),
            smtp,
            self.config.clone(),
            message_wake,
            shutdown.clone(),
        );
        let dispatcher = webhook::WebhookDispatcher::new(
            self.store,
            self.config,
            webhook_wake,
            shutdown,
        );

        vec![listener.spawn(), worker.spawn(), dispatcher.spawn()]
    }
}

/// Resolves once shutdown is requested, either cooperatively (the token is
/// cancelled by a caller) or by an OS signal.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
