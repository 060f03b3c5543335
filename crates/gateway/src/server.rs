use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use {
    anyhow::Context,
    axum::Router,
    tracing::{info, warn},
    wagate_common::Shutdown,
    wagate_config::{Layout, ProtocolBackend, WagateConfig},
    wagate_queue::HistorySyncQueue,
    wagate_store::{AccountStore, MessageStore, SqliteAccountStore, SqliteMessageStore},
    wagate_whatsapp::{
        Backoff, Connector, HistorySyncWorker, Outbound, SessionDeps, SessionRegistry,
        sim::SimConnector,
    },
};

use crate::{media::MediaStore, routes::build_router, state::AppState};

/// How long background tasks get to exit after the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ── Wiring ──────────────────────────────────────────────────────────────────

/// Every long-lived component of a running gateway.
pub struct Gateway {
    pub registry: Arc<SessionRegistry>,
    pub outbound: Arc<Outbound>,
    pub queue: HistorySyncQueue,
    pub accounts: Arc<dyn AccountStore>,
    pub messages: Arc<dyn MessageStore>,
    pub shutdown: Shutdown,
    pub media_dir: PathBuf,
    poll_interval: Duration,
}

impl Gateway {
    /// Open the stores and the queue at `layout` and build the session
    /// registry. Nothing is connected yet.
    pub async fn open(config: &WagateConfig, layout: &Layout) -> anyhow::Result<Self> {
        layout.prepare()?;
        let connector = connector_for(config, layout)?;

        let pool = wagate_store::open(&layout.database_url)
            .await
            .with_context(|| format!("opening database {}", layout.database_url))?;
        let accounts: Arc<dyn AccountStore> = Arc::new(SqliteAccountStore::new(pool.clone()));
        let messages: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(pool));

        let queue = HistorySyncQueue::open(&layout.queue_dir, &config.queue.name)
            .with_context(|| format!("opening queue at {}", layout.queue_dir.display()))?;

        let media_dir = layout.media_dir.clone();
        let shutdown = Shutdown::new();
        let registry = SessionRegistry::new(connector, SessionDeps {
            accounts: Arc::clone(&accounts),
            messages: Arc::clone(&messages),
            queue: queue.clone(),
            backoff: Backoff::from(&config.reconnect),
            shutdown: shutdown.clone(),
        });
        let outbound = Arc::new(
            Outbound::new(Arc::clone(&registry), Arc::clone(&messages))
                .with_media_sink(Arc::new(MediaStore::new(&media_dir))),
        );

        Ok(Self {
            registry,
            outbound,
            queue,
            accounts,
            messages,
            shutdown,
            media_dir,
            poll_interval: config.history.poll_interval(),
        })
    }

    /// Reconnect stored accounts and start the history sync worker.
    pub async fn start_background(&self) -> anyhow::Result<usize> {
        let restored = self.registry.restore().await?;
        HistorySyncWorker::new(
            self.queue.clone(),
            Arc::clone(&self.accounts),
            Arc::clone(&self.messages),
        )
        .with_poll_interval(self.poll_interval)
        .spawn(&self.shutdown);
        Ok(restored)
    }

    pub fn router(&self) -> Router {
        build_router(AppState::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.outbound),
        ))
    }

    /// Signal every background task and wait for them to exit.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.shutdown.wait())
            .await
            .is_err()
        {
            warn!(
                running = self.shutdown.running(),
                "background tasks did not stop in time"
            );
        }
    }
}

/// The protocol implementation selected by `whatsapp.backend`.
#[cfg_attr(not(feature = "whatsapp-web"), allow(unused_variables))]
fn connector_for(config: &WagateConfig, layout: &Layout) -> anyhow::Result<Arc<dyn Connector>> {
    match config.whatsapp.backend {
        ProtocolBackend::Sim => {
            warn!("using the simulated protocol backend; no real WhatsApp traffic");
            Ok(Arc::new(SimConnector::new()))
        },
        #[cfg(feature = "whatsapp-web")]
        ProtocolBackend::Web => Ok(Arc::new(wagate_whatsapp::web::WebConnector::new(
            &layout.devices_dir,
        ))),
        #[cfg(not(feature = "whatsapp-web"))]
        ProtocolBackend::Web => anyhow::bail!(
            "the web backend is not compiled in; rebuild with `--features whatsapp-web` \
             or set whatsapp.backend = \"sim\""
        ),
    }
}

// ── Server startup ──────────────────────────────────────────────────────────

/// Start the gateway and serve until ctrl-c.
pub async fn start_gateway(config: WagateConfig, layout: Layout) -> anyhow::Result<()> {
    let gateway = Gateway::open(&config, &layout).await?;
    let restored = gateway.start_background().await?;

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let lines = [
        format!("wagate gateway v{}", env!("CARGO_PKG_VERSION")),
        format!("listening on {addr}"),
        format!("data dir: {}", layout.data_dir.display()),
        format!("backend: {}", config.whatsapp.backend.as_str()),
        format!("queue: {}", gateway.queue.name()),
        format!("{restored} instance(s) restored"),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let served = axum::serve(listener, gateway.router())
        .with_graceful_shutdown(shutdown_signal(gateway.shutdown.clone()))
        .await;

    info!("stopping background tasks");
    gateway.stop().await;
    served?;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: Shutdown) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => {
                warn!(error = %e, "cannot listen for ctrl-c");
                shutdown.triggered().await;
            },
        },
        _ = shutdown.triggered() => {},
    }
}
