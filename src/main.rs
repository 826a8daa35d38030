use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use innkeep::admin::AdminService;
use innkeep::booking::BookingService;
use innkeep::config::Config;
use innkeep::mail::{LogTransport, MailWorker, Mailer, Templates};
use innkeep::session::{MemorySessionStore, SessionStore};
use innkeep::store::Store;
use innkeep::wire::{self, AppState};
use innkeep::{auth, reaper};

/// First start: create the configured rooms and staff account.
async fn seed(store: &Store, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if store.room_count() == 0 {
        for name in &config.seed_rooms {
            let room = store.create_room(name.clone()).await?;
            info!("seeded room {} ({})", room.id, room.room_name);
        }
    }
    if let (Some(email), Some(password)) = (&config.admin_email, &config.admin_password)
        && store.find_user_by_email(email).is_none()
    {
        let hash = auth::hash_password(password)?;
        store
            .create_user("Admin".into(), "User".into(), email.clone(), hash, 3)
            .await?;
        info!("created staff account {email}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    innkeep::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(Store::open(config.wal_path(), config.store_timeout)?);
    seed(&store, &config).await?;

    let sessions = Arc::new(MemorySessionStore::new(config.session_ttl));
    let (mailer, mail_rx) = Mailer::new(config.mail_queue);
    let mail_worker = tokio::spawn(MailWorker::new(LogTransport, Templates::default()).run(mail_rx));

    tokio::spawn(reaper::run_session_reaper(sessions.clone(), Duration::from_secs(60)));
    tokio::spawn(reaper::run_compactor(
        store.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));

    let session_store: Arc<dyn SessionStore> = sessions;
    let state = Arc::new(AppState {
        store: store.clone(),
        sessions: session_store.clone(),
        booking: BookingService::new(
            store.clone(),
            session_store.clone(),
            mailer,
            config.mail_from.clone(),
            config.owner_email.clone(),
        ),
        admin: AdminService::new(store.clone(), session_store),
    });

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("innkeep listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  rooms: {}", store.room_count());
    info!("  max_connections: {max_connections}");
    info!("  store_timeout: {:?}", config.store_timeout);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(innkeep::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(innkeep::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(innkeep::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let state = state.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, state).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(innkeep::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    // Dropping the last Mailer closes the queue; let the worker flush it.
    drop(state);
    if tokio::time::timeout(Duration::from_secs(5), mail_worker).await.is_err() {
        tracing::warn!("mail worker did not finish before shutdown");
    }

    info!("innkeep stopped");
    Ok(())
}
