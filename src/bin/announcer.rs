use announcer::db::{Announcement, DataSafe};
use announcer::plugins::mailer::SmtpMailer;
use announcer::registry::Registry;
use announcer::server::config::ServerConfig;
use announcer::server::counter::ProcessCounter;
use announcer::server::logging::init_logging;
use announcer::services::AppServices;
use announcer::services::auth_service::AuthService;
use announcer::services::captcha::ArithmeticCaptcha;
use announcer::services::encryption_service::EncryptionService;
use announcer::tenant::{Tenant, TenantDescriptor};
use announcer::version::VERSION;
use announcer::web::create_axum_router;
use announcer::web::templates::Templates;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Captcha answers are accepted for this long after the form was served.
const CAPTCHA_WINDOW_HOURS: i64 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./config.json")]
    config: PathBuf,

    /// Print the announcement history of a tenant as JSON and exit
    #[arg(long, value_name = "KEY", conflicts_with = "insert_announcements")]
    dump_announcements: Option<String>,

    /// Append a JSON array of announcements read from stdin to a tenant's history and exit.
    /// Plugins are not notified.
    #[arg(long, value_name = "KEY")]
    insert_announcements: Option<String>,
}

async fn open_data_safe(config: &ServerConfig, registry: &Registry) -> Result<Arc<dyn DataSafe>, BoxError> {
    let safe = registry
        .get_data_safe(&config.data_safe)
        .ok_or_else(|| format!("unknown data safe {:?}", config.data_safe))?;
    safe.initialise(&config.data_safe_bytes()?).await?;
    Ok(safe)
}

async fn dump_announcements(safe: &dyn DataSafe, key: &str) -> Result<(), BoxError> {
    let announcements = safe.get_all_announcements(key).await?;
    println!("{}", serde_json::to_string_pretty(&announcements)?);
    Ok(())
}

async fn insert_announcements(safe: &dyn DataSafe, key: &str) -> Result<(), BoxError> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let announcements: Vec<Announcement> = serde_json::from_str(&input)?;
    for announcement in &announcements {
        safe.save_announcement(key, announcement).await?;
    }
    info!(tenant = key, count = announcements.len(), "Announcements inserted.");
    Ok(())
}

fn build_services(config: &ServerConfig, counter: ProcessCounter) -> Result<AppServices, BoxError> {
    let auth = match &config.login_secret {
        Some(secret) => AuthService::new(secret.as_bytes(), config.login_minutes),
        None => AuthService::with_random_secret(config.login_minutes),
    };
    Ok(AppServices {
        encryption: Arc::new(EncryptionService::from_hex(&config.encryption_key)?),
        auth: Arc::new(auth),
        captcha: Arc::new(ArithmeticCaptcha::with_random_secret(chrono::Duration::hours(
            CAPTCHA_WINDOW_HOURS,
        ))),
        mailer: Arc::new(SmtpMailer::new()),
        templates: Templates::shared()?,
        counter,
        http: reqwest::Client::new(),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C.");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM.");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested, no longer accepting connections.");
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;

    init_logging(&config.log_dir);
    rust_i18n::set_locale(&config.language);
    info!(version = VERSION, config = %args.config.display(), "Starting announcer.");

    let registry = Registry::with_builtins()?;
    let safe = open_data_safe(&config, &registry).await?;

    if let Some(key) = &args.dump_announcements {
        return dump_announcements(safe.as_ref(), key).await;
    }
    if let Some(key) = &args.insert_announcements {
        return insert_announcements(safe.as_ref(), key).await;
    }

    let counter = ProcessCounter::new();
    let services = build_services(&config, counter.clone())?;
    let descriptors = TenantDescriptor::load_dir(&config.tenant_config_dir)?;
    let tenants = Tenant::load_all(descriptors, &registry, safe, services).await?;
    info!(count = tenants.len(), "Tenants loaded.");

    let config = Arc::new(config);
    let router = create_axum_router(config.clone(), &tenants, counter.clone());
    let listener = tokio::net::TcpListener::bind(&config.address).await?;
    info!(address = %config.address, "HTTP server listening.");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(active = counter.active(), "Waiting for running operations to finish.");
    counter.wait_idle().await;
    info!("Shutdown complete.");
    Ok(())
}
