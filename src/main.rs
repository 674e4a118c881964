mod auth;

use anyhow::{Context, Result};
use auth::{AuthConfig, AuthService, Client, MemorySessionStore, MemoryStore, OAuthAppState, User};
use chrono::{TimeDelta, Utc};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "oauthd")]
#[command(about = "authorization code + refresh token grant server")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "OAUTH_HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "OAUTH_PORT", default_value = "8080")]
    port: u16,

    /// Public base URL for metadata (e.g., https://auth.example.com)
    /// If not set, defaults to http://HOST:PORT
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,

    /// Ed25519 private key, PKCS#8 PEM
    #[arg(long, env = "OAUTH_PRIVATE_KEY_FILE")]
    private_key: PathBuf,

    /// Ed25519 public key, SPKI PEM
    #[arg(long, env = "OAUTH_PUBLIC_KEY_FILE")]
    public_key: PathBuf,

    /// Authorization code lifetime in seconds
    #[arg(long, env = "AUTH_CODE_EXPIRES", default_value = "120")]
    auth_code_expires: i64,

    /// Access token lifetime in minutes
    #[arg(long, env = "AUTH_TOKEN_EXPIRES_MIN", default_value = "60")]
    token_expires_min: i64,

    /// Refresh token lifetime in days
    #[arg(long, env = "AUTH_REFRESH_TOKEN_EXPIRES_DAY", default_value = "30")]
    refresh_token_expires_day: i64,

    /// Browser session lifetime in seconds
    #[arg(long, env = "SESSION_EXPIRES", default_value = "3600")]
    session_expires: u64,

    /// Deadline for each store call, milliseconds
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value = "5000")]
    store_timeout_ms: u64,

    /// Client id to register at startup
    #[arg(long, env = "SEED_CLIENT_ID")]
    seed_client_id: Option<Uuid>,

    #[arg(long, env = "SEED_CLIENT_NAME", default_value = "demo")]
    seed_client_name: String,

    /// Redirect URI of the seeded client (required with --seed-client-id)
    #[arg(long, env = "SEED_CLIENT_REDIRECT_URI")]
    seed_client_redirect_uri: Option<String>,

    /// Email of a user to create at startup
    #[arg(long, env = "SEED_USER_EMAIL")]
    seed_user_email: Option<String>,

    #[arg(long, env = "SEED_USER_NAME", default_value = "demo")]
    seed_user_name: String,

    /// Password for the seeded user (hashed with bcrypt at startup)
    #[arg(long, env = "SEED_USER_PASSWORD")]
    seed_user_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oauthd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = auth_config(&args)?;

    let store = MemoryStore::new();
    seed(&store, &args).await?;
    let sessions = MemorySessionStore::new();

    let auth = AuthService::in_memory(config, store, sessions.clone());

    run_server(auth, sessions, &args).await
}

fn auth_config(args: &Args) -> Result<AuthConfig> {
    let (_, access_token_ttl, refresh_token_ttl) = token_lifetimes(
        args.auth_code_expires,
        args.token_expires_min,
        args.refresh_token_expires_day,
    )?;

    let signing_key = auth::SigningKey::from_ed_pem(&read_key(&args.private_key)?)
        .context("OAUTH_PRIVATE_KEY_FILE is not an Ed25519 PKCS#8 PEM key")?;
    let verifying_key = auth::VerifyingKey::from_ed_pem(&read_key(&args.public_key)?)
        .context("OAUTH_PUBLIC_KEY_FILE is not an Ed25519 SPKI PEM key")?;

    Ok(AuthConfig {
        signing_key,
        verifying_key,
        auth_code_expires: args.auth_code_expires,
        access_token_ttl,
        refresh_token_ttl,
        session_expires: Duration::from_secs(args.session_expires),
        store_timeout: Duration::from_millis(args.store_timeout_ms),
    })
}

/// Code, access and refresh lifetimes. Each must be representable and land
/// on a date chrono can hold when added to the current time.
fn token_lifetimes(
    code_secs: i64,
    access_min: i64,
    refresh_days: i64,
) -> Result<(TimeDelta, TimeDelta, TimeDelta)> {
    if code_secs < 0 || access_min <= 0 || refresh_days <= 0 {
        anyhow::bail!("token lifetimes must be positive");
    }

    let now = Utc::now();
    let lifetime = |name: &str, ttl: Option<TimeDelta>| -> Result<TimeDelta> {
        ttl.filter(|ttl| now.checked_add_signed(*ttl).is_some())
            .ok_or_else(|| anyhow::anyhow!("{} is out of range", name))
    };

    Ok((
        lifetime("AUTH_CODE_EXPIRES", TimeDelta::try_seconds(code_secs))?,
        lifetime("AUTH_TOKEN_EXPIRES_MIN", TimeDelta::try_minutes(access_min))?,
        lifetime(
            "AUTH_REFRESH_TOKEN_EXPIRES_DAY",
            TimeDelta::try_days(refresh_days),
        )?,
    ))
}

fn read_key(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read key file {}", path.display()))
}

/// optional demo client and user, since nothing else writes to the in-memory store
async fn seed(store: &MemoryStore, args: &Args) -> Result<()> {
    let now = Utc::now();

    if let Some(id) = args.seed_client_id {
        let redirect_uri = args
            .seed_client_redirect_uri
            .clone()
            .ok_or_else(|| anyhow::anyhow!("SEED_CLIENT_REDIRECT_URI required with SEED_CLIENT_ID"))?;
        url::Url::parse(&redirect_uri).context("SEED_CLIENT_REDIRECT_URI is not a url")?;

        store
            .insert_client(Client {
                id,
                name: args.seed_client_name.clone(),
                redirect_uri,
                created_at: now,
                updated_at: now,
            })
            .await;
        tracing::info!("Seeded client {} ({})", id, args.seed_client_name);
    }

    if let Some(email) = &args.seed_user_email {
        let password = args
            .seed_user_password
            .clone()
            .ok_or_else(|| anyhow::anyhow!("SEED_USER_PASSWORD required with SEED_USER_EMAIL"))?;
        let password_hash =
            tokio::task::spawn_blocking(move || bcrypt::hash(password, bcrypt::DEFAULT_COST))
                .await
                .context("password hashing task failed")??;

        let id = Uuid::new_v4();
        store
            .insert_user(User {
                id,
                name: args.seed_user_name.clone(),
                email: email.clone(),
                password_hash,
                created_at: now,
                updated_at: now,
            })
            .await;
        tracing::info!("Seeded user {} ({})", id, email);
    }

    Ok(())
}

async fn run_server(auth: AuthService, sessions: MemorySessionStore, args: &Args) -> Result<()> {
    // TcpListener::bind() accepts ToSocketAddrs, so "localhost" resolves fine
    let bind_addr = format!("{}:{}", args.host, args.port);

    let base_url = args
        .public_url
        .as_deref()
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{}:{}", args.host, args.port));

    tracing::info!("Listening on {}", bind_addr);
    tracing::info!("Authorization entry: {}/client/sign-entry", base_url);
    tracing::info!("Token endpoint: {}/oauth2/token", base_url);
    tracing::info!(
        "Authorization server metadata: {}/.well-known/oauth-authorization-server",
        base_url
    );

    let state = OAuthAppState::new(auth, base_url.clone());

    // Stricter rate limiting for the token and revoke endpoints: 5 requests per second, burst of 10
    // SmartIpKeyExtractor checks x-forwarded-for and friends before falling back to peer ip
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(5)
            .burst_size(10)
            .finish()
            .context("failed to build rate limiter config")?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    let rate_limit_layer = GovernorLayer::new(governor_conf);

    let rate_limited_routes = auth::api_routes(state.clone())
        .merge(auth::protected_routes(state.clone()))
        .layer(rate_limit_layer);

    let app = auth::browser_routes(state)
        .merge(rate_limited_routes)
        .layer(TraceLayer::new_for_http());

    // background housekeeping: rate limiter state and expired sessions
    tokio::spawn({
        let limiter = governor_limiter;
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                limiter.retain_recent();
                sessions.cleanup_expired().await;
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server ready at {}", base_url);

    // connect info gives SmartIpKeyExtractor the peer ip when there are no proxy headers
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
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
    tracing::info!("Shutting down");
}
