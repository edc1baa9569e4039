use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use clap::{Parser, Subcommand, ValueEnum};
use matchday_booking::{Booking, BookingPolicy};
use matchday_config::Config;
use matchday_models::{MatchStatus, NewMatch};
use matchday_payments::{MockGateway, PaymentGateway, StripeGateway, StripeSettings};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::OffsetTime;

mod api;
mod auth;
mod error;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const STRIPE_TIMEOUT: Duration = Duration::from_secs(15);
const GIT_HASH: &str = env!("MATCHDAY_GIT_HASH");

fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH})")
}

// --- CLI definition ---

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Parser)]
#[command(name = "matchday")]
#[command(about = "Football match booking service")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("MATCHDAY_GIT_HASH"), ")"))]
struct Cli {
    /// Log level (default: from config, else info)
    #[arg(short, long, global = true)]
    log_level: Option<LogLevel>,

    /// Display log timestamps in UTC (default: local time)
    #[arg(long, global = true)]
    utc: bool,

    /// Database URL (default: from config, else sqlite:matchday.db)
    #[arg(long, global = true)]
    db_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Use the in-memory payment gateway instead of Stripe
        #[arg(long)]
        mock_payments: bool,
    },
    /// Schedule a new match
    AddMatch {
        #[arg(long)]
        title: String,
        #[arg(long)]
        city: String,
        #[arg(long)]
        field: String,
        /// Kick-off, RFC 3339 or "YYYY-MM-DD HH:MM" in the configured timezone
        #[arg(long)]
        starts_at: String,
        /// Duration in minutes
        #[arg(long, default_value = "60")]
        duration: i64,
        /// Ticket price in euros
        #[arg(long)]
        price: f64,
        /// Total players (at most 50)
        #[arg(long, default_value = "10")]
        capacity: i64,
        /// Create the match as scheduled instead of open
        #[arg(long)]
        scheduled: bool,
    },
    /// List matches
    ListMatches {
        /// Only payable matches with free spots
        #[arg(long)]
        open: bool,
    },
    /// Expire abandoned unpaid holds once
    ReapHolds,
}

// --- Logging ---

fn init_logging(level: &str, utc: bool) {
    let filter = EnvFilter::new(level);

    if utc {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(OffsetTime::new(
                time::UtcOffset::UTC,
                time::macros::format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
                ),
            ))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(LocalTimer)
            .init();
    }
}

struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

// --- Wiring ---

fn booking_policy(config: &Config) -> BookingPolicy {
    BookingPolicy {
        currency: config.currency.clone(),
        success_url: config.success_url.clone(),
        cancel_url: config.cancel_url.clone(),
        hold_ttl: chrono::Duration::seconds(config.hold_ttl_secs.max(60)),
        hold_grace: chrono::Duration::seconds(config.hold_grace_secs.max(0)),
    }
}

fn payment_gateway(config: &Config) -> anyhow::Result<Arc<dyn PaymentGateway>> {
    match config.payments.as_str() {
        "mock" => {
            warn!("Using the in-memory payment gateway; no real money moves");
            Ok(Arc::new(MockGateway::new(config.stripe_webhook_secret.clone())))
        }
        "stripe" => {
            let gateway = StripeGateway::new(StripeSettings {
                api_base: config.stripe_api_base.clone(),
                secret_key: config.stripe_secret_key.clone(),
                webhook_secret: config.stripe_webhook_secret.clone(),
                webhook_tolerance_secs: config.webhook_tolerance_secs,
                timeout: STRIPE_TIMEOUT,
            })
            .context("set STRIPE_SECRET_KEY or run with --mock-payments")?;
            if config.stripe_webhook_secret.is_empty() {
                warn!("STRIPE_WEBHOOK_SECRET is empty; every webhook delivery will be rejected");
            }
            Ok(Arc::new(gateway))
        }
        other => bail!("unknown payments backend '{other}' (expected stripe or mock)"),
    }
}

fn timezone(config: &Config) -> Tz {
    config.timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = %config.timezone, "Unknown timezone, showing times in UTC");
        Tz::UTC
    })
}

fn parse_kickoff(raw: &str, tz: Tz) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .with_context(|| format!("cannot read kick-off time '{raw}'"))?;
    tz.from_local_datetime(&naive)
        .single()
        .map(|at| at.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("'{raw}' is ambiguous or skipped in {}", tz.name()))
}

/// Expires abandoned holds every `interval` until the process exits.
fn spawn_hold_reaper(booking: Booking, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = booking.reap_expired_holds(Utc::now()).await {
                warn!(error = %e, "Hold reaper pass failed");
            }
        }
    });
}

fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origin == "*" {
        return Ok(layer.allow_origin(Any));
    }
    let origin = origin
        .parse::<axum::http::HeaderValue>()
        .with_context(|| format!("invalid CORS origin '{origin}'"))?;
    Ok(layer.allow_origin(origin))
}

// --- Server ---

async fn run_server(config: &Config, pool: SqlitePool) -> anyhow::Result<()> {
    info!("matchday v{}", version_string());

    let gateway = payment_gateway(config)?;
    info!(gateway = gateway.name(), "Payment gateway ready");
    let booking = Booking::new(pool, gateway, booking_policy(config));

    if config.reap_interval_secs > 0 {
        spawn_hold_reaper(booking.clone(), Duration::from_secs(config.reap_interval_secs));
    }

    let state = api::AppState { booking, jwt_secret: Arc::from(config.jwt_secret.as_str()) };
    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origin)?);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("Listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Main ---

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load();
    if let Some(level) = &cli.log_level { config.log_level = level.to_string(); }
    if cli.utc { config.utc = true; }
    if let Some(url) = &cli.db_url { config.db_url = url.clone(); }
    if let Commands::Serve { port, mock_payments } = &cli.command {
        if let Some(port) = port { config.port = *port; }
        if *mock_payments { config.payments = "mock".to_string(); }
    }

    init_logging(&config.log_level, config.utc);

    let busy_timeout = Duration::from_secs(config.db_busy_timeout_secs);
    if busy_timeout <= STRIPE_TIMEOUT {
        warn!(
            busy_timeout_secs = config.db_busy_timeout_secs,
            "Database busy timeout does not outlast a payment provider call; concurrent bookings may fail"
        );
    }
    let pool = matchday_db::connect_with_busy_timeout(&config.db_url, busy_timeout).await?;
    matchday_db::migrate(&pool).await?;

    match cli.command {
        Commands::Serve { .. } => {
            run_server(&config, pool).await?;
        }
        Commands::AddMatch { title, city, field, starts_at, duration, price, capacity, scheduled } => {
            let new = NewMatch {
                title,
                city,
                field_name: field,
                starts_at: parse_kickoff(&starts_at, timezone(&config))?,
                duration_min: duration,
                price_eur: price,
                capacity,
                status: if scheduled { MatchStatus::Scheduled } else { MatchStatus::Open },
            };
            let game = matchday_db::create_match(&pool, &new, Utc::now()).await?;
            println!("Added match {} \"{}\" ({} spots)", game.id, game.title, game.capacity);
        }
        Commands::ListMatches { open } => {
            let matches = matchday_db::list_matches(&pool, open).await?;
            if matches.is_empty() {
                println!("No matches found.");
            } else {
                let tz = timezone(&config);
                println!(
                    "{:<6} {:<18} {:<28} {:<14} {:<16} {:>7} {:>7} {}",
                    "ID", "Kick-off", "Title", "City", "Field", "Price", "Taken", "Status"
                );
                println!("{}", "-".repeat(110));
                for m in &matches {
                    println!(
                        "{:<6} {:<18} {:<28} {:<14} {:<16} {:>7.2} {:>7} {}",
                        m.id,
                        m.starts_at.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
                        m.title,
                        m.city,
                        m.field_name,
                        m.price_eur,
                        format!("{}/{}", m.spots_taken, m.capacity),
                        m.status.as_str(),
                    );
                }
                println!("\n{} match(es) total, times in {}", matches.len(), tz.name());
            }
        }
        Commands::ReapHolds => {
            // reaping never talks to the payment provider
            let booking = Booking::new(
                pool,
                Arc::new(MockGateway::new(String::new())),
                booking_policy(&config),
            );
            let expired = booking.reap_expired_holds(Utc::now()).await?;
            println!("{expired} abandoned hold(s) expired");
        }
    }

    Ok(())
}
