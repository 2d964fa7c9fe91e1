use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderName, HeaderValue, Method};
use clap::Parser;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backend::api::{self, AppState};
use backend::auth::TokenService;
use backend::cli::{self, Commands, QueueCommands, TokenCommands};
use backend::config::{self, Config};
use backend::jobs::{QueueManager, RedisBroker};
use backend::middleware::auth::Authenticator;
use backend::models::user::Principal;
use backend::store::postgres::PgStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(Commands::Token { command }) => handle_token_command(command, &cfg),
        Some(Commands::Queue { command }) => handle_queue_command(command, &cfg).await,
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    opentelemetry::global::shutdown_tracer_provider();
    result
}

/// fmt layer always; OTLP export only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "cil-backend"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "backend=debug,cil=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url).await?;
    tracing::info!("Running migrations...");
    db.migrate().await?;

    tracing::info!("Connecting to queue broker...");
    let broker = RedisBroker::connect(&cfg.redis)
        .await
        .context("queue broker unreachable")?;
    let queues = QueueManager::new(Arc::new(broker), cfg.queue.clone());
    queues.start().await.context("failed to start job queues")?;

    let tokens = Arc::new(TokenService::new(&cfg.token));
    let auth = Authenticator::new(tokens, Arc::new(db));
    let state = Arc::new(AppState {
        auth,
        queues: queues.clone(),
    });

    let app = api::router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(security_headers_middleware)),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("cil backend listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server drained, stopping job queues");
    queues.stop().await?;
    Ok(())
}

fn cors_layer() -> CorsLayer {
    let dashboard_origin =
        std::env::var("DASHBOARD_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string());
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            origin_str == dashboard_origin
                || origin_str.starts_with("http://localhost:")
                || origin_str.starts_with("http://127.0.0.1:")
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            HeaderName::from_static("content-type"),
            HeaderName::from_static("authorization"),
            HeaderName::from_static("x-request-id"),
        ])
        .allow_credentials(true)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
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
    tracing::info!("shutdown signal received");
}

/// Middleware: security headers on every response.
async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    // tokens travel in responses; never cache them
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove("Server");

    resp
}

fn handle_token_command(cmd: TokenCommands, cfg: &Config) -> anyhow::Result<()> {
    let tokens = TokenService::new(&cfg.token);
    match cmd {
        TokenCommands::Issue { id, email, role } => {
            let pair = tokens.issue_token_pair(&Principal { id, email, role })?;
            println!("{}", serde_json::to_string_pretty(&pair)?);
        }
        TokenCommands::Verify { token } => {
            let claims = tokens.verify(&token).context("token rejected")?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
    }
    Ok(())
}

async fn handle_queue_command(cmd: QueueCommands, cfg: &Config) -> anyhow::Result<()> {
    let broker = RedisBroker::connect(&cfg.redis).await?;
    let queues = QueueManager::new(Arc::new(broker), cfg.queue.clone());
    for (name, options) in backend::jobs::manager::default_queues() {
        queues.create_queue(name, options);
    }

    let result = match cmd {
        QueueCommands::Stats => {
            let stats = queues.get_all_queue_stats().await?;
            println!(
                "{:<18} {:>8} {:>8} {:>10} {:>8} {:>8}  paused",
                "QUEUE", "WAITING", "ACTIVE", "COMPLETED", "FAILED", "DELAYED"
            );
            for s in stats {
                println!(
                    "{:<18} {:>8} {:>8} {:>10} {:>8} {:>8}  {}",
                    s.name,
                    s.counts.waiting,
                    s.counts.active,
                    s.counts.completed,
                    s.counts.failed,
                    s.counts.delayed,
                    s.paused
                );
            }
            Ok(())
        }
        QueueCommands::Pause { name } => queues.pause_queue(&name).await,
        QueueCommands::Resume { name } => queues.resume_queue(&name).await,
        QueueCommands::Empty { name } => queues.empty_queue(&name).await,
    };

    queues.stop().await?;
    result.map_err(Into::into)
}
