mod api;
mod config;
mod sandbox;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::api::sandbox::publish::HostPolicy;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "sandkeep", about = "Ephemeral sandbox provisioning service")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Print the sandbox backend selected by the environment and exit
    Provider,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // No subcommand means serve; --help and --version still work.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    let config = Config::from_env().context("invalid configuration")?;

    match cli {
        Cli::Serve => run_server(config).await,
        Cli::Provider => {
            let kind = config.sandbox.kind();
            println!("{} ({})", kind.name(), kind.display_name());
            Ok(())
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandkeep=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    let host_policy = HostPolicy::for_runtime(&config.sandbox);
    let factory = Arc::new(
        sandbox::build_factory(config.sandbox.clone(), config.registry.clone(), config.default_lifetime)
            .context("failed to initialize sandbox provider")?,
    );
    if let Err(e) = factory.check_backend().await {
        tracing::warn!(provider = %factory.display_name(), error = %e, "sandbox backend not reachable yet");
    }
    tracing::info!(
        provider = %factory.display_name(),
        default_lifetime_ms = config.default_lifetime.as_millis() as u64,
        "sandbox provider ready"
    );

    let app_state = api::AppState {
        factory: factory.clone(),
        host_policy: Arc::new(host_policy),
    };

    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await?;

    let pending = factory.tracked().len();
    factory.shutdown();
    if pending > 0 {
        tracing::warn!(pending, "timeout registry closed with sandboxes still tracked");
    }
    Ok(())
}
