use std::net::SocketAddr;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::entitlements::{Feature, Flag};
use gatehouse::models::token::TokenScope;
use gatehouse::models::user::UserKind;
use gatehouse::{api, cli, config, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gatehouse=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cfg = config::load()?;
    let args = cli::Cli::parse();

    match args.command {
        Some(cli::Commands::Serve {
            port,
            saas,
            licensed_features,
            feature_flags,
            inline_jobs,
        }) => {
            cfg.port = port;
            cfg.inline_jobs = cfg.inline_jobs || inline_jobs;
            run_server(cfg, saas, licensed_features, feature_flags).await
        }
        None => run_server(cfg, false, None, None).await,
    }
}

async fn run_server(
    cfg: config::Config,
    saas: bool,
    licensed_features: Option<Vec<String>>,
    feature_flags: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let port = cfg.port;
    let state = AppState::new(cfg)?;

    state.entitlements.set_saas(saas);
    for name in licensed_features.unwrap_or_default() {
        if name == "all" {
            state.entitlements.license_all(&Feature::ALL);
        } else if let Some(feature) = Feature::parse(&name) {
            state.entitlements.set_licensed(feature, true);
        } else {
            tracing::warn!(feature = %name, "unknown licensed feature, skipping");
        }
    }
    for name in feature_flags.unwrap_or_default() {
        if let Some(flag) = Flag::parse(&name) {
            state.entitlements.set_flag(flag, true);
        } else {
            tracing::warn!(flag = %name, "unknown feature flag, skipping");
        }
    }

    // Bootstrap credential: without persistence every boot starts empty,
    // so mint the instance admin and print its token once.
    let root = state
        .store
        .create_user("root", "Administrator", "root@local", true, UserKind::Human);
    let (raw, _) = state.store.create_token(
        root.id,
        "bootstrap",
        vec![TokenScope::Api, TokenScope::AdminMode],
        None,
    );
    tracing::info!("bootstrap admin token: {}", raw);

    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("gatehouse listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
