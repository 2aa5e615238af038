use std::net::SocketAddr;
use std::sync::Arc;
use tixgate::store::{CounterStore, InMemoryCounterStore};
use tixgate::{serve, Gateway, GatewayConfig, GatewayParts};
use tixgate_redis::RedisCounterStore;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env()?;
    info!(
        instance = %config.instance_name,
        port = config.port,
        routes = %config.routes_file.as_ref().map_or("builtin".into(), |p| p.display().to_string()),
        "starting gateway"
    );

    let store: Arc<dyn CounterStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisCounterStore::connect(url).await?),
        None => {
            warn!("REDIS_URL not set; gate state is local to this process");
            Arc::new(InMemoryCounterStore::new())
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let gateway = Gateway::new(GatewayParts::production(config, store)?)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    serve(listener, gateway, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("ctrl-c received");
    })
    .await?;

    info!("gateway stopped");
    Ok(())
}
