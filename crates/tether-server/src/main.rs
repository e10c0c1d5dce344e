use std::net::SocketAddr;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use tether_gateway::{DEFAULT_ROOM_CAPACITY, RoomRegistry};

/// Used when `RUST_LOG` is unset. The binary's own target is `tether`.
const DEFAULT_LOG_FILTER: &str = "tether=debug,tether_gateway=debug,tower_http=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let host = std::env::var("TETHER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("TETHER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let capacity: usize = match std::env::var("TETHER_ROOM_CAPACITY") {
        Ok(raw) => raw.parse()?,
        Err(_) => DEFAULT_ROOM_CAPACITY,
    };

    let registry = RoomRegistry::new(capacity);

    let app = tether_gateway::router(registry)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Tether relay listening on {} (room capacity {})", addr, capacity);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_names_our_targets() {
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        let targets: Vec<&str> = DEFAULT_LOG_FILTER
            .split(',')
            .filter_map(|directive| directive.split('=').next())
            .collect();
        assert!(targets.contains(&env!("CARGO_CRATE_NAME")));
        assert!(targets.contains(&"tether_gateway"));
    }
}
