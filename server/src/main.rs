mod routes;
mod state;

use std::net::SocketAddr;

const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error("invalid PORT: {0}")]
    InvalidPort(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt::init();

    let port = match std::env::var("PORT") {
        Ok(raw) => raw.parse::<u16>().map_err(|_| ServerError::InvalidPort(raw))?,
        Err(_) => DEFAULT_PORT,
    };

    let state = state::AppState::new();
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;

    tracing::info!(%port, "realtime relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
