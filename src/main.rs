#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let port = std::env::var("HYPATIA_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(4000);
    hypatia::server::serve(port).await
}
