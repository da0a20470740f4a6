use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "info".parse().expect("static filter parses"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    modelgate::cli::run().await
}
