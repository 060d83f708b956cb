use livequery_sdk::{ClientConfig, Direction, LiveQueryClient, Query, Value};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let base_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:8878/api".to_string());

    let client = LiveQueryClient::connect_http(base_url, ClientConfig::default());
    client.wait_until_open().await?;
    println!("connected as {:?}", client.connection_id().await);

    let tasks = client
        .subscribe(
            Query::new("tasks").order_by("title", Direction::Asc),
            |items, change| {
                println!("--- {:?}", change);
                for item in items {
                    println!("  {}", item);
                }
            },
        )
        .await?;

    let alerts = client
        .subscribe_channel("alerts", |payload: &Value| println!("alert: {}", payload))
        .await?;

    tokio::signal::ctrl_c().await?;

    tasks.cancel().await?;
    alerts.cancel().await?;
    client.close().await;
    Ok(())
}
