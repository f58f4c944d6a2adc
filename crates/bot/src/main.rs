use gift_common::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "gift_bot=info,gift_engine=info,gift_notifier=info,gift_roster=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Gift bot starting...");

    let config = AppConfig::from_env()?;
    if let Err(e) = gift_bot::run(config).await {
        tracing::error!(error = %format!("{e:#}"), "Gift bot exited with error");
        return Err(e);
    }

    tracing::info!("Gift bot stopped.");
    Ok(())
}
