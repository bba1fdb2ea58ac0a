use auth_center::{config::Config, create_app, db};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "auth_center=info,tower_http=info".into()),
        )
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = Arc::new(db::initialize_database(&config.database_url, config.skip_db_init).await?);

    // 过期黑名单与授权码的后台回收
    {
        let gc_pool = pool.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                interval.tick().await;
                if let Err(e) = db::prune_expired(&gc_pool).await {
                    tracing::warn!("Expiry sweep failed: {e}");
                }
            }
        });
    }

    let app = create_app(pool, config.clone()).await;

    let addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:3001".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("auth-center listening on {} (issuer {})", addr, config.issuer);

    axum::serve(listener, app).await?;

    Ok(())
}
