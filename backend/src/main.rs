use actix_web::{web, App, HttpServer};
use backend::config::Config;
use backend::job_controller::pipeline::IngestPipeline;
use backend::services;
use backend::storage::cache::MemoryCache;
use backend::storage::sqlite::SqliteStore;
use env_logger::Env;
use log::{error, info};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let config = Config::load().map_err(|e| std::io::Error::other(format!("config: {}", e)))?;
    std::fs::create_dir_all(&config.storage.upload_dir)?;

    let store = SqliteStore::new(&config.storage.database_path, config.pipeline.error_cap);
    store.init().map_err(std::io::Error::other)?;

    let pipeline = IngestPipeline::new(&config, Arc::new(store), Arc::new(MemoryCache::new()))
        .map_err(std::io::Error::other)?;
    pipeline.start();
    match pipeline.recover() {
        Ok(requeued) => info!("recovery done, {} chunks requeued", requeued),
        Err(e) => error!("recovery failed: {}", e),
    }
    let pipeline = web::Data::new(pipeline);

    // Start cleanup sweeper
    let sweeper = pipeline.sweeper(&config.storage.upload_dir, config.sweeper.stale_after());
    let sweep_interval = config.sweeper.interval();
    tokio::spawn(async move {
        sweeper.run(sweep_interval).await;
    });

    let host = config.server.host.clone();
    let port = config.server.port;
    info!("Server running at http://{}:{}", host, port);

    let app_pipeline = pipeline.clone();
    let app_config = web::Data::new(config);
    HttpServer::new(move || {
        App::new()
            .app_data(app_pipeline.clone())
            .app_data(app_config.clone())
            .service(services::data_sources::csv::configure_routes())
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    pipeline.shutdown().await;
    Ok(())
}
