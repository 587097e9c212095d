pub mod config;
pub mod err;
pub mod io;
pub mod models;
pub mod pg;
pub mod routes;
pub mod service;
pub mod store;

use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::err::{Error, Fine, Maybe, Nothing};
use crate::io::PhotoStore;
use crate::pg::PgStore;
use crate::service::StudentService;
use crate::store::{MemoryStore, StudentStore};

pub type Payload<T> = Result<Maybe<T>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V> where V: Serialize {
    Ok(Fine(value))
}

pub fn breaks<V>(err: Error) -> Payload<V> where V: Serialize {
    Ok(Nothing(err))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = Config::load()?;

    let photos = PhotoStore::new(&config.upload_dir);
    photos.prepare().await?;
    log::info!("Storing photos in {}", photos.root().display());

    let store: Arc<dyn StudentStore> = match &config.database_url {
        Some(url) => {
            let pg = PgStore::connect(url, config.max_connections).await?;
            pg.migrate().await?;
            log::info!("Connected to Postgres");
            Arc::new(pg)
        }
        None => {
            log::warn!("No DATABASE_URL configured, students are kept in memory only");
            Arc::new(MemoryStore::default())
        }
    };

    let app = routes::router(Arc::new(StudentService::new(store, photos)));

    log::info!("Starting StudentPortal HTTP Server on http://{}", config.bind_address);
    axum::Server::bind(&config.bind_address)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
