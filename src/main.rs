use std::{fs, path::Path, sync::Arc};

use actix_cors::Cors;
use actix_web::{http, middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use shared::{api::user::Claims, models::user::User};
use tokio::task::spawn;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{Config, StorageBackend},
    fanout::FanoutServer,
    jwt::JwtAuth,
    relay::RedisRelay,
    service::ChatService,
    store::{
        memory::{MemoryDirectory, MemoryStore},
        mongo::MongoStore,
        ChatRepository, UserDirectory,
    },
};

mod api;
mod chat_store;
mod config;
mod error;
mod fanout;
mod jwt;
mod message_log;
mod reconciler;
mod relay;
mod service;
mod store;
#[cfg(test)]
mod testing;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    info!(
        host = %config.host,
        port = config.port,
        storage = ?config.storage,
        relay = config.redis_url.is_some(),
        "starting chat server"
    );

    let (repo, directory): (Arc<dyn ChatRepository>, Arc<dyn UserDirectory>) =
        match config.storage {
            StorageBackend::Mongo => {
                let store = Arc::new(
                    MongoStore::init(&config.mongodb_uri, &config.mongodb_database)
                        .await
                        .context("failed to initialize MongoDB")?,
                );

                (store.clone(), store)
            }
            StorageBackend::Memory => (
                Arc::new(MemoryStore::new()),
                Arc::new(load_users(config.memory_users_file.as_deref())?),
            ),
        };

    let (fanout_server, fanout) =
        FanoutServer::new(config.subscription_sweep, config.subscription_buffer);

    let (fanout_server, relay) = match &config.redis_url {
        Some(url) => {
            let (relay, relay_tx) =
                RedisRelay::new(url, fanout.clone()).context("failed to create redis relay")?;

            (fanout_server.with_relay(relay_tx), Some(relay))
        }
        None => (fanout_server, None),
    };

    let fanout_fut = spawn(fanout_server.run());

    let relay_fut = async move {
        match relay {
            Some(relay) => relay.run().await,
            None => std::future::pending().await,
        }
    };

    let service = web::Data::new(ChatService::new(
        repo,
        directory,
        fanout,
        config.transaction_max_attempts,
    ));

    let jwt_auth = JwtAuth::<Claims>::new(&config.secret_key);

    let addr = config.bind_addr();

    let http_fut = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .send_wildcard()
            .allowed_methods(["POST", "GET", "PATCH"])
            .allowed_headers([
                http::header::AUTHORIZATION,
                http::header::ACCEPT,
                http::header::CONTENT_TYPE,
            ])
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(service.clone())
            .configure(api::config(jwt_auth.clone()))
    })
    .bind(&addr)?
    .run();

    info!("binding on {}", addr);

    tokio::select! {
        res = http_fut => res?,
        _ = fanout_fut => anyhow::bail!("fan-out server stopped"),
        res = relay_fut => res?,
    }

    Ok(())
}

/// Users for the in-memory directory, read from a JSON array.
fn load_users(path: Option<&Path>) -> anyhow::Result<MemoryDirectory> {
    let Some(path) = path else {
        warn!("MEMORY_USERS_FILE not set; user directory is empty");
        return Ok(MemoryDirectory::default());
    };

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let users: Vec<User> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse users from {}", path.display()))?;

    info!(count = users.len(), "loaded user directory");

    Ok(MemoryDirectory::new(users))
}
