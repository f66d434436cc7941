use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{http::header, middleware::Logger, web, App, HttpServer};
use log::{error, info, warn};
use sqlx::postgres::PgPoolOptions;

mod auth;
mod clock;
mod config;
mod error;
mod handlers;
mod labels;
mod locks;
mod models;
mod notify;
mod panel;
mod payment;
mod reconciler;
mod service;
mod steps;
mod store;
#[cfg(test)]
mod testing;

use config::{Config, PanelsConfig};
use notify::TelegramNotifier;
use panel::PanelRegistry;
use payment::YooKassa;
use reconciler::SubscriptionReconciler;
use service::{ServiceSettings, SubscriptionService};
use store::PgStore;

fn startup_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

fn cors(origins: &[String]) -> Cors {
    origins
        .iter()
        .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        .allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .supports_credentials()
        .max_age(3600)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env().map_err(startup_error)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .idle_timeout(Duration::from_secs(300))
        .connect(&config.database_url)
        .await
        .map_err(|e| {
            error!("Database connection failed: {}", e);
            startup_error(e)
        })?;
    info!("Database pool ready");

    // Panels: log in once at startup
    let panels = PanelsConfig::load(&config.panels_path).map_err(startup_error)?;
    let registry = Arc::new(PanelRegistry::from_config(&panels).map_err(startup_error)?);
    let failed = registry
        .authenticate_all()
        .await
        .into_iter()
        .filter(|(_, result)| result.is_err())
        .count();
    if failed > 0 {
        warn!("{} panels failed to authenticate; use /api/admin/reauthenticate", failed);
    }

    let service = web::Data::new(SubscriptionService::new(
        SubscriptionReconciler::new(registry),
        Arc::new(PgStore::new(pool)),
        Arc::new(YooKassa::new(
            config.yookassa_shop_id.clone(),
            config.yookassa_secret_key.clone(),
            config.payment_return_url.clone(),
        )),
        Arc::new(TelegramNotifier::new(
            config.order_bot_token.clone(),
            config.admin_chat_ids.clone(),
        )),
        ServiceSettings {
            bot_token: config.bot_token.clone(),
            base_redirect_url: config.base_redirect_url.clone(),
            admin_api_token: config.admin_api_token.clone(),
        },
    ));

    info!("Listening on {}", config.bind_addr);
    let origins = config.allowed_origins.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(cors(&origins))
            .wrap(Logger::default())
            .app_data(service.clone())
            .configure(handlers::configure)
    })
    .bind(&config.bind_addr)?
    .run()
    .await
}
