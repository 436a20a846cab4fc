mod credits;
mod lifecycle;
mod notify;
mod problem;
mod router;
mod telemetry;
mod webhook;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use chrono::Utc;
use reqwest::Client;
use tracing::{info, warn};

use esign_providers::{
    BoldSignClient, ClientCredentialsTokenProvider, ObjectStoreClient, ResendTransport,
};
use esign_storage::Database;
use esign_util::{load_env_file, AppConfig, WebhookVerification};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    if config.webhook == WebhookVerification::InsecureBootstrap {
        warn!(
            stage = "app",
            "BOLDSIGN_WEBHOOK_SECRET is not set; webhook signatures will NOT be verified"
        );
    }

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = Client::builder().build()?;
    let tokens = Arc::new(ClientCredentialsTokenProvider::new(
        config.boldsign.client_id.clone(),
        config.boldsign.client_secret.clone(),
        config.boldsign.token_url.clone(),
        http.clone(),
    ));
    let boldsign = BoldSignClient::new(config.boldsign.api_base.clone(), tokens, http.clone());
    let object_store = ObjectStoreClient::new(
        config.object_store.api_base.clone(),
        config.object_store.service_key.clone(),
        config.object_store.bucket.clone(),
        http.clone(),
    );
    let transport = Arc::new(ResendTransport::new(
        config.email.api_base.clone(),
        config.email.api_key.clone(),
        http,
    ));
    let notifier = notify::Notifier::new(
        transport,
        config.email.from.clone(),
        notify::LinkBuilder::new(config.app_base_url.clone()),
        notify::RetryPolicy::default(),
    );

    let lifecycle = lifecycle::LifecycleExecutor::new(
        database.clone(),
        boldsign,
        object_store,
        notifier,
        Arc::new(Utc::now),
    );
    let state = router::AppState::new(metrics, database, config.webhook.clone(), lifecycle);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
