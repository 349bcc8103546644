use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::repository::pg::PgStore;
use crate::repository::store::BookingStore;
use crate::services::ical::{FeedFetcher, HttpFeedFetcher};
use crate::services::notifier::{NoopNotifier, Notifier, SlackNotifier};
use crate::services::orchestrator::SyncEngine;
use crate::services::sync::SyncSettings;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: Client,
    sync: Option<SyncEngine>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.fetcher_timeout_seconds.max(30)))
            .build()?;

        let db_pool = match &config.database_url {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_lazy(url)?,
            ),
            None => None,
        };

        let sync = db_pool.clone().map(|pool| {
            let store: Arc<dyn BookingStore> = Arc::new(PgStore::new(pool));
            let fetcher: Arc<dyn FeedFetcher> = Arc::new(HttpFeedFetcher::new(
                http_client.clone(),
                config.fetcher_timeout_seconds,
            ));
            let notifier: Arc<dyn Notifier> = match (config.notifier_enabled, config.slack_webhook_url.clone()) {
                (true, Some(url)) => Arc::new(SlackNotifier::new(http_client.clone(), url)),
                _ => Arc::new(NoopNotifier),
            };
            SyncEngine::new(store, fetcher, notifier, SyncSettings::from_config(&config))
        });

        Ok(Self {
            config: Arc::new(config),
            db_pool,
            http_client,
            sync,
        })
    }

    pub fn sync_engine(&self) -> Result<&SyncEngine, AppError> {
        self.sync.as_ref().ok_or_else(|| {
            AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
        })
    }
}
