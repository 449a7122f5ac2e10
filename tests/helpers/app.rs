use super::TestDb;
use krishi_sakhi::auth;
use krishi_sakhi::ext::WeatherProvider;
use krishi_sakhi::jwks::JwksManager;
use krishi_sakhi::settings::Settings;
use krishi_sakhi::web::{self, AppState};
use krishi_sakhi::ws::ConnectionHub;
use krishi_sakhi::{entities, llm, media, notify, rules};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tempfile::TempDir;

/// The public API served in-process on an ephemeral port
pub struct TestApp {
    pub base_url: String,
    pub state: AppState,
    pub client: reqwest::Client,
    _db: TestDb,
    _dir: TempDir,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let db = TestDb::new().await;
        let dir = TempDir::new().expect("Failed to create temp dir");

        let mut settings = Settings::default();
        settings.server.dev_mode = true;
        settings.keys.private_key_path = dir.path().join("keys/jwt_private.json");
        settings.keys.jwks_path = dir.path().join("keys/jwks.json");
        settings.media.root = dir.path().join("media");
        media::ensure_dirs(&settings.media.root)
            .await
            .expect("Failed to create media dirs");

        let jwks = JwksManager::new(settings.keys.clone())
            .await
            .expect("Failed to create keys");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("No local addr");
        settings.server.public_base_url = Some(format!("http://{}", addr));

        let state = AppState {
            llm: Arc::new(llm::build(&settings.llm).expect("llm")),
            notify: Arc::new(notify::build(&settings.notify).expect("notify")),
            hub: Arc::new(ConnectionHub::new(settings.ws.heartbeat_secs)),
            settings: Arc::new(settings),
            db: db.connection().clone(),
            jwks,
            rules: Arc::new(rules::builtin_rules()),
            weather: WeatherProvider::Dummy,
        };

        let router = web::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("Server failed");
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            client: reqwest::Client::new(),
            _db: db,
            _dir: dir,
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.state.db
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Access and refresh tokens for `user`, skipping the OTP round trip
    pub async fn token_pair_for(&self, user: &entities::user::Model) -> auth::TokenPair {
        auth::issue_token_pair(
            &self.state.db,
            &self.state.jwks,
            &self.state.settings,
            user,
            None,
        )
        .await
        .expect("Failed to issue tokens")
    }

    pub async fn token_for(&self, user: &entities::user::Model) -> String {
        self.token_pair_for(user).await.access_token
    }

    pub fn get(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(token)
    }

    pub fn post(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(token)
    }

    pub fn patch(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.client.patch(self.url(path)).bearer_auth(token)
    }

    pub fn delete(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.client.delete(self.url(path)).bearer_auth(token)
    }
}
