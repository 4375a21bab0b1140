use anyhow::{Context, Result};
use secrecy::SecretString;
use std::time::Duration;

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_VERIFICATION_CODE_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_RESEND_COOLDOWN_SECONDS: i64 = 60;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration for the auth handlers. Injected through
/// [`AuthState`], never read from process globals.
#[derive(Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    access_token_secret: SecretString,
    access_token_ttl_seconds: i64,
    refresh_token_ttl_seconds: i64,
    verification_code_ttl_seconds: i64,
    resend_cooldown_seconds: i64,
    google_client_id: String,
    google_client_secret: SecretString,
    google_redirect_url: String,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String, access_token_secret: SecretString) -> Self {
        Self {
            frontend_base_url,
            access_token_secret,
            access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            refresh_token_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            verification_code_ttl_seconds: DEFAULT_VERIFICATION_CODE_TTL_SECONDS,
            resend_cooldown_seconds: DEFAULT_RESEND_COOLDOWN_SECONDS,
            google_client_id: String::new(),
            google_client_secret: SecretString::default(),
            google_redirect_url: String::new(),
        }
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        if seconds > 0 {
            self.access_token_ttl_seconds = seconds;
        }

        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(mut self, seconds: i64) -> Self {
        if seconds > 0 {
            self.refresh_token_ttl_seconds = seconds;
        }

        self
    }

    #[must_use]
    pub fn with_verification_code_ttl_seconds(mut self, seconds: i64) -> Self {
        if seconds > 0 {
            self.verification_code_ttl_seconds = seconds;
        }

        self
    }

    #[must_use]
    pub fn with_resend_cooldown_seconds(mut self, seconds: i64) -> Self {
        if seconds >= 0 {
            self.resend_cooldown_seconds = seconds;
        }

        self
    }

    #[must_use]
    pub fn with_google(
        mut self,
        client_id: String,
        client_secret: SecretString,
        redirect_url: String,
    ) -> Self {
        self.google_client_id = client_id;
        self.google_client_secret = client_secret;
        self.google_redirect_url = redirect_url;

        self
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    pub(super) fn access_token_secret(&self) -> &SecretString {
        &self.access_token_secret
    }

    pub(super) fn access_token_ttl_seconds(&self) -> i64 {
        self.access_token_ttl_seconds
    }

    pub(super) fn refresh_token_ttl_seconds(&self) -> i64 {
        self.refresh_token_ttl_seconds
    }

    pub(super) fn verification_code_ttl_seconds(&self) -> i64 {
        self.verification_code_ttl_seconds
    }

    pub(super) fn resend_cooldown_seconds(&self) -> i64 {
        self.resend_cooldown_seconds
    }

    pub(super) fn google_client_id(&self) -> &str {
        &self.google_client_id
    }

    pub(super) fn google_client_secret(&self) -> &SecretString {
        &self.google_client_secret
    }

    pub(super) fn google_redirect_url(&self) -> &str {
        &self.google_redirect_url
    }

    pub(super) fn google_enabled(&self) -> bool {
        !self.google_client_id.is_empty() && !self.google_redirect_url.is_empty()
    }
}

/// Shared state handed to every auth handler.
#[derive(Debug)]
pub struct AuthState {
    config: AuthConfig,
    http: reqwest::Client,
}

impl AuthState {
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: AuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self { config, http })
    }

    pub(crate) fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub(super) fn http(&self) -> &reqwest::Client {
        &self.http
    }
}
