use crate::{
    api::{self, email::EmailWorkerConfig, handlers::auth::AuthConfig},
    cli::{commands::auth, telemetry},
};
use anyhow::{Context, Result};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub auth: auth::Options,
}

/// Run the HTTP server until shutdown.
///
/// # Errors
/// Returns an error when configuration is invalid or the server fails to
/// bind or serve.
pub async fn execute(args: Args) -> Result<()> {
    Url::parse(&args.dsn).context("invalid --dsn, expected a postgres:// URL")?;
    Url::parse(&args.auth.frontend_base_url).context("invalid --frontend-base-url")?;

    let auth_config = AuthConfig::new(args.auth.frontend_base_url, args.auth.access_token_secret)
        .with_access_token_ttl_seconds(args.auth.access_token_ttl_seconds)
        .with_refresh_token_ttl_seconds(args.auth.refresh_token_ttl_seconds)
        .with_verification_code_ttl_seconds(args.auth.verification_code_ttl_seconds)
        .with_resend_cooldown_seconds(args.auth.resend_cooldown_seconds)
        .with_google(
            args.auth.google_client_id,
            args.auth.google_client_secret,
            args.auth.google_redirect_url,
        );

    let email_config = EmailWorkerConfig::new()
        .with_poll_interval_seconds(args.auth.outbox_poll_interval_seconds)
        .with_batch_size(args.auth.outbox_batch_size)
        .with_max_attempts(args.auth.outbox_max_attempts)
        .with_retry_base_seconds(args.auth.outbox_retry_base_seconds)
        .with_retry_max_seconds(args.auth.outbox_retry_max_seconds);

    let result = api::new(args.port, args.dsn, auth_config, email_config).await;

    telemetry::shutdown_tracer();

    result
}
