use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use secrecy::SecretString;

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = command.arg(
        Arg::new("frontend-base-url")
            .long("frontend-base-url")
            .help("Base URL of the web frontend, used for CORS and email links")
            .env("MERCATO_FRONTEND_BASE_URL")
            .default_value("http://localhost:5173"),
    );

    let command = with_token_args(command);
    let command = with_google_args(command);

    with_outbox_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("access-token-secret")
                .long("access-token-secret")
                .help("HMAC secret used to sign access tokens")
                .env("MERCATO_ACCESS_TOKEN_SECRET")
                .required(true),
        )
        .arg(
            Arg::new("access-token-ttl")
                .long("access-token-ttl")
                .help("Access token lifetime in seconds")
                .env("MERCATO_ACCESS_TOKEN_TTL")
                .default_value("900")
                .value_parser(value_parser!(i64)),
        )
        .arg(
            Arg::new("refresh-token-ttl")
                .long("refresh-token-ttl")
                .help("Refresh session lifetime in seconds")
                .env("MERCATO_REFRESH_TOKEN_TTL")
                .default_value("2592000")
                .value_parser(value_parser!(i64)),
        )
        .arg(
            Arg::new("verification-code-ttl")
                .long("verification-code-ttl")
                .help("Verification code lifetime in seconds")
                .env("MERCATO_VERIFICATION_CODE_TTL")
                .default_value("900")
                .value_parser(value_parser!(i64)),
        )
        .arg(
            Arg::new("resend-cooldown")
                .long("resend-cooldown")
                .help("Minimum seconds between verification emails for one address")
                .env("MERCATO_RESEND_COOLDOWN")
                .default_value("60")
                .value_parser(value_parser!(i64)),
        )
}

fn with_google_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("google-client-id")
                .long("google-client-id")
                .help("Google OAuth client id, sign-in with Google is disabled when empty")
                .env("MERCATO_GOOGLE_CLIENT_ID")
                .default_value(""),
        )
        .arg(
            Arg::new("google-client-secret")
                .long("google-client-secret")
                .help("Google OAuth client secret")
                .env("MERCATO_GOOGLE_CLIENT_SECRET")
                .default_value(""),
        )
        .arg(
            Arg::new("google-redirect-url")
                .long("google-redirect-url")
                .help("Redirect URL registered with the Google OAuth client")
                .env("MERCATO_GOOGLE_REDIRECT_URL")
                .default_value(""),
        )
}

fn with_outbox_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("outbox-poll-interval")
                .long("outbox-poll-interval")
                .help("Seconds between email outbox polls")
                .env("MERCATO_OUTBOX_POLL_INTERVAL")
                .default_value("5")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("outbox-batch-size")
                .long("outbox-batch-size")
                .help("Maximum emails claimed per outbox poll")
                .env("MERCATO_OUTBOX_BATCH_SIZE")
                .default_value("10")
                .value_parser(value_parser!(i64)),
        )
        .arg(
            Arg::new("outbox-max-attempts")
                .long("outbox-max-attempts")
                .help("Delivery attempts before an email is marked failed")
                .env("MERCATO_OUTBOX_MAX_ATTEMPTS")
                .default_value("5")
                .value_parser(value_parser!(i32)),
        )
        .arg(
            Arg::new("outbox-retry-base")
                .long("outbox-retry-base")
                .help("Base delay in seconds for outbox retry backoff")
                .env("MERCATO_OUTBOX_RETRY_BASE")
                .default_value("5")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("outbox-retry-max")
                .long("outbox-retry-max")
                .help("Upper bound in seconds for outbox retry backoff")
                .env("MERCATO_OUTBOX_RETRY_MAX")
                .default_value("300")
                .value_parser(value_parser!(u64)),
        )
}

/// Parsed auth and outbox options, ready to hand to the server action.
#[derive(Debug)]
pub struct Options {
    pub frontend_base_url: String,
    pub access_token_secret: SecretString,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub verification_code_ttl_seconds: i64,
    pub resend_cooldown_seconds: i64,
    pub google_client_id: String,
    pub google_client_secret: SecretString,
    pub google_redirect_url: String,
    pub outbox_poll_interval_seconds: u64,
    pub outbox_batch_size: i64,
    pub outbox_max_attempts: i32,
    pub outbox_retry_base_seconds: u64,
    pub outbox_retry_max_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error when a required argument is missing from `matches`.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let frontend_base_url = matches
            .get_one::<String>("frontend-base-url")
            .context("missing required argument: --frontend-base-url")?
            .clone();

        let access_token_secret = matches
            .get_one::<String>("access-token-secret")
            .map(|secret| SecretString::from(secret.clone()))
            .context("missing required argument: --access-token-secret")?;

        let google_client_secret = matches
            .get_one::<String>("google-client-secret")
            .map(|secret| SecretString::from(secret.clone()))
            .context("missing required argument: --google-client-secret")?;

        Ok(Self {
            frontend_base_url,
            access_token_secret,
            access_token_ttl_seconds: matches
                .get_one::<i64>("access-token-ttl")
                .copied()
                .context("missing required argument: --access-token-ttl")?,
            refresh_token_ttl_seconds: matches
                .get_one::<i64>("refresh-token-ttl")
                .copied()
                .context("missing required argument: --refresh-token-ttl")?,
            verification_code_ttl_seconds: matches
                .get_one::<i64>("verification-code-ttl")
                .copied()
                .context("missing required argument: --verification-code-ttl")?,
            resend_cooldown_seconds: matches
                .get_one::<i64>("resend-cooldown")
                .copied()
                .context("missing required argument: --resend-cooldown")?,
            google_client_id: matches
                .get_one::<String>("google-client-id")
                .context("missing required argument: --google-client-id")?
                .clone(),
            google_client_secret,
            google_redirect_url: matches
                .get_one::<String>("google-redirect-url")
                .context("missing required argument: --google-redirect-url")?
                .clone(),
            outbox_poll_interval_seconds: matches
                .get_one::<u64>("outbox-poll-interval")
                .copied()
                .context("missing required argument: --outbox-poll-interval")?,
            outbox_batch_size: matches
                .get_one::<i64>("outbox-batch-size")
                .copied()
                .context("missing required argument: --outbox-batch-size")?,
            outbox_max_attempts: matches
                .get_one::<i32>("outbox-max-attempts")
                .copied()
                .context("missing required argument: --outbox-max-attempts")?,
            outbox_retry_base_seconds: matches
                .get_one::<u64>("outbox-retry-base")
                .copied()
                .context("missing required argument: --outbox-retry-base")?,
            outbox_retry_max_seconds: matches
                .get_one::<u64>("outbox-retry-max")
                .copied()
                .context("missing required argument: --outbox-retry-max")?,
        })
    }
}
