use std::{path::PathBuf, time::Duration};

use clap::Parser;
use credo::{AudienceKey, AuthEvent, Authenticator, FileStorage, KeyMaterial, RawConfig};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// A JSON configuration file; `CREDO_*` environment variables are used otherwise
    #[arg(short, long, env = "CREDO_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// The directory used to store encrypted credentials
    #[arg(short = 'd', long, env = "CREDO_STORAGE_DIR", default_value = ".credentials")]
    storage_dir: PathBuf,

    /// Device-local secret from which the storage key is derived
    #[arg(short, long, env = "CREDO_KEY_MATERIAL", hide_env_values = true)]
    key_material: String,

    /// The audience to request a token for
    #[arg(short, long, env = "CREDO_AUDIENCE", default_value = "main")]
    audience: AudienceKey,

    /// A token from an external identity provider to exchange for a session
    #[arg(long, env = "CREDO_SUBJECT_TOKEN", hide_env_values = true, requires = "subject_issuer")]
    subject_token: Option<String>,

    /// The external identity provider that issued the subject token
    #[arg(long, env = "CREDO_SUBJECT_ISSUER")]
    subject_issuer: Option<String>,

    /// Seconds between token requests
    #[arg(short, long, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let raw = match &opts.config {
        Some(path) => RawConfig::from_file(path)?,
        None => RawConfig::from_env()?,
    };

    let (auth, pump) = Authenticator::builder(
        raw,
        FileStorage::new(opts.storage_dir.clone()),
        KeyMaterial::new(opts.key_material.into_bytes()),
    )
    .build()?;
    tokio::spawn(pump.run());

    auth.subscribe(|event| match event {
        AuthEvent::TokenRequestFailed { audience, error } => {
            tracing::warn!(%audience, %error, "token request failed")
        }
        AuthEvent::InternalError { message } => tracing::error!(%message, "internal error"),
        event => tracing::info!(?event, "lifecycle event"),
    });

    auth.initialize().await?;

    if let (Some(subject_token), Some(subject_issuer)) = (&opts.subject_token, &opts.subject_issuer) {
        auth.token_exchange(subject_token, subject_issuer).await?;
    }

    if auth.needs_authentication().await? {
        tracing::warn!("no renewable session is stored; supply a subject token to start one");
    }

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        match auth.token(opts.audience.clone(), false).await {
            Ok(record) => tracing::info!(
                token = format_args!("{:#?}", record.access_token()),
                expires_in = record.until_expired().0,
                email_verified = record.email_verified(),
                "pulled token"
            ),
            Err(error) => tracing::error!(%error, "unable to obtain token"),
        }
    }
}
