use std::process::ExitCode;
use std::sync::Arc;

use authsession::config::DEFAULT_BASE_URL;
use authsession::rest::RestProvider;
use authsession::{AuthError, ConfigError, ProviderConfig, Session, SessionContainer};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{}", .0.message)]
    Auth(#[from] AuthError),
    #[error("invalid JSON output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("session observer stopped unexpectedly")]
    ObserverLost,
}

#[derive(Parser, Debug)]
#[command(name = "authsession-cli", about = "Drive an auth session against an identity service")]
struct Cli {
    #[arg(long, env = "AUTH_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, env = "AUTH_API_KEY", hide_env_values = true)]
    api_key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and print the user.
    SignIn {
        #[command(flatten)]
        credentials: Credentials,
        /// Also fetch and print the user's custom claims.
        #[arg(long, default_value_t = false)]
        claims: bool,
    },
    /// Create an account and print the user.
    SignUp {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Sign in, then sign out, printing every session snapshot.
    Watch {
        #[command(flatten)]
        credentials: Credentials,
    },
}

#[derive(Args, Debug)]
struct Credentials {
    #[arg(long, env = "AUTH_EMAIL")]
    email: String,
    #[arg(long, env = "AUTH_PASSWORD", hide_env_values = true)]
    password: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = dotenv {
        tracing::debug!(error = %e, "no .env loaded");
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = ProviderConfig::new(cli.api_key).with_base_url(&cli.base_url);
    let provider = Arc::new(RestProvider::new(config)?);
    tracing::debug!(base_url = provider.base_url(), "identity provider configured");
    let container = Arc::new(SessionContainer::new(provider));
    container.wait_until_ready().await;

    match cli.command {
        Command::SignIn { credentials, claims } => run_sign_in(&container, &credentials, claims).await,
        Command::SignUp { first_name, last_name, credentials } => {
            let user = container
                .sign_up(&first_name, &last_name, &credentials.email, &credentials.password)
                .await?;
            print_json(&user)
        }
        Command::Watch { credentials } => run_watch(container, &credentials).await,
    }
}

async fn run_sign_in(container: &SessionContainer, credentials: &Credentials, claims: bool) -> Result<(), CliError> {
    let user = container.sign_in(&credentials.email, &credentials.password).await?;
    if claims {
        let claims = container.user_claims().await?;
        print_json(&serde_json::json!({ "user": user, "claims": claims }))
    } else {
        print_json(&user)
    }
}

async fn run_watch(container: Arc<SessionContainer>, credentials: &Credentials) -> Result<(), CliError> {
    let mut rx = container.subscribe();
    let printer = tokio::spawn(async move {
        let mut printed = 0usize;
        while rx.changed().await.is_ok() {
            let session: Session = rx.borrow_and_update().clone();
            if let Err(e) = print_json(&session) {
                tracing::warn!(error = %e, "failed to print session");
            }
            printed += 1;
        }
        printed
    });

    print_json(&container.snapshot())?;
    let signed_in = container.sign_in(&credentials.email, &credentials.password).await;
    let signed_out = container.sign_out().await;

    // Last strong reference: closing drops the sender and ends the printer loop.
    match Arc::try_unwrap(container) {
        Ok(container) => container.close(),
        Err(_shared) => return Err(CliError::ObserverLost),
    }
    match printer.await {
        Ok(count) => tracing::debug!(count, "session snapshots printed"),
        Err(e) => tracing::warn!(error = %e, "session printer failed"),
    }

    signed_in?;
    signed_out?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
