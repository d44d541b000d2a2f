use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use reqwest::Response;
use std::sync::Arc;

use sams_client::auth::{self, SessionManager, SessionState, SqliteStore};
use sams_client::config::{self, Command};
use sams_client::http_client::SamsHttpClient;
use sams_client::navigation::{Navigator, View};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = config::Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Backend: {}", config.api_url);
    tracing::debug!("Session database: {}", config.session_db.display());

    let store = Arc::new(SqliteStore::open(&config.session_db)?);
    let navigator = Navigator::new(View::Page("cli".to_string()));
    let session = SessionManager::new(
        config.api_url.clone(),
        store,
        navigator,
        config.request_timeout(),
    )?;

    let client = SamsHttpClient::new(
        session.clone(),
        config.auth_failure_policy,
        config.connect_timeout(),
        config.request_timeout(),
    )?;

    match command {
        Command::Login { username } => login(&session, username).await,
        Command::Logout => {
            session.logout();
            println!("Logged out");
            Ok(())
        }
        Command::Whoami => whoami(&session).await,
        Command::Status => status(&session),
        Command::Get { endpoint } => print_response(client.get(&endpoint).await).await,
        Command::Post { endpoint, body } => {
            let body = parse_json_arg(&body)?;
            print_response(client.post(&endpoint, &body).await).await
        }
        Command::Put { endpoint, body } => {
            let body = parse_json_arg(&body)?;
            print_response(client.put(&endpoint, &body).await).await
        }
        Command::Delete { endpoint } => print_response(client.delete(&endpoint).await).await,
        Command::Ask { message } => match client.ai_query(&message).await {
            Ok(answer) => {
                println!("{}", answer);
                Ok(())
            }
            Err(e) => Err(session_error(e)),
        },
        Command::Watch => watch(&session, config.validation_period()).await,
    }
}

/// Prompt for missing credentials and log in
async fn login(session: &SessionManager, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => Input::new()
            .with_prompt("Username")
            .interact_text()
            .context("Failed to read username")?,
    };

    let password = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")?;

    let user = session.login(&username, &password).await?;
    println!(
        "✅ Logged in as {} ({}, {})",
        user.username,
        user.full_name(),
        user.role
    );
    Ok(())
}

/// Make sure a usable session exists, refreshing in the foreground.
/// A short-lived process cannot rely on the background refresh `validate` starts.
async fn ensure_session(session: &SessionManager) -> Result<()> {
    let epoch = session.epoch();
    if session.state() == SessionState::Refreshing && !session.refresh().await {
        session.logout_at(epoch);
    }

    if !session.validate() {
        anyhow::bail!("Not logged in. Run `sams login` first.");
    }
    Ok(())
}

async fn whoami(session: &SessionManager) -> Result<()> {
    ensure_session(session).await?;

    match session.current_user() {
        Some(user) => {
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
        None => anyhow::bail!("Session has no cached user. Run `sams login` again."),
    }
}

fn status(session: &SessionManager) -> Result<()> {
    let state = session.state();
    println!("Backend:  {}", session.base_url());
    println!("State:    {:?}", state);

    if let Some(pair) = session.credentials() {
        for (name, token) in [("Access", &pair.access_token), ("Refresh", &pair.refresh_token)] {
            let expiry = match auth::decode_claims(token) {
                Ok(auth::Claims { exp: Some(exp), .. }) => {
                    chrono::DateTime::<chrono::Utc>::from_timestamp(exp, 0)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| exp.to_string())
                }
                Ok(_) => "no expiry claim".to_string(),
                Err(e) => e.to_string(),
            };
            let marker = if auth::is_expired(token) { "expired" } else { "valid" };
            println!("{:<9} {} ({})", format!("{}:", name), marker, expiry);
        }
    }

    if let Some(user) = session.current_user() {
        println!("User:     {} ({})", user.username, user.role);
    }

    if state == SessionState::Anonymous {
        println!("Run `sams login` to start a session.");
    }
    Ok(())
}

/// Validate the session periodically until Ctrl+C or until it is lost
async fn watch(session: &SessionManager, period: std::time::Duration) -> Result<()> {
    ensure_session(session).await?;

    let mut view = session.navigator().subscribe();
    let _validation = session.spawn_validation_task(period);
    println!(
        "Watching session (checking every {}s, Ctrl+C to stop)",
        period.as_secs()
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C signal, stopping");
            Ok(())
        }
        changed = view.wait_for(|v| *v == View::Login) => {
            changed.context("Navigator closed")?;
            anyhow::bail!("Session expired. Run `sams login` to start a new session.")
        }
    }
}

fn parse_json_arg(body: &str) -> Result<serde_json::Value> {
    serde_json::from_str(body).context("Request body must be valid JSON")
}

/// Print status and body; non-success statuses become errors
async fn print_response(result: sams_client::error::Result<Response>) -> Result<()> {
    let response = result.map_err(session_error)?;
    let status = response.status();
    let body = response.text().await?;

    let pretty = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or(body);

    if status.is_success() {
        println!("{}", pretty);
        Ok(())
    } else {
        eprintln!("{}", pretty);
        anyhow::bail!("Request failed with status {}", status)
    }
}

fn session_error(e: sams_client::error::SessionError) -> anyhow::Error {
    if e.is_session_lost() {
        anyhow::anyhow!("{}. Run `sams login` to start a new session.", e)
    } else {
        e.into()
    }
}
