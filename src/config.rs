use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// SAMS command-line client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the SAMS backend
    #[arg(short = 'a', long, env = "SAMS_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Path to the session database
    #[arg(short = 'd', long, env = "SAMS_SESSION_DB")]
    pub session_db: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// What to do when the session cannot be recovered (throw, redirect)
    #[arg(long, env = "AUTH_FAILURE_POLICY", default_value = "throw")]
    pub auth_failure_policy: String,

    /// Seconds between background session checks
    #[arg(long, env = "SESSION_VALIDATION_INTERVAL", default_value = "60")]
    pub validation_interval: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and store the session
    Login {
        /// Username (prompted when omitted)
        #[arg(short, long)]
        username: Option<String>,
    },
    /// End the stored session
    Logout,
    /// Show the logged-in user
    Whoami,
    /// Show session and token state
    Status,
    /// GET an API endpoint, e.g. /api/v1/assets
    Get { endpoint: String },
    /// POST a JSON body to an API endpoint
    Post { endpoint: String, body: String },
    /// PUT a JSON body to an API endpoint
    Put { endpoint: String, body: String },
    /// DELETE an API endpoint
    Delete { endpoint: String },
    /// Ask the AI assistant a question
    Ask { message: String },
    /// Keep the session alive, validating it periodically until Ctrl+C
    Watch,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_url: String,

    // Session storage
    pub session_db: PathBuf,

    // Session lifecycle
    pub auth_failure_policy: AuthFailurePolicy,
    pub validation_interval: u64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

/// Behavior of the request wrapper when the session cannot be recovered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthFailurePolicy {
    /// Clear the session and return the error; the caller redirects
    #[default]
    Throw,
    /// Clear the session and redirect to login immediately
    Redirect,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<(Self, Command)> {
        let config = Config {
            api_url: args.api_url.trim_end_matches('/').to_string(),

            session_db: args
                .session_db
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_session_db),

            auth_failure_policy: parse_auth_failure_policy(&args.auth_failure_policy)?,

            validation_interval: args.validation_interval,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
        };

        Ok((config, args.command))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_url)
            .with_context(|| format!("SAMS_API_URL is not a valid URL: {}", self.api_url))?;

        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("SAMS_API_URL must use http or https: {}", self.api_url);
        }

        if self.validation_interval == 0 {
            anyhow::bail!("SESSION_VALIDATION_INTERVAL must be at least 1 second");
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be at least 1 second");
        }

        Ok(())
    }

    pub fn validation_period(&self) -> Duration {
        Duration::from_secs(self.validation_interval)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http_connect_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_request_timeout)
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Session database under the user's data directory
fn default_session_db() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("sams"))
        .unwrap_or_else(|| PathBuf::from(".sams"))
        .join("session.sqlite3")
}

/// Parse the auth failure policy from string
fn parse_auth_failure_policy(s: &str) -> Result<AuthFailurePolicy> {
    match s.to_lowercase().as_str() {
        "throw" | "" => Ok(AuthFailurePolicy::Throw),
        "redirect" => Ok(AuthFailurePolicy::Redirect),
        other => anyhow::bail!(
            "AUTH_FAILURE_POLICY must be 'throw' or 'redirect', got '{}'",
            other
        ),
    }
}
