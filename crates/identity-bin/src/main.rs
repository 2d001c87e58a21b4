//! Peach identity CLI - sign in, inspect, and keep a session fresh.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use identity_config_and_utils::{init_logging, Config, Paths};

/// Peach identity command-line interface.
#[derive(Parser)]
#[command(name = "peach-identity")]
#[command(about = "Manage the Peach identity session on this machine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, credentials, and logs. Defaults to ~/.peach-identity
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with an authorization code or email and password
    SignIn {
        /// Authorization code from the provider's redirect
        #[arg(long, conflicts_with_all = ["email", "password"])]
        code: Option<String>,

        #[arg(long, requires = "password")]
        email: Option<String>,

        #[arg(long, env = "PEACH_IDENTITY_PASSWORD", hide_env_values = true, requires = "email")]
        password: Option<String>,

        /// Total attempts for network failures (authorization code only)
        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },
    /// Create an account and sign in to it
    SignUp {
        #[arg(long)]
        email: String,

        #[arg(long, env = "PEACH_IDENTITY_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Show the current session
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sign out and delete the stored credential
    SignOut,
    /// Fetch and print the account profile
    Profile,
    /// Keep the session refreshed and print session events until interrupted
    Watch {
        /// Do not probe the provider for reachability
        #[arg(long)]
        no_probe: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;
    let config = Config::load(&paths)?;

    let level = cli.log_level.unwrap_or_else(|| config.log_level.clone());
    init_logging(&level, Some(paths.log_file()));

    let session = app::build_session(&config, &paths)?;

    match cli.command {
        Commands::SignIn {
            code,
            email,
            password,
            attempts,
        } => {
            let grant = match (code, email, password) {
                (Some(code), _, _) => app::Grant::Code { code, attempts },
                (None, Some(email), Some(password)) => app::Grant::Password { email, password },
                _ => return Err("either --code or --email with --password is required".into()),
            };
            app::sign_in(&session, grant).await?;
        }
        Commands::SignUp { email, password } => {
            app::sign_in(&session, app::Grant::SignUp { email, password }).await?;
        }
        Commands::Status { json } => app::status(&session, json)?,
        Commands::SignOut => app::sign_out(&session)?,
        Commands::Profile => app::profile(&session).await?,
        Commands::Watch { no_probe } => app::watch(session, &config, !no_probe).await?,
    }

    Ok(())
}
