use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate::consensus::outcome_text;
use facegate::storage::TemplateStore;
use facegate::{config, identity, Authenticator, SessionEvent, SessionHandle, SessionOutcome};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "facegate")]
#[command(version, about = "Face authentication with multi-frame consensus")]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print session events as JSON lines on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face from the camera
    Register {
        /// User to enroll (defaults to current user)
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Check the camera against one user's enrolled face
    Verify {
        /// User to verify (defaults to current user)
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Find whose face is in front of the camera
    Identify,
    /// Remove the enrolled face of a user
    Purge {
        /// User to purge (defaults to current user)
        #[arg(short, long)]
        user: Option<String>,
    },
    /// List enrolled users
    List,
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Register { user } => {
            let auth = authenticator(config_path)?;
            let user = user.map_or_else(identity::current_user_id, Ok)?;
            info!("Registering face for user: {user}");
            let session = auth.start_register(&user)?;
            finish(session, cli.json)
        }
        Commands::Verify { user } => {
            let auth = authenticator(config_path)?;
            let user = user.map_or_else(identity::current_user_id, Ok)?;
            info!("Verifying user: {user}");
            let session = auth.start_verify(&user)?;
            finish(session, cli.json)
        }
        Commands::Identify => {
            let auth = authenticator(config_path)?;
            let session = auth.start_identify()?;
            finish(session, cli.json)
        }
        Commands::Purge { user } => {
            let auth = authenticator(config_path)?;
            let user = user.map_or_else(identity::current_user_id, Ok)?;
            purge(auth.store().as_ref(), &user)
        }
        Commands::List => {
            let auth = authenticator(config_path)?;
            list(auth.store().as_ref(), cli.json)
        }
        Commands::Config => open_config(config_path.unwrap_or(&config::CONFIG_PATH)),
    }
}

fn authenticator(path: Option<&Path>) -> Result<Authenticator> {
    let cfg = config::load_config(path)?;
    Ok(Authenticator::from_config(&cfg))
}

/// Relay events until the session ends. Only a success exits with 0.
fn finish(session: SessionHandle, json: bool) -> Result<()> {
    for event in session.events().iter() {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        }
        match event {
            SessionEvent::Progress {
                status,
                confidence,
                attempt,
            } => {
                if !json {
                    info!("[{attempt}] {status} ({:.0}%)", confidence * 100.0);
                }
            }
            SessionEvent::Finished { .. } => break,
        }
    }

    let outcome = session.wait();
    if !json {
        match &outcome {
            SessionOutcome::Success(_) => info!("✓ {}", outcome_text(&outcome)),
            _ => warn!("{}", outcome_text(&outcome)),
        }
    }
    match outcome {
        SessionOutcome::Success(_) => Ok(()),
        other => anyhow::bail!(outcome_text(&other)),
    }
}

fn purge(store: &dyn TemplateStore, user: &str) -> Result<()> {
    info!("Purging enrolled face for user: {user}");

    if store.remove(user).context("Failed to purge face template")? {
        info!("✓ Face purged for user: {user}");
    } else {
        warn!("No face enrolled for user: {user}");
    }
    Ok(())
}

fn list(store: &dyn TemplateStore, json: bool) -> Result<()> {
    let templates = store.all().context("Failed to read face templates")?;
    for t in &templates {
        if json {
            let entry = serde_json::json!({
                "identity": t.identity,
                "created_at": t.created_at,
            });
            println!("{entry}");
        } else {
            println!("{}\t{}", t.identity, t.created_at.format("%Y-%m-%d %H:%M:%S"));
        }
    }
    if templates.is_empty() && !json {
        info!("No faces enrolled");
    }
    Ok(())
}

fn open_config(path: &Path) -> Result<()> {
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {}", path.display());

    let status = std::process::Command::new(editor)
        .arg(path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
