use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llm_ratelimit::config::PluginConfig;
use llm_ratelimit::plugin::{MessageEvent, Outcome, RateLimitPlugin};
use llm_ratelimit::store::{ConfigStore, FileConfigStore};

/// Console host for the LLM rate limit plugin.
///
/// Each stdin line is `<user_id>[@<group_id>] <text>`. Text starting with `rl`
/// is treated as an admin command, anything else as an LLM request.
#[derive(Debug, Parser)]
#[command(name = "llm-ratelimit", version, about)]
struct Args {
    /// Path to a YAML or JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write admin changes back to the configuration file
    #[arg(long, requires = "config")]
    persist: bool,

    /// Log filter, e.g. `info` or `llm_ratelimit=debug`
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting LLM rate limit console");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PluginConfig::load(args.config.as_deref())?;
    info!(
        max_requests = config.max_requests,
        window_secs = config.time_window_seconds,
        "Configuration loaded"
    );

    let store: Option<Arc<dyn ConfigStore>> = match (&args.config, args.persist) {
        (Some(path), true) => Some(Arc::new(FileConfigStore::new(path)) as Arc<dyn ConfigStore>),
        _ => None,
    };
    let plugin = RateLimitPlugin::from_config(&config, store)?;

    tokio::select! {
        result = run_console(&plugin) => result?,
        _ = shutdown_signal() => {}
    }

    info!("LLM rate limit console stopped");
    Ok(())
}

/// Feed stdin lines to the plugin until EOF.
async fn run_console(plugin: &RateLimitPlugin) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let Some(event) = parse_line(&line) else {
            if !line.trim().is_empty() {
                println!("expected: <user_id>[@<group_id>] <text>");
            }
            continue;
        };

        if let Some(reply) = plugin.on_admin_message(&event.text).await {
            println!("{}", reply);
            continue;
        }

        match plugin.on_llm_request(&event) {
            Outcome::PassThrough => println!("[{}] -> LLM: {}", event.sender_id, event.text),
            Outcome::Blocked(tip) => println!("[{}] {}", event.sender_id, tip),
        }
    }

    Ok(())
}

/// Split `<user_id>[@<group_id>] <text>` into an event.
fn parse_line(line: &str) -> Option<MessageEvent> {
    let (sender, text) = line.trim().split_once(char::is_whitespace)?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let event = match sender.split_once('@') {
        Some((user, group)) if !user.is_empty() && !group.is_empty() => {
            MessageEvent::new(user, text).in_group(group)
        }
        Some(_) => return None,
        None => MessageEvent::new(sender, text),
    };
    Some(event)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_private_line() {
        let event = parse_line("alice  tell me a joke").unwrap();
        assert_eq!(event.sender_id, "alice");
        assert_eq!(event.group_id, None);
        assert_eq!(event.text, "tell me a joke");
    }

    #[test]
    fn test_parse_group_line() {
        let event = parse_line("admin@lobby rl status").unwrap();
        assert_eq!(event.sender_id, "admin");
        assert_eq!(event.group_id.as_deref(), Some("lobby"));
        assert_eq!(event.text, "rl status");
    }

    #[test]
    fn test_parse_rejects_incomplete_lines() {
        assert!(parse_line("").is_none());
        assert!(parse_line("alice").is_none());
        assert!(parse_line("@lobby hi").is_none());
        assert!(parse_line("alice@ hi").is_none());
    }
}
