//! Admin command execution.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::parser::{Command, USAGE};
use crate::error::{RateLimitError, Result};
use crate::ratelimit::{format_seconds, RateLimiter};
use crate::store::ConfigStore;

/// Routes parsed admin commands to the rate limiter and formats replies.
///
/// Callers are expected to have checked admin permissions already.
pub struct CommandRouter {
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
    /// Where configuration changes are persisted, if anywhere
    store: Option<Arc<dyn ConfigStore>>,
    /// Held from snapshot to completed save so saves land in order
    save_lock: Mutex<()>,
}

/// Result of executing an admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Text to send back to the administrator
    pub text: String,
    /// Whether the limiter configuration was modified
    pub changed: bool,
}

impl Reply {
    fn unchanged(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            changed: false,
        }
    }

    fn changed(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            changed: true,
        }
    }

    fn when(changed: bool, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            changed,
        }
    }
}

impl CommandRouter {
    /// Create a router that applies changes in memory only.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            store: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Create a router that persists changes through `store`.
    pub fn with_store(limiter: Arc<RateLimiter>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            limiter,
            store: Some(store),
            save_lock: Mutex::new(()),
        }
    }

    /// Handle one admin message and return the reply text. Never fails.
    #[instrument(skip(self))]
    pub async fn handle(&self, input: &str) -> String {
        let command = match Command::parse(input) {
            Ok(command) => command,
            Err(err) => {
                debug!(error = %err, "Unrecognized admin command");
                return render_error(&err);
            }
        };

        let Reply { mut text, changed } = match self.execute(command) {
            Ok(reply) => reply,
            Err(err) => {
                info!(error = %err, "Admin command rejected");
                return render_error(&err);
            }
        };

        if changed {
            if let Some(store) = &self.store {
                // The snapshot is taken under the lock, so the last save to
                // finish always carries the latest configuration.
                let _guard = self.save_lock.lock().await;
                if let Err(err) = store.save(&self.limiter.snapshot()).await {
                    warn!(error = %err, "Failed to persist configuration change");
                    text.push_str(&format!(
                        "\n⚠️ Change applied but could not be saved: {}",
                        err
                    ));
                }
            }
        }

        text
    }

    /// Apply a command to the limiter and build the confirmation text.
    ///
    /// The reply's `changed` flag is false for read-only commands and for commands
    /// that found nothing to do, such as adding a user who is already
    /// whitelisted.
    pub fn execute(&self, command: Command) -> Result<Reply> {
        let limiter = &self.limiter;

        let reply = match command {
            Command::Status => Reply::unchanged(self.status_text()),
            Command::Help => Reply::unchanged(USAGE),
            Command::WhitelistAdd(user) => {
                if limiter.add_to_whitelist(&user) {
                    Reply::changed(format!(
                        "✅ Added {} to the whitelist ({} whitelisted).",
                        user,
                        limiter.get_status().whitelist_size
                    ))
                } else {
                    Reply::unchanged(format!("ℹ️ {} is already whitelisted.", user))
                }
            }
            Command::WhitelistRemove(user) => {
                if limiter.remove_from_whitelist(&user) {
                    Reply::changed(format!(
                        "✅ Removed {} from the whitelist ({} whitelisted).",
                        user,
                        limiter.get_status().whitelist_size
                    ))
                } else {
                    Reply::unchanged(format!("ℹ️ {} is not whitelisted.", user))
                }
            }
            Command::WhitelistList => {
                let users = limiter.list_whitelist();
                if users.is_empty() {
                    Reply::unchanged("📋 The whitelist is empty.")
                } else {
                    let mut lines = vec!["📋 Whitelisted users:".to_string()];
                    lines.extend(
                        users
                            .iter()
                            .enumerate()
                            .map(|(i, user)| format!("  {}. {}", i + 1, user)),
                    );
                    Reply::unchanged(lines.join("\n"))
                }
            }
            Command::SetRate(n) => {
                limiter.set_max_requests(n)?;
                Reply::changed(format!(
                    "✅ Global limit set to {} requests per {}s.",
                    n,
                    self.window_text()
                ))
            }
            Command::SetWindow(secs) => {
                limiter.set_time_window(secs)?;
                Reply::changed(format!(
                    "✅ Time window set to {}s (all counters reset).",
                    format_seconds(secs)
                ))
            }
            Command::UserSet { user_id, limit } => {
                limiter.set_user_limit(&user_id, limit)?;
                Reply::changed(format!(
                    "✅ Limit for user {} set to {} requests per {}s.",
                    user_id,
                    limit,
                    self.window_text()
                ))
            }
            Command::UserRemove(user) => {
                let removed = limiter.remove_user_limit(&user);
                let text = if removed {
                    format!("✅ Removed the custom limit for user {}.", user)
                } else {
                    format!("ℹ️ User {} has no custom limit.", user)
                };
                Reply::when(removed, text)
            }
            Command::UserList => {
                let limits = limiter.user_limits();
                if limits.is_empty() {
                    Reply::unchanged("👤 No per-user limits.")
                } else {
                    Reply::unchanged(
                        self.limit_lines("👤 Per-user limits (highest priority):", &limits),
                    )
                }
            }
            Command::GroupSet { group_id, limit } => {
                limiter.set_group_limit(&group_id, limit)?;
                Reply::changed(format!(
                    "✅ Per-member limit for group {} set to {} requests per {}s.",
                    group_id,
                    limit,
                    self.window_text()
                ))
            }
            Command::GroupRemove(group) => {
                let removed = limiter.remove_group_limit(&group);
                let text = if removed {
                    format!(
                        "✅ Removed the custom limit for group {}; members use the global limit ({}).",
                        group,
                        limiter.get_status().max_requests
                    )
                } else {
                    format!("ℹ️ Group {} has no custom limit.", group)
                };
                Reply::when(removed, text)
            }
            Command::GroupList => {
                let limits = limiter.group_limits();
                let totals = limiter.group_total_limits();
                if limits.is_empty() && totals.is_empty() {
                    Reply::unchanged("📁 No group limits; every group uses the global limit.")
                } else {
                    let mut sections = Vec::new();
                    if !limits.is_empty() {
                        sections.push(self.limit_lines("📁 Per-member group limits:", &limits));
                    }
                    if !totals.is_empty() {
                        sections.push(self.limit_lines("📁 Shared group budgets:", &totals));
                    }
                    Reply::unchanged(sections.join("\n"))
                }
            }
            Command::GroupTotal { group_id, limit } => {
                limiter.set_group_total_limit(&group_id, limit)?;
                Reply::changed(format!(
                    "✅ Group {} now shares {} requests per {}s across all members.",
                    group_id,
                    limit,
                    self.window_text()
                ))
            }
            Command::GroupUntotal(group) => {
                let removed = limiter.remove_group_total_limit(&group);
                let text = if removed {
                    format!("✅ Removed the shared budget for group {}.", group)
                } else {
                    format!("ℹ️ Group {} has no shared budget.", group)
                };
                Reply::when(removed, text)
            }
        };

        Ok(reply)
    }

    fn window_text(&self) -> String {
        format_seconds(self.limiter.get_status().time_window_seconds)
    }

    fn status_text(&self) -> String {
        let status = self.limiter.get_status();
        [
            "📊 LLM rate limit status".to_string(),
            format!(
                "├ Global limit: {} requests per {}s",
                status.max_requests,
                format_seconds(status.time_window_seconds)
            ),
            format!("├ Per-user limits: {}", status.user_limit_count),
            format!("├ Per-group limits: {}", status.group_limit_count),
            format!("├ Shared group budgets: {}", status.group_total_limit_count),
            format!("├ Whitelisted users: {}", status.whitelist_size),
            format!("└ Active users: {}", status.active_users),
        ]
        .join("\n")
    }

    fn limit_lines(&self, title: &str, limits: &[(String, u64)]) -> String {
        let window = self.window_text();
        let mut lines = vec![title.to_string()];
        lines.extend(
            limits
                .iter()
                .map(|(id, limit)| format!("  · {}: {} requests per {}s", id, limit, window)),
        );
        lines.join("\n")
    }
}

fn render_error(err: &RateLimitError) -> String {
    match err {
        RateLimitError::InvalidConfig { field, reason } => {
            format!("❌ Invalid {}: {}. Nothing was changed.", field, reason)
        }
        RateLimitError::UnknownCommand(input) => {
            format!("❓ Unrecognized command: {:?}\n{}", input, USAGE)
        }
        other => format!("❌ {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use crate::store::MemoryConfigStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    struct BrokenStore;

    #[async_trait]
    impl ConfigStore for BrokenStore {
        async fn save(&self, _config: &PluginConfig) -> Result<()> {
            Err(RateLimitError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }
    }

    /// Stalls the first save so a later one can overtake it.
    #[derive(Default)]
    struct SlowFirstStore {
        calls: AtomicUsize,
        last: StdMutex<Option<PluginConfig>>,
    }

    #[async_trait]
    impl ConfigStore for SlowFirstStore {
        async fn save(&self, config: &PluginConfig) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            *self.last.lock().unwrap() = Some(config.clone());
            Ok(())
        }
    }

    fn router() -> (Arc<RateLimiter>, CommandRouter) {
        let limiter = Arc::new(RateLimiter::new());
        let router = CommandRouter::new(Arc::clone(&limiter));
        (limiter, router)
    }

    #[tokio::test]
    async fn test_status_reports_configuration() {
        let (_, router) = router();
        let reply = router.handle("rl status").await;
        assert!(reply.contains("Global limit: 6 requests per 60s"));
        assert!(reply.contains("Whitelisted users: 0"));
    }

    #[tokio::test]
    async fn test_set_rate_applies_without_restart() {
        let (limiter, router) = router();
        let reply = router.handle("rl set rate 3").await;
        assert_eq!(reply, "✅ Global limit set to 3 requests per 60s.");

        let now = Instant::now();
        let admitted = (0..5).filter(|_| limiter.evaluate("erin", now).is_admitted()).count();
        assert_eq!(admitted, 3);
    }

    #[tokio::test]
    async fn test_invalid_values_are_reported_and_ignored() {
        let (limiter, router) = router();

        let reply = router.handle("rl set window 0").await;
        assert!(reply.starts_with("❌ Invalid time_window_seconds"));
        let reply = router.handle("rl set window -5").await;
        assert!(reply.starts_with("❌ Invalid time_window_seconds"));
        let reply = router.handle("rl set rate -1").await;
        assert!(reply.starts_with("❌ Invalid max_requests"));

        let status = limiter.get_status();
        assert_eq!(status.max_requests, 6);
        assert_eq!(status.time_window_seconds, 60.0);
    }

    #[tokio::test]
    async fn test_unknown_command_returns_usage() {
        let (_, router) = router();
        let reply = router.handle("rl whitelist purge").await;
        assert!(reply.starts_with("❓ Unrecognized command"));
        assert!(reply.contains("rl whitelist add <user_id>"));
    }

    #[tokio::test]
    async fn test_whitelist_commands() {
        let (limiter, router) = router();

        assert_eq!(router.handle("rl whitelist list").await, "📋 The whitelist is empty.");
        assert_eq!(
            router.handle("rl whitelist add bob").await,
            "✅ Added bob to the whitelist (1 whitelisted)."
        );
        assert_eq!(
            router.handle("rl whitelist add bob").await,
            "ℹ️ bob is already whitelisted."
        );
        router.handle("rl whitelist add amy").await;
        assert_eq!(
            router.handle("rl whitelist list").await,
            "📋 Whitelisted users:\n  1. amy\n  2. bob"
        );
        assert!(limiter.is_whitelisted("bob"));

        assert_eq!(
            router.handle("rl whitelist remove bob").await,
            "✅ Removed bob from the whitelist (1 whitelisted)."
        );
        assert_eq!(
            router.handle("rl whitelist remove bob").await,
            "ℹ️ bob is not whitelisted."
        );
    }

    #[tokio::test]
    async fn test_override_commands() {
        let (limiter, router) = router();

        router.handle("rl user set slow 2").await;
        router.handle("rl group set vip 9").await;
        router.handle("rl group total lobby 20").await;

        assert_eq!(limiter.resolve_max_requests("slow", Some("vip")), 2);
        assert_eq!(limiter.resolve_max_requests("other", Some("vip")), 9);

        let users = router.handle("rl user list").await;
        assert!(users.contains("slow: 2 requests per 60s"));

        let groups = router.handle("rl group list").await;
        assert!(groups.contains("vip: 9 requests per 60s"));
        assert!(groups.contains("lobby: 20 requests per 60s"));

        assert!(router.handle("rl group untotal lobby").await.starts_with("✅"));
        assert!(router.handle("rl group untotal lobby").await.starts_with("ℹ️"));
        assert!(router.handle("rl user remove slow").await.starts_with("✅"));
        assert!(router.handle("rl group remove vip").await.contains("global limit (6)"));
        assert_eq!(
            router.handle("rl group list").await,
            "📁 No group limits; every group uses the global limit."
        );
    }

    #[tokio::test]
    async fn test_mutations_are_persisted() {
        let limiter = Arc::new(RateLimiter::new());
        let store = Arc::new(MemoryConfigStore::new());
        let router = CommandRouter::with_store(Arc::clone(&limiter), store.clone());

        router.handle("rl status").await;
        router.handle("rl whitelist list").await;
        assert_eq!(store.save_count(), 0);

        router.handle("rl whitelist add bob").await;
        router.handle("rl set window 30").await;
        assert_eq!(store.save_count(), 2);

        let saved = store.last_saved().unwrap();
        assert_eq!(saved.whitelist, vec!["bob"]);
        assert_eq!(saved.time_window_seconds, 30.0);

        // Rejected changes are not persisted
        router.handle("rl set rate -4").await;
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn test_noop_commands_are_not_persisted() {
        let limiter = Arc::new(RateLimiter::new());
        let store = Arc::new(MemoryConfigStore::new());
        let router = CommandRouter::with_store(Arc::clone(&limiter), store.clone());

        router.handle("rl whitelist add bob").await;
        router.handle("rl whitelist add bob").await;
        assert_eq!(store.save_count(), 1);

        router.handle("rl user remove nobody").await;
        router.handle("rl group remove nowhere").await;
        router.handle("rl group untotal nowhere").await;
        router.handle("rl whitelist remove nobody").await;
        assert_eq!(store.save_count(), 1);

        router.handle("rl whitelist remove bob").await;
        assert_eq!(store.save_count(), 2);
    }

    #[test]
    fn test_execute_reports_changes() {
        let (_, router) = router();

        assert!(!router.execute(Command::Status).unwrap().changed);
        assert!(router.execute(Command::SetRate(4)).unwrap().changed);
        let set_user = Command::UserSet {
            user_id: "amy".to_string(),
            limit: 2,
        };
        assert!(router.execute(set_user).unwrap().changed);
        assert!(router.execute(Command::UserRemove("amy".to_string())).unwrap().changed);
        assert!(!router.execute(Command::UserRemove("amy".to_string())).unwrap().changed);
        assert!(router.execute(Command::SetWindow(-1.0)).is_err());
    }

    #[tokio::test]
    async fn test_overlapping_saves_keep_latest_config() {
        let limiter = Arc::new(RateLimiter::new());
        let store = Arc::new(SlowFirstStore::default());
        let router = CommandRouter::with_store(
            Arc::clone(&limiter),
            store.clone() as Arc<dyn ConfigStore>,
        );

        let (first, second) = tokio::join!(
            router.handle("rl set rate 3"),
            router.handle("rl set window 30")
        );
        assert!(first.starts_with("✅"));
        assert!(second.starts_with("✅"));

        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        let saved = store.last.lock().unwrap().clone().unwrap();
        assert_eq!(saved.max_requests, 3);
        assert_eq!(saved.time_window_seconds, 30.0);
        assert_eq!(saved, limiter.snapshot());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_runtime_change() {
        let limiter = Arc::new(RateLimiter::new());
        let router = CommandRouter::with_store(Arc::clone(&limiter), Arc::new(BrokenStore));

        let reply = router.handle("rl set rate 2").await;
        assert!(reply.starts_with("✅ Global limit set to 2"));
        assert!(reply.contains("could not be saved"));
        assert_eq!(limiter.get_status().max_requests, 2);
    }

    #[tokio::test]
    async fn test_concurrent_commands_and_evaluations() {
        let (limiter, router) = router();
        let router = Arc::new(router);

        let commands = (0..20).map(|i| {
            let router = Arc::clone(&router);
            async move { router.handle(&format!("rl whitelist add user_{}", i)).await }
        });
        let replies = futures::future::join_all(commands).await;

        assert!(replies.iter().all(|r| r.starts_with("✅")));
        assert_eq!(limiter.get_status().whitelist_size, 20);
    }
}
