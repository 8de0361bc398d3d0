//! Host-facing plugin boundary.
//!
//! Turns host message events into limiter and router calls. Faults inside the
//! limiter never escape to the host; they degrade according to the configured
//! [`FailPolicy`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::command::{is_admin_command, CommandRouter};
use crate::config::{FailPolicy, PluginConfig};
use crate::error::Result;
use crate::ratelimit::{Decision, RateLimiter};
use crate::store::ConfigStore;

/// Reply used when the limiter faults under a fail-closed policy.
pub const FAULT_MESSAGE: &str = "⚠️ The rate limiter is unavailable, please try again later.";

/// An incoming chat message as delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Sender's user identifier
    pub sender_id: String,
    /// Group the message was sent in, `None` for private messages
    pub group_id: Option<String>,
    /// Message text
    pub text: String,
}

impl MessageEvent {
    /// A private message.
    pub fn new(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            group_id: None,
            text: text.into(),
        }
    }

    /// Mark the message as sent in `group_id`.
    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// What the host should do with an LLM request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Forward the request to the LLM backend
    PassThrough,
    /// Stop the request and send this text to the user
    Blocked(String),
}

/// The rate limit plugin as seen by the host.
pub struct RateLimitPlugin {
    limiter: Arc<RateLimiter>,
    router: CommandRouter,
}

impl RateLimitPlugin {
    /// Build the plugin from configuration, persisting admin changes through `store`.
    pub fn from_config(config: &PluginConfig, store: Option<Arc<dyn ConfigStore>>) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::from_config(config)?);
        let router = match store {
            Some(store) => CommandRouter::with_store(Arc::clone(&limiter), store),
            None => CommandRouter::new(Arc::clone(&limiter)),
        };

        info!(
            max_requests = config.max_requests,
            window_secs = config.time_window_seconds,
            fail_policy = ?config.fail_policy,
            "Rate limit plugin initialized"
        );

        Ok(Self { limiter, router })
    }

    /// The underlying limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Decide whether an LLM request may proceed, using the current time.
    pub fn on_llm_request(&self, event: &MessageEvent) -> Outcome {
        self.on_llm_request_at(event, Instant::now())
    }

    /// Decide whether an LLM request may proceed at `now`.
    pub fn on_llm_request_at(&self, event: &MessageEvent, now: Instant) -> Outcome {
        let outcome = self.guarded(|| {
            self.limiter
                .evaluate_in(&event.sender_id, event.group_id.as_deref(), now)
        });

        if let Outcome::Blocked(_) = &outcome {
            info!(
                user = %event.sender_id,
                group = ?event.group_id,
                "LLM request blocked"
            );
        }
        outcome
    }

    /// Handle a message from an administrator.
    ///
    /// Returns `None` when the message is not a rate limit command.
    pub async fn on_admin_message(&self, text: &str) -> Option<String> {
        if !is_admin_command(text) {
            return None;
        }
        Some(self.router.handle(text).await)
    }

    fn guarded<F>(&self, evaluate: F) -> Outcome
    where
        F: FnOnce() -> Decision,
    {
        match panic::catch_unwind(AssertUnwindSafe(evaluate)) {
            Ok(Decision::Admit) => Outcome::PassThrough,
            Ok(Decision::Reject(rejection)) => {
                Outcome::Blocked(rejection.render(&self.limiter.tip_message()))
            }
            Err(_) => {
                let policy = self.limiter.fail_policy();
                error!(policy = ?policy, "Rate limit evaluation failed");
                match policy {
                    FailPolicy::FailOpen => Outcome::PassThrough,
                    FailPolicy::FailClosed => Outcome::Blocked(FAULT_MESSAGE.to_string()),
                }
            }
        }
    }
}
