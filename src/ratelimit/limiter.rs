//! Core rate limiter implementation.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use super::decision::{Decision, LimitScope, Rejection};
use super::window::SlidingWindow;
use crate::config::{dump_limit_list, window_duration, FailPolicy, PluginConfig};
use crate::error::{RateLimitError, Result};

/// Evaluations between opportunistic sweeps of idle windows.
const SWEEP_INTERVAL: u64 = 256;
/// How long past the window a key must stay quiet before its state is dropped.
const IDLE_GRACE: Duration = Duration::from_secs(60);
/// Window length of [`PluginConfig::default`].
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Read-only snapshot of the limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// Global per-user limit
    pub max_requests: u64,
    /// Window length in seconds
    pub time_window_seconds: f64,
    /// Number of whitelisted users
    pub whitelist_size: usize,
    /// Users with at least one request in their window
    pub active_users: usize,
    /// Number of per-user overrides
    pub user_limit_count: usize,
    /// Number of per-group overrides
    pub group_limit_count: usize,
    /// Number of shared group budgets
    pub group_total_limit_count: usize,
}

/// Everything guarded by the limiter lock.
struct LimiterState {
    max_requests: u64,
    time_window: Duration,
    time_window_secs: f64,
    tip_message: String,
    fail_policy: FailPolicy,
    whitelist: BTreeSet<String>,
    user_limits: BTreeMap<String, u64>,
    group_limits: BTreeMap<String, u64>,
    group_total_limits: BTreeMap<String, u64>,
    user_windows: HashMap<String, SlidingWindow>,
    group_windows: HashMap<String, SlidingWindow>,
    evaluations_since_sweep: u64,
}

impl LimiterState {
    fn resolve_max_requests(&self, user_id: &str, group_id: Option<&str>) -> u64 {
        if let Some(&limit) = self.user_limits.get(user_id) {
            return limit;
        }
        if let Some(&limit) = group_id.and_then(|g| self.group_limits.get(g)) {
            return limit;
        }
        self.max_requests
    }

    fn clear_windows(&mut self) {
        self.user_windows.clear();
        self.group_windows.clear();
    }

    /// Drop windows that have been quiet for longer than the window plus grace.
    fn maybe_sweep(&mut self, now: Instant) {
        self.evaluations_since_sweep += 1;
        if self.evaluations_since_sweep < SWEEP_INTERVAL {
            return;
        }
        self.evaluations_since_sweep = 0;

        let idle_after = self.time_window.saturating_add(IDLE_GRACE);
        let users_before = self.user_windows.len();
        let groups_before = self.group_windows.len();
        self.user_windows.retain(|_, w| !w.is_idle(now, idle_after));
        self.group_windows.retain(|_, w| !w.is_idle(now, idle_after));

        debug!(
            evicted_users = users_before - self.user_windows.len(),
            evicted_groups = groups_before - self.group_windows.len(),
            "Swept idle rate limit windows"
        );
    }
}

/// Prune the window for `key` and return the cooldown if it is full.
///
/// A window left empty by a rejection is removed so that idle keys do not
/// accumulate.
fn check_window(
    windows: &mut HashMap<String, SlidingWindow>,
    key: &str,
    limit: u64,
    now: Instant,
    window: Duration,
) -> Option<u64> {
    let Some(entry) = windows.get_mut(key) else {
        return if limit > 0 {
            None
        } else {
            Some(SlidingWindow::new().cooldown_secs(now, window))
        };
    };

    entry.prune(now, window);
    if entry.has_capacity(limit) {
        return None;
    }

    let cooldown = entry.cooldown_secs(now, window);
    if entry.is_empty() {
        windows.remove(key);
    }
    Some(cooldown)
}

fn validate_count(field: &'static str, n: i64) -> Result<u64> {
    u64::try_from(n).map_err(|_| {
        RateLimitError::invalid(field, format!("must be zero or greater, got {}", n))
    })
}

/// Per-user sliding window rate limiter with whitelist and limit overrides.
///
/// All state sits behind a single lock; each evaluation holds it for the whole
/// prune, count and append sequence. This struct is thread-safe and can be
/// shared across tasks behind an `Arc`.
pub struct RateLimiter {
    state: RwLock<LimiterState>,
}

impl RateLimiter {
    /// Create a new rate limiter with default settings.
    pub fn new() -> Self {
        Self::with_window(&PluginConfig::default(), DEFAULT_WINDOW)
    }

    /// Create a rate limiter from a loaded configuration.
    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        let time_window = window_duration(config.time_window_seconds)?;
        Ok(Self::with_window(config, time_window))
    }

    fn with_window(config: &PluginConfig, time_window: Duration) -> Self {
        let state = LimiterState {
            max_requests: config.max_requests,
            time_window,
            time_window_secs: config.time_window_seconds,
            tip_message: config.tip_message.clone(),
            fail_policy: config.fail_policy,
            whitelist: config.whitelist.iter().cloned().collect(),
            user_limits: config.user_limit_map(),
            group_limits: config.group_limit_map(),
            group_total_limits: config.group_total_limit_map(),
            user_windows: HashMap::new(),
            group_windows: HashMap::new(),
            evaluations_since_sweep: 0,
        };

        debug!(
            max_requests = state.max_requests,
            window_secs = state.time_window_secs,
            whitelist = state.whitelist.len(),
            "Rate limiter configured"
        );

        Self {
            state: RwLock::new(state),
        }
    }

    /// Evaluate a request from `user_id` at `now`.
    pub fn evaluate(&self, user_id: &str, now: Instant) -> Decision {
        self.evaluate_in(user_id, None, now)
    }

    /// Evaluate a request from `user_id`, sent in `group_id` (if any), at `now`.
    ///
    /// The personal window is checked first, then the group's shared budget if
    /// one is configured. Neither window is charged unless both have room.
    pub fn evaluate_in(&self, user_id: &str, group_id: Option<&str>, now: Instant) -> Decision {
        let mut guard = self.state.write();
        let state = &mut *guard;
        state.maybe_sweep(now);

        if state.whitelist.contains(user_id) {
            trace!(user = %user_id, "Whitelisted user admitted");
            return Decision::Admit;
        }

        let window = state.time_window;
        let limit = state.resolve_max_requests(user_id, group_id);

        trace!(user = %user_id, group = ?group_id, limit = limit, "Checking rate limit");

        if let Some(cooldown) = check_window(&mut state.user_windows, user_id, limit, now, window) {
            debug!(user = %user_id, cooldown = cooldown, "User rate limit exceeded");
            return Decision::Reject(Rejection {
                cooldown_secs: cooldown,
                max_requests: limit,
                window_secs: state.time_window_secs,
                scope: LimitScope::User,
            });
        }

        let group_total = group_id
            .and_then(|g| state.group_total_limits.get(g).map(|&total| (g, total)));

        if let Some((group, total)) = group_total {
            if let Some(cooldown) = check_window(&mut state.group_windows, group, total, now, window) {
                if state.user_windows.get(user_id).is_some_and(SlidingWindow::is_empty) {
                    state.user_windows.remove(user_id);
                }
                debug!(user = %user_id, group = %group, cooldown = cooldown, "Group total limit exceeded");
                return Decision::Reject(Rejection {
                    cooldown_secs: cooldown,
                    max_requests: total,
                    window_secs: state.time_window_secs,
                    scope: LimitScope::GroupTotal,
                });
            }
            state.group_windows.entry(group.to_string()).or_default().record(now);
        }

        state.user_windows.entry(user_id.to_string()).or_default().record(now);
        Decision::Admit
    }

    /// Evaluate a request against the current monotonic time.
    pub fn evaluate_now(&self, user_id: &str, group_id: Option<&str>) -> Decision {
        self.evaluate_in(user_id, group_id, Instant::now())
    }

    /// Add a user to the whitelist. Returns whether the user was newly added.
    pub fn add_to_whitelist(&self, user_id: &str) -> bool {
        let added = self.state.write().whitelist.insert(user_id.to_string());
        if added {
            info!(user = %user_id, "User added to whitelist");
        }
        added
    }

    /// Remove a user from the whitelist. Returns whether the user was present.
    ///
    /// The user's window is discarded so they start from an empty window.
    pub fn remove_from_whitelist(&self, user_id: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.whitelist.remove(user_id);
        if removed {
            state.user_windows.remove(user_id);
            info!(user = %user_id, "User removed from whitelist");
        }
        removed
    }

    /// Whitelisted users in sorted order.
    pub fn list_whitelist(&self) -> Vec<String> {
        self.state.read().whitelist.iter().cloned().collect()
    }

    /// Whether `user_id` is whitelisted.
    pub fn is_whitelisted(&self, user_id: &str) -> bool {
        self.state.read().whitelist.contains(user_id)
    }

    /// Set the global per-user limit. Zero rejects every non-whitelisted user.
    pub fn set_max_requests(&self, n: i64) -> Result<()> {
        let n = validate_count("max_requests", n)?;
        self.state.write().max_requests = n;
        info!(max_requests = n, "Global request limit updated");
        Ok(())
    }

    /// Set the window length in seconds. Clears all windows.
    pub fn set_time_window(&self, seconds: f64) -> Result<()> {
        let window = window_duration(seconds)?;
        let mut state = self.state.write();
        state.time_window = window;
        state.time_window_secs = seconds;
        state.clear_windows();
        info!(window_secs = seconds, "Time window updated, counters reset");
        Ok(())
    }

    /// Set a per-user limit that takes priority over group and global limits.
    pub fn set_user_limit(&self, user_id: &str, n: i64) -> Result<()> {
        let n = validate_count("user_limit", n)?;
        let mut state = self.state.write();
        state.user_limits.insert(user_id.to_string(), n);
        state.user_windows.remove(user_id);
        info!(user = %user_id, limit = n, "User limit set");
        Ok(())
    }

    /// Remove a per-user limit. Returns whether one existed.
    pub fn remove_user_limit(&self, user_id: &str) -> bool {
        let removed = self.state.write().user_limits.remove(user_id).is_some();
        if removed {
            info!(user = %user_id, "User limit removed");
        }
        removed
    }

    /// Per-user limits in sorted order.
    pub fn user_limits(&self) -> Vec<(String, u64)> {
        self.state.read().user_limits.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Set the per-member limit for a group.
    pub fn set_group_limit(&self, group_id: &str, n: i64) -> Result<()> {
        let n = validate_count("group_limit", n)?;
        self.state.write().group_limits.insert(group_id.to_string(), n);
        info!(group = %group_id, limit = n, "Group limit set");
        Ok(())
    }

    /// Remove a per-member group limit. Returns whether one existed.
    pub fn remove_group_limit(&self, group_id: &str) -> bool {
        let removed = self.state.write().group_limits.remove(group_id).is_some();
        if removed {
            info!(group = %group_id, "Group limit removed");
        }
        removed
    }

    /// Per-member group limits in sorted order.
    pub fn group_limits(&self) -> Vec<(String, u64)> {
        self.state.read().group_limits.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Set a budget shared by every member of a group. Clears that group's window.
    pub fn set_group_total_limit(&self, group_id: &str, n: i64) -> Result<()> {
        let n = validate_count("group_total_limit", n)?;
        let mut state = self.state.write();
        state.group_total_limits.insert(group_id.to_string(), n);
        state.group_windows.remove(group_id);
        info!(group = %group_id, limit = n, "Group total limit set");
        Ok(())
    }

    /// Remove a shared group budget. Returns whether one existed.
    pub fn remove_group_total_limit(&self, group_id: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.group_total_limits.remove(group_id).is_some();
        if removed {
            state.group_windows.remove(group_id);
            info!(group = %group_id, "Group total limit removed");
        }
        removed
    }

    /// Shared group budgets in sorted order.
    pub fn group_total_limits(&self) -> Vec<(String, u64)> {
        self.state
            .read()
            .group_total_limits
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// The limit that applies to `user_id` in `group_id`.
    pub fn resolve_max_requests(&self, user_id: &str, group_id: Option<&str>) -> u64 {
        self.state.read().resolve_max_requests(user_id, group_id)
    }

    /// Replace the rejection template.
    pub fn set_tip_message(&self, template: &str) {
        self.state.write().tip_message = template.to_string();
    }

    /// The current rejection template.
    pub fn tip_message(&self) -> String {
        self.state.read().tip_message.clone()
    }

    /// Policy to apply when evaluation faults.
    pub fn fail_policy(&self) -> FailPolicy {
        self.state.read().fail_policy
    }

    /// Read-only snapshot of the configuration and activity.
    pub fn get_status(&self) -> Status {
        self.get_status_at(Instant::now())
    }

    /// Status as of `now`. Only users with a request inside the window ending
    /// at `now` count as active.
    pub fn get_status_at(&self, now: Instant) -> Status {
        let state = self.state.read();
        let window = state.time_window;
        Status {
            max_requests: state.max_requests,
            time_window_seconds: state.time_window_secs,
            whitelist_size: state.whitelist.len(),
            active_users: state
                .user_windows
                .values()
                .filter(|w| w.newest().is_some_and(|t| now.saturating_duration_since(t) < window))
                .count(),
            user_limit_count: state.user_limits.len(),
            group_limit_count: state.group_limits.len(),
            group_total_limit_count: state.group_total_limits.len(),
        }
    }

    /// The full current configuration, suitable for persisting.
    pub fn snapshot(&self) -> PluginConfig {
        let state = self.state.read();
        PluginConfig {
            max_requests: state.max_requests,
            time_window_seconds: state.time_window_secs,
            whitelist: state.whitelist.iter().cloned().collect(),
            tip_message: state.tip_message.clone(),
            user_limits: dump_limit_list(&state.user_limits),
            group_limits: dump_limit_list(&state.group_limits),
            group_total_limits: dump_limit_list(&state.group_total_limits),
            fail_policy: state.fail_policy,
        }
    }

    /// Number of users with window state held in memory.
    pub fn tracked_users(&self) -> usize {
        self.state.read().user_windows.len()
    }

    /// Clear all windows.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.state.write().clear_windows();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
