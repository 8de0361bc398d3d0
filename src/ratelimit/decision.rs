//! Admission decisions and rejection rendering.

use std::fmt;

/// Which budget a rejected request ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// The requesting user's personal window
    User,
    /// The shared window of the user's group
    GroupTotal,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::User => write!(f, "user"),
            LimitScope::GroupTotal => write!(f, "group_total"),
        }
    }
}

/// Details of a rejected request.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Whole seconds until a slot frees up (at least 1)
    pub cooldown_secs: u64,
    /// The limit that was exceeded
    pub max_requests: u64,
    /// Window length at decision time
    pub window_secs: f64,
    /// Budget that was exhausted
    pub scope: LimitScope,
}

impl Rejection {
    /// Substitute `{cooldown}`, `{max}` and `{window}` in `template`.
    ///
    /// Any other braces are left as they are.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{cooldown}", &self.cooldown_secs.to_string())
            .replace("{max}", &self.max_requests.to_string())
            .replace("{window}", &format_seconds(self.window_secs))
    }
}

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request may proceed to the LLM backend
    Admit,
    /// The request is over limit
    Reject(Rejection),
}

impl Decision {
    /// Whether the request was admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }

    /// The rejection details, if rejected.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Decision::Admit => None,
            Decision::Reject(rejection) => Some(rejection),
        }
    }
}

/// Format a second count without a trailing `.0` for whole numbers.
pub fn format_seconds(secs: f64) -> String {
    if secs.fract() == 0.0 && secs.abs() < u64::MAX as f64 {
        format!("{}", secs as u64)
    } else {
        format!("{}", secs)
    }
}
