//! Admin command grammar.

use std::str::FromStr;

use crate::error::{RateLimitError, Result};

/// Keyword every admin command starts with.
pub const COMMAND_PREFIX: &str = "rl";

/// Usage text shown for unparseable input.
pub const USAGE: &str = "\
Usage:
  rl status
  rl whitelist add <user_id>
  rl whitelist remove <user_id>
  rl whitelist list
  rl set rate <integer>
  rl set window <seconds>
  rl user set <user_id> <integer>
  rl user remove <user_id>
  rl user list
  rl group set <group_id> <integer>
  rl group remove <group_id>
  rl group list
  rl group total <group_id> <integer>
  rl group untotal <group_id>
  rl help";

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Show configuration and activity
    Status,
    /// Exempt a user from limiting
    WhitelistAdd(String),
    /// Remove a user's exemption
    WhitelistRemove(String),
    /// List exempt users
    WhitelistList,
    /// Set the global per-user limit
    SetRate(i64),
    /// Set the window length in seconds
    SetWindow(f64),
    /// Override the limit for one user
    UserSet { user_id: String, limit: i64 },
    /// Drop a per-user override
    UserRemove(String),
    /// List per-user overrides
    UserList,
    /// Override the per-member limit for a group
    GroupSet { group_id: String, limit: i64 },
    /// Drop a per-group override
    GroupRemove(String),
    /// List per-group overrides and shared budgets
    GroupList,
    /// Set a budget shared by the whole group
    GroupTotal { group_id: String, limit: i64 },
    /// Drop a shared group budget
    GroupUntotal(String),
    /// Show usage
    Help,
}

/// Whether `text` is addressed to the rate limit command group.
///
/// A leading `/` is accepted since most chat hosts use it for commands.
pub fn is_admin_command(text: &str) -> bool {
    text.split_whitespace()
        .next()
        .is_some_and(|first| first.strip_prefix('/').unwrap_or(first) == COMMAND_PREFIX)
}

fn unknown(input: &str) -> RateLimitError {
    RateLimitError::UnknownCommand(input.trim().to_string())
}

fn parse_count(input: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>().map_err(|_| unknown(input))
}

impl Command {
    /// Parse a full command line such as `rl whitelist add alice`.
    pub fn parse(input: &str) -> Result<Self> {
        if !is_admin_command(input) {
            return Err(unknown(input));
        }

        let args: Vec<&str> = input.split_whitespace().skip(1).collect();

        let command = match args.as_slice() {
            ["status"] => Command::Status,
            ["help"] => Command::Help,
            ["whitelist", "add", user] => Command::WhitelistAdd(user.to_string()),
            ["whitelist", "remove", user] => Command::WhitelistRemove(user.to_string()),
            ["whitelist", "list"] => Command::WhitelistList,
            ["set", "rate", n] => Command::SetRate(parse_count(input, n)?),
            ["set", "window", secs] => {
                Command::SetWindow(secs.parse::<f64>().map_err(|_| unknown(input))?)
            }
            ["user", "set", user, n] => Command::UserSet {
                user_id: user.to_string(),
                limit: parse_count(input, n)?,
            },
            ["user", "remove", user] => Command::UserRemove(user.to_string()),
            ["user", "list"] => Command::UserList,
            ["group", "set", group, n] => Command::GroupSet {
                group_id: group.to_string(),
                limit: parse_count(input, n)?,
            },
            ["group", "remove", group] => Command::GroupRemove(group.to_string()),
            ["group", "list"] => Command::GroupList,
            ["group", "total", group, n] => Command::GroupTotal {
                group_id: group.to_string(),
                limit: parse_count(input, n)?,
            },
            ["group", "untotal", group] => Command::GroupUntotal(group.to_string()),
            _ => return Err(unknown(input)),
        };

        Ok(command)
    }
}

impl FromStr for Command {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        Command::parse(s)
    }
}
