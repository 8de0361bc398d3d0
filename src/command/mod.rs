//! Administrator command parsing and routing.

mod parser;
mod router;

pub use parser::{is_admin_command, Command, COMMAND_PREFIX, USAGE};
pub use router::{CommandRouter, Reply};
