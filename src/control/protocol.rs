//! Framing and parsing shared by server and clients.

use std::fmt::Display;

/// Terminates every reply.
pub const EOT: u8 = 0x04;

/// Default TCP port of the network control channel.
pub const DEFAULT_CTRL_PORT: u16 = 2020;

/// Maximum accepted request line length.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Requests are not read from a client while this much of its reply
/// data is still unsent.
pub const MAX_PENDING_OUTPUT: usize = 1024 * 1024;

/// Help lines for the commands every service understands.
pub const BUILTIN_HELP: &str = "\
logrotate      schedules log reopen event
terminate      schedules termination event
help           shows this help
";

/// One request line, split on spaces and tabs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub name: String,
    pub args: Vec<String>,
    /// The name was prefixed with `!`: close the connection after
    /// replying.
    pub close_after: bool,
}

impl ControlCommand {
    /// `None` for lines without any words.
    pub fn parse(line: &str) -> Option<ControlCommand> {
        let mut words = line
            .split([' ', '\t', '\r'])
            .filter(|w| !w.is_empty())
            .map(String::from);
        let first = words.next()?;
        let (name, close_after) = match first.strip_prefix('!') {
            Some(rest) => (rest.to_string(), true),
            None => (first, false),
        };
        Some(ControlCommand {
            name,
            args: words.collect(),
            close_after,
        })
    }

    pub fn arg(&self, i: usize) -> Option<&str> {
        self.args.get(i).map(|s| s.as_str())
    }
}

/// An error meant to be shown to the control client verbatim (as
/// `error: <message>`). Any other error from a command handler is
/// reported as a generic failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CtrlCommandError(pub String);

impl CtrlCommandError {
    pub fn new(msg: impl Display) -> Self {
        CtrlCommandError(msg.to_string())
    }
}

/// The error for a command nobody handled.
pub fn not_implemented(name: &str) -> CtrlCommandError {
    CtrlCommandError(format!("command <{name}> not implemented"))
}

/// Split reply text into lines; a first line starting with `error: `
/// turns the whole reply into an error.
pub fn parse_reply(text: &str) -> Result<Vec<String>, CtrlCommandError> {
    let lines: Vec<String> = text.lines().map(String::from).collect();
    if let Some(first) = lines.first() {
        if let Some(msg) = first.strip_prefix("error: ") {
            return Err(CtrlCommandError(msg.to_string()));
        }
    }
    Ok(lines)
}
