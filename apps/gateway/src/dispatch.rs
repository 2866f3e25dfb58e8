use crate::interaction::CommandInvocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    Start,
    Stop,
    Status,
}

impl Subcommand {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "status" => Some(Self::Status),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Status => "status",
        }
    }
}

/// A command that cannot be routed. Rendered to the caller as an ephemeral message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnknownCommand(String),
    MissingSubcommand { command: String },
    UnknownSubcommand(String),
}

impl Rejection {
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::UnknownCommand(name) => format!("Unknown command: {name}"),
            Self::MissingSubcommand { command } => format!(
                "No subcommand provided. Use `/{command} start`, `/{command} stop` or `/{command} status`."
            ),
            Self::UnknownSubcommand(name) => format!("Unknown subcommand: {name}"),
        }
    }
}

pub fn route(command_name: &str, invocation: &CommandInvocation) -> Result<Subcommand, Rejection> {
    if !invocation.name.eq_ignore_ascii_case(command_name) {
        return Err(Rejection::UnknownCommand(invocation.name.clone()));
    }
    let Some(raw) = invocation.subcommand.as_deref() else {
        return Err(Rejection::MissingSubcommand {
            command: command_name.to_string(),
        });
    };
    Subcommand::parse(raw).ok_or_else(|| Rejection::UnknownSubcommand(raw.to_string()))
}
