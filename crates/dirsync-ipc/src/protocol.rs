//! Control commands

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A command understood by the control socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Report the current summary
    Status,
    /// Shut the daemon down
    Stop,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Status => "status",
            ControlCommand::Stop => "stop",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown control command: {0:?}")]
pub struct ParseCommandError(pub String);

impl FromStr for ControlCommand {
    type Err = ParseCommandError;

    /// Parses one request line; surrounding whitespace and case are ignored
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        if line.eq_ignore_ascii_case("status") {
            Ok(ControlCommand::Status)
        } else if line.eq_ignore_ascii_case("stop") {
            Ok(ControlCommand::Stop)
        } else {
            Err(ParseCommandError(line.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("status".parse(), Ok(ControlCommand::Status));
        assert_eq!("STOP\r\n".parse(), Ok(ControlCommand::Stop));
        assert_eq!("  Status \n".parse(), Ok(ControlCommand::Status));
    }

    #[test]
    fn test_parse_rejects_anything_else() {
        assert!("".parse::<ControlCommand>().is_err());
        assert!("stop now".parse::<ControlCommand>().is_err());
        assert_eq!(
            "restart".parse::<ControlCommand>(),
            Err(ParseCommandError("restart".to_string()))
        );
    }

    #[test]
    fn test_display_round_trips() {
        for command in [ControlCommand::Status, ControlCommand::Stop] {
            assert_eq!(command.to_string().parse(), Ok(command));
        }
    }
}
