//! Interactive console commands
//!
//! Lines read from stdin stand in for the host: they deliver suspend/resume
//! and permission changes to the discovery service, query its state, and on
//! the virtual bus plug or unplug ports.

use nano_link::{AccessStatus, LinkEvent};
use thiserror::Error;

/// One parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Suspend,
    Resume,
    /// Permission changed
    Access(AccessStatus),
    AutoReconnect(bool),
    /// Print the candidate table
    Candidates,
    /// Print watcher states
    Watchers,
    /// Plug a configured virtual port again
    Plug(String),
    /// Unplug a virtual port
    Unplug(String),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),

    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),

    #[error("expected 'on' or 'off', got '{0}'")]
    BadToggle(String),
}

pub const HELP: &str = "\
commands:
  start | stop              start or stop the watchers
  suspend | resume          simulate host suspend / resume
  deny | deny-system        revoke serial access (by user / by policy)
  allow                     grant serial access again
  auto on|off               toggle auto-reconnect
  list                      show candidates
  watchers                  show watcher states
  plug <port>               re-plug a virtual port (--simulate)
  unplug <port>             unplug a virtual port (--simulate)
  quit";

/// Parse one console line
pub fn parse(line: &str) -> Result<ConsoleCommand, ParseError> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Err(ParseError::Empty);
    };
    let arg = words.next();

    let command = match word.to_ascii_lowercase().as_str() {
        "start" => ConsoleCommand::Start,
        "stop" => ConsoleCommand::Stop,
        "suspend" => ConsoleCommand::Suspend,
        "resume" => ConsoleCommand::Resume,
        "deny" => ConsoleCommand::Access(AccessStatus::DeniedByUser),
        "deny-system" => ConsoleCommand::Access(AccessStatus::DeniedBySystem),
        "allow" => ConsoleCommand::Access(AccessStatus::Allowed),
        "auto" => match arg {
            Some("on") => ConsoleCommand::AutoReconnect(true),
            Some("off") => ConsoleCommand::AutoReconnect(false),
            Some(other) => return Err(ParseError::BadToggle(other.to_string())),
            None => return Err(ParseError::MissingArgument("auto")),
        },
        "list" | "ls" => ConsoleCommand::Candidates,
        "watchers" => ConsoleCommand::Watchers,
        "plug" => ConsoleCommand::Plug(arg.ok_or(ParseError::MissingArgument("plug"))?.into()),
        "unplug" => {
            ConsoleCommand::Unplug(arg.ok_or(ParseError::MissingArgument("unplug"))?.into())
        }
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(command)
}

/// One-line rendering of an event for the terminal
pub fn format_event(event: &LinkEvent) -> String {
    match event {
        LinkEvent::DeviceConnected { identity } => format!("connected     {}", identity),
        LinkEvent::DeviceAboutToClose { identity } => format!("closing       {}", identity),
        LinkEvent::DiscoveryComplete { cycle, confirmed } => {
            format!("discovery     cycle {} done, {} confirmed", cycle, confirmed)
        }
        LinkEvent::CandidateAdded { identity } => format!("candidate     {}", identity),
        LinkEvent::DeviceConfirmed {
            identity,
            description,
        } => format!("confirmed     {} ({})", identity, description),
        LinkEvent::CandidateRejected { identity, reason } => {
            format!("rejected      {}: {}", identity, reason)
        }
        LinkEvent::CandidateDeferred { identity, reason } => {
            format!("deferred      {}: {}", identity, reason)
        }
        LinkEvent::DeviceRemoved { id } => format!("removed       {}", id),
        LinkEvent::Error { source, message } => format!("error         {}: {}", source, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_signals() {
        assert_eq!(parse("suspend").unwrap(), ConsoleCommand::Suspend);
        assert_eq!(parse("  Resume ").unwrap(), ConsoleCommand::Resume);
        assert_eq!(
            parse("deny").unwrap(),
            ConsoleCommand::Access(AccessStatus::DeniedByUser)
        );
        assert_eq!(
            parse("deny-system").unwrap(),
            ConsoleCommand::Access(AccessStatus::DeniedBySystem)
        );
        assert_eq!(
            parse("allow").unwrap(),
            ConsoleCommand::Access(AccessStatus::Allowed)
        );
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse("auto off").unwrap(), ConsoleCommand::AutoReconnect(false));
        assert_eq!(
            parse("unplug /dev/ttyACM0").unwrap(),
            ConsoleCommand::Unplug("/dev/ttyACM0".into())
        );
        assert_eq!(parse("plug").unwrap_err(), ParseError::MissingArgument("plug"));
        assert_eq!(
            parse("auto maybe").unwrap_err(),
            ParseError::BadToggle("maybe".into())
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("   ").unwrap_err(), ParseError::Empty);
        assert_eq!(parse("reboot").unwrap_err(), ParseError::Unknown("reboot".into()));
    }

    #[test]
    fn test_format_discovery_complete() {
        let line = format_event(&LinkEvent::DiscoveryComplete {
            cycle: 2,
            confirmed: 1,
        });
        assert!(line.contains("cycle 2"));
        assert!(line.contains("1 confirmed"));
    }

    proptest! {
        #[test]
        fn parse_never_panics(line in ".{0,40}") {
            let _ = parse(&line);
        }
    }
}
