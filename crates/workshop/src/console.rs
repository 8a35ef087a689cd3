//! Line commands typed on stdin.

use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::adapter::{ActionKind, Adapter};

pub const HELP: &str = "\
commands:
  connect      discover a device and open a session
  path <text>  set the derivation path
  tx [hex]     set the transaction (empty clears it)
  address      get the Ethereum address
  sign         sign the transaction
  show         render the page again
  help         this text
  quit         leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    SetPath(String),
    SetTransaction(String),
    Run(ActionKind),
    Show,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,
    #[error("`path` needs a derivation path")]
    MissingPath,
    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),
}

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(word, rest)| (word, rest.trim()));

        match word.to_ascii_lowercase().as_str() {
            "" => Err(ParseCommandError::Empty),
            "connect" => Ok(Self::Connect),
            "path" if rest.is_empty() => Err(ParseCommandError::MissingPath),
            "path" => Ok(Self::SetPath(rest.to_string())),
            "tx" => Ok(Self::SetTransaction(rest.to_string())),
            "address" => Ok(Self::Run(ActionKind::GetAddress)),
            "sign" => Ok(Self::Run(ActionKind::SignTransaction)),
            "show" => Ok(Self::Show),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(ParseCommandError::Unknown(other.to_string())),
        }
    }
}

/// What the loop does after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Render,
    Notice(String),
    Quit,
}

impl Command {
    /// Applies the command to the adapter.
    pub fn execute(self, adapter: &mut Adapter) -> Outcome {
        debug!(command = ?self, "executing");
        match self {
            Self::Connect => {
                adapter.discover_and_connect();
                Outcome::Render
            }
            Self::SetPath(path) => {
                adapter.set_derivation_path(path);
                Outcome::Render
            }
            Self::SetTransaction(tx) => {
                adapter.set_transaction(tx);
                Outcome::Render
            }
            Self::Run(kind) => {
                let request = adapter.request(kind);
                match adapter.start(request) {
                    Ok(()) => Outcome::Render,
                    Err(rejected) => Outcome::Notice(rejected.to_string()),
                }
            }
            Self::Show => Outcome::Render,
            Self::Help => Outcome::Notice(HELP.to_string()),
            Self::Quit => Outcome::Quit,
        }
    }
}
