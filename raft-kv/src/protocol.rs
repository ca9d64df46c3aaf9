//! Line parser for the interactive client shell.

use anyhow::{Result, anyhow};

pub const USAGE: &str =
    "SET/s <key> <value>, GET/g <key>, CAS/c <key> <expected> <new>, HELP/h, EXIT/e";

/// Commands that can be entered at the shell prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Set {
        key: String,
        value: String,
    },
    Get {
        key: String,
    },
    Cas {
        key: String,
        expected: String,
        new: String,
    },
    Help,
    Exit,
}

impl ConsoleCommand {
    /// Parses one line of input. Command words are case-insensitive and
    /// have single-letter aliases; keys and values are taken verbatim.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized = match cmd.as_str() {
            "S" => "SET",
            "G" => "GET",
            "C" => "CAS",
            "H" => "HELP",
            "E" => "EXIT",
            other => other,
        };

        match (normalized, parts.len()) {
            ("HELP", 1) => Ok(ConsoleCommand::Help),
            ("EXIT", 1) => Ok(ConsoleCommand::Exit),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
            }),
            ("SET", 3) => Ok(ConsoleCommand::Set {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("CAS", 4) => Ok(ConsoleCommand::Cas {
                key: parts[1].to_string(),
                expected: parts[2].to_string(),
                new: parts[3].to_string(),
            }),
            ("GET", _) => Err(anyhow!("GET requires exactly one argument: GET <key>")),
            ("SET", _) => Err(anyhow!("SET requires exactly two arguments: SET <key> <value>")),
            ("CAS", _) => Err(anyhow!(
                "CAS requires exactly three arguments: CAS <key> <expected> <new>"
            )),
            _ => Err(anyhow!("invalid command. Try: {USAGE}")),
        }
    }
}
