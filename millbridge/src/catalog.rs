//! Command catalog and router.
//!
//! The mock controller answers command lines with canned responses
//! taken from a JSON catalog. Four namespaces are consulted in a fixed
//! order: host commands (whole-line prefix match), console commands
//! (first token, case-insensitive), then G- and M-codes matched on the
//! uppercased line. The router itself is pure; think-time sleeps and
//! `ok` suffixes are the session's job.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Namespace a command was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCategory {
    /// Host-protocol command (whole-line prefix).
    Host,
    /// Console command (first token).
    Console,
    /// G-code.
    GCode,
    /// M-code.
    MCode,
}

/// Canned behavior of a single command.
///
/// Catalog entries in the wild carry extra free-form fields
/// (descriptions, firmware version gates); those land in `extra`
/// untouched instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Response line sent back to the client.
    #[serde(default = "default_response")]
    pub response: String,
    /// Minimum think time in milliseconds before answering.
    #[serde(default = "default_time_ms")]
    pub time_ms: u64,
    /// Whether an `ok` line follows the response.
    #[serde(default)]
    pub sends_ok: bool,
    /// Unknown catalog fields, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_response() -> String {
    "ok".to_string()
}

fn default_time_ms() -> u64 {
    100
}

/// The full command catalog, loaded once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandCatalog {
    /// Host-protocol commands, matched as whole-line prefixes.
    #[serde(default)]
    pub host_commands: BTreeMap<String, CommandSpec>,
    /// Console commands, matched on the first token.
    #[serde(default)]
    pub console_commands: BTreeMap<String, CommandSpec>,
    /// G-codes.
    #[serde(default)]
    pub g_codes: BTreeMap<String, CommandSpec>,
    /// M-codes.
    #[serde(default)]
    pub m_codes: BTreeMap<String, CommandSpec>,
}

fn g_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(G\d+(?:\.\d+)?)").expect("static regex"))
}

fn m_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(M\d+(?:\.\d+)?)").expect("static regex"))
}

impl CommandCatalog {
    /// Load the catalog from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Catalog(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The catalog shipped with the crate.
    pub fn builtin() -> Self {
        serde_json::from_str(include_str!("../artifacts/commands.json"))
            .expect("embedded catalog is valid")
    }

    /// Resolve a trimmed command line to its catalog entry.
    ///
    /// Resolution order is fixed: host prefix, console token, G-code,
    /// M-code. First match wins; `None` means unknown command.
    pub fn resolve(&self, line: &str) -> Option<(&str, &CommandSpec, CommandCategory)> {
        let line = line.trim();

        for (key, spec) in &self.host_commands {
            if line.starts_with(key.as_str()) {
                return Some((key, spec, CommandCategory::Host));
            }
        }

        if let Some(token) = line.split_whitespace().next() {
            for (key, spec) in &self.console_commands {
                if key.eq_ignore_ascii_case(token) {
                    return Some((key, spec, CommandCategory::Console));
                }
            }
        }

        let upper = line.to_ascii_uppercase();
        if let Some(caps) = g_code_regex().captures(&upper) {
            let code = caps.get(1).map_or("", |m| m.as_str());
            if let Some((key, spec)) = self.g_codes.get_key_value(code) {
                return Some((key, spec, CommandCategory::GCode));
            }
        }
        if let Some(caps) = m_code_regex().captures(&upper) {
            let code = caps.get(1).map_or("", |m| m.as_str());
            if let Some((key, spec)) = self.m_codes.get_key_value(code) {
                return Some((key, spec, CommandCategory::MCode));
            }
        }

        None
    }

    /// Entry counts per namespace: (host, console, g, m).
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.host_commands.len(),
            self.console_commands.len(),
            self.g_codes.len(),
            self.m_codes.len(),
        )
    }
}
