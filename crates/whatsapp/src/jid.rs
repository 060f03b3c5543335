//! Protocol addresses (`user@server`).

use std::{fmt, str::FromStr};

use crate::error::Error;

pub const USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    pub user: String,
    pub server: String,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid jid: {0:?}")]
pub struct InvalidJid(pub String);

impl Jid {
    /// A regular user address on the default server.
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: USER_SERVER.into(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// Build a target address from caller input: either a full `user@server`
    /// address or a phone number, optionally with a leading `+` and the usual
    /// separators (`+1 (555) 123-4567`).
    pub fn from_phone(input: &str) -> Result<Self, Error> {
        let input = input.trim();
        if input.contains('@') {
            return input
                .parse()
                .map_err(|e: InvalidJid| Error::Validation(e.to_string()));
        }

        let digits: String = input
            .trim_start_matches('+')
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
            .collect();
        if digits.len() < 5 || digits.len() > 20 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::Validation(format!("invalid phone: {input:?}")));
        }
        Ok(Self::user(digits))
    }
}

impl FromStr for Jid {
    type Err = InvalidJid;

    /// Parses `user@server`, dropping any `:device` or `.agent` suffix from
    /// the user part.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, server) = s.split_once('@').ok_or_else(|| InvalidJid(s.to_string()))?;
        let user = user.split([':', '.']).next().unwrap_or_default();
        if user.is_empty() || server.is_empty() || server.contains('@') {
            return Err(InvalidJid(s.to_string()));
        }
        Ok(Self {
            user: user.to_string(),
            server: server.to_string(),
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}
