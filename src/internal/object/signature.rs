//! Author/committer/tagger identity lines as they appear inside commit and
//! tag payloads: `<role> <name> <<email>> <unix-seconds> <tz>`.

use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureRole {
    Author,
    Committer,
    Tagger,
}

impl SignatureRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignatureRole::Author => "author",
            SignatureRole::Committer => "committer",
            SignatureRole::Tagger => "tagger",
        }
    }

    fn from_str_role(s: &str) -> Result<Self, GitError> {
        match s {
            "author" => Ok(SignatureRole::Author),
            "committer" => Ok(SignatureRole::Committer),
            "tagger" => Ok(SignatureRole::Tagger),
            other => Err(GitError::InvalidObject {
                kind: "signature",
                msg: format!("unknown role `{other}`"),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub role: SignatureRole,
    pub name: String,
    pub email: String,
    pub timestamp: i64,
    pub timezone: String,
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} <{}> {} {}",
            self.name, self.email, self.timestamp, self.timezone
        )
    }
}

impl Signature {
    pub fn new(role: SignatureRole, name: String, email: String) -> Self {
        Self {
            role,
            name,
            email,
            timestamp: chrono::Utc::now().timestamp(),
            timezone: "+0000".to_string(),
        }
    }

    /// Parse one signature line, e.g.
    /// `author Alice <alice@example.com> 1700000000 +0100`.
    pub fn from_data(line: &[u8]) -> Result<Signature, GitError> {
        let malformed = |msg: &str| GitError::InvalidObject {
            kind: "signature",
            msg: msg.to_string(),
        };

        let sp = line.find_byte(b' ').ok_or_else(|| malformed("no role"))?;
        let role = SignatureRole::from_str_role(
            std::str::from_utf8(&line[..sp]).map_err(|e| GitError::Conversion(e.to_string()))?,
        )?;
        let rest = &line[sp + 1..];

        let lt = rest.find_byte(b'<').ok_or_else(|| malformed("no email"))?;
        let gt = rest.find_byte(b'>').ok_or_else(|| malformed("no email"))?;
        if gt < lt {
            return Err(malformed("email brackets reversed"));
        }
        let name = rest[..lt].trim_end().to_str_lossy().to_string();
        let email = rest[lt + 1..gt].to_str_lossy().to_string();

        let tail = rest[gt + 1..].trim().to_str_lossy().to_string();
        let mut parts = tail.split_whitespace();
        let timestamp = parts
            .next()
            .ok_or_else(|| malformed("no timestamp"))?
            .parse::<i64>()
            .map_err(|_| malformed("bad timestamp"))?;
        let timezone = parts.next().unwrap_or("+0000").to_string();

        Ok(Signature {
            role,
            name,
            email,
            timestamp,
            timezone,
        })
    }

    /// Serialize back to the payload line (without trailing newline).
    pub fn to_data(&self) -> Result<Vec<u8>, GitError> {
        Ok(format!(
            "{} {} <{}> {} {}",
            self.role.as_str(),
            self.name,
            self.email,
            self.timestamp,
            self.timezone
        )
        .into_bytes())
    }
}
