//! Classification of the VPN client's output lines.
//!
//! The client prints human-readable status text. Only a handful of lines
//! matter to the supervisor; they are recognized by pattern, first match
//! wins, in the order the variants of [`StdoutLine`] are declared.
//! Update these when the client's wording changes.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ParseWarning;

static RE_SAML_REDIRECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^SAML REDIRECT .*(?P<url>https?://.*)").unwrap());
static RE_CONNECTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?P<reason>session established|tunnel connected)").unwrap());
static RE_SESSION_EXPIRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Session authentication will expire at (?P<exp>.*)").unwrap());
static RE_GATEWAYS_AVAILABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<count>[0-9]+)\s*gateway servers available").unwrap());

/// Layout of the expiration timestamp, printed in local time
const SESSION_EXPIRY_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

const FAILURE_PREFIX: &str = "Failed";

/// A recognized line from the client's standard output
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StdoutLine<'a> {
    /// Browser login required; the URL to visit
    SamlRedirect { url: &'a str },
    /// The tunnel is up
    Connected { reason: &'a str },
    /// When the authenticated session ends (unparsed)
    SessionExpiry { raw: &'a str },
    /// How many gateways the portal offered
    GatewaysAvailable { count: &'a str },
    Other,
}

impl StdoutLine<'_> {
    /// True for lines that resolve a pending connect
    pub fn resolves_attempt(&self) -> bool {
        matches!(
            self,
            StdoutLine::SamlRedirect { .. } | StdoutLine::Connected { .. }
        )
    }
}

pub fn classify_stdout(line: &str) -> StdoutLine<'_> {
    if let Some(caps) = RE_SAML_REDIRECT.captures(line) {
        if let Some(url) = caps.name("url") {
            return StdoutLine::SamlRedirect {
                url: url.as_str().trim_end(),
            };
        }
    }
    if let Some(reason) = RE_CONNECTED.captures(line).and_then(|c| c.name("reason")) {
        return StdoutLine::Connected {
            reason: reason.as_str(),
        };
    }
    if let Some(exp) = RE_SESSION_EXPIRY
        .captures(line)
        .and_then(|c| c.name("exp"))
    {
        return StdoutLine::SessionExpiry {
            raw: exp.as_str().trim(),
        };
    }
    if let Some(count) = RE_GATEWAYS_AVAILABLE
        .captures(line)
        .and_then(|c| c.name("count"))
    {
        return StdoutLine::GatewaysAvailable {
            count: count.as_str(),
        };
    }
    StdoutLine::Other
}

/// Returns the line if it reports a failure on the client's stderr
pub fn classify_stderr(line: &str) -> Option<&str> {
    line.starts_with(FAILURE_PREFIX).then_some(line)
}

/// Parse the expiration printed by the client as a local timestamp
pub fn parse_session_expiry(raw: &str) -> Result<DateTime<Local>, ParseWarning> {
    let naive = NaiveDateTime::parse_from_str(raw, SESSION_EXPIRY_FORMAT).map_err(|source| {
        ParseWarning::SessionExpiry {
            raw: raw.to_string(),
            source,
        }
    })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ParseWarning::NonexistentLocalTime {
            raw: raw.to_string(),
        })
}
