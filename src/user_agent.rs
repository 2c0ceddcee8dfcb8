//! `User-Agent` header construction.
//!
//! A caller-supplied agent is sanitized (printable ASCII only, collapsed
//! whitespace) and truncated so that together with the SDK's own agent the
//! header never exceeds 255 characters.

use crate::network::DEFAULT_USER_AGENT;

const MAX_HEADER_LEN: usize = 255;

/// Final `User-Agent` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgent(String);

impl UserAgent {
    pub fn new(custom: Option<&str>) -> Self {
        let sanitized = custom.map(sanitize).unwrap_or_default();
        let value = format!("{sanitized} {DEFAULT_USER_AGENT}").trim().to_string();
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UserAgent {
    fn default() -> Self {
        Self::new(None)
    }
}

fn sanitize(agent: &str) -> String {
    let printable: String = agent
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .collect();
    let collapsed = printable.split_whitespace().collect::<Vec<_>>().join(" ");

    let budget = MAX_HEADER_LEN - DEFAULT_USER_AGENT.len() - 1;
    if collapsed.len() > budget {
        // ASCII only at this point, so byte slicing is safe.
        collapsed[..budget].trim_end().to_string()
    } else {
        collapsed
    }
}
