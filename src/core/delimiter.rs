//! Heredoc delimiters for nested remote sessions.
//!
//! Each session body is passed to `ssh` as a quoted heredoc. Nested bodies only stay intact if
//! every delimiter in the plan is distinct, so tokens are derived from the node's tier and
//! position and handed out at most once per plan.

use crate::core::topology::{Node, Tier};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fmt::{self, Display};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Delimiter(String);

impl Delimiter {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
impl Delimiter {
    pub fn named(token: &str) -> Self {
        Delimiter(token.to_string())
    }
}

impl Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out delimiters for one plan.
#[derive(Debug, Default)]
pub struct DelimiterRegistry {
    claimed: HashSet<String>,
}

impl DelimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the delimiter for `node`'s session. Fails if the token was already handed out.
    pub fn claim(&mut self, node: &Node) -> Result<Delimiter> {
        let token = token_for(node)?;
        if !self.claimed.insert(token.clone()) {
            return Err(Error::DelimiterCollision(format!(
                "{token} was already claimed in this plan",
            )));
        }
        Ok(Delimiter(token))
    }

    pub fn is_claimed(&self, token: &str) -> bool {
        self.claimed.contains(token)
    }
}

fn token_for(node: &Node) -> Result<String> {
    let p = node.position;
    let token = match (node.tier, p.regional, p.edge) {
        (Tier::Coordinator, _, _) => "COORDINATOR".to_string(),
        (Tier::Regional, Some(r), _) => format!("REGIONAL_{r}"),
        (Tier::Edge, Some(r), Some(e)) => format!("EDGE_{r}_{e}"),
        _ => {
            return Err(Error::DelimiterCollision(format!(
                "{} ({}) cannot host a session",
                node.name, node.tier,
            )))
        }
    };
    Ok(token)
}
