//! Bearer token table standing in for the external identity service.
//!
//! Configured as a comma separated list of `user:token` or
//! `user:token:admin` entries.

use crate::errors::{Error, IngestError, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AccessTokens {
    by_token: HashMap<String, Caller>,
}

impl AccessTokens {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut tokens = Self::default();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').collect();
            let (user_id, token, is_admin) = match parts.as_slice() {
                [user, token] => (*user, *token, false),
                [user, token, "admin"] => (*user, *token, true),
                _ => {
                    return Err(Error::Config(format!(
                        "Access token entry '{}' is not user:token[:admin]",
                        entry
                    )))
                }
            };
            if user_id.is_empty() || token.is_empty() {
                return Err(Error::Config(format!(
                    "Access token entry '{}' has an empty user or token",
                    entry
                )));
            }
            tokens.insert(
                token,
                Caller {
                    user_id: user_id.to_string(),
                    is_admin,
                },
            );
        }

        Ok(tokens)
    }

    pub fn insert(&mut self, token: &str, caller: Caller) {
        self.by_token.insert(token.to_string(), caller);
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn authenticate(&self, token: Option<&str>) -> std::result::Result<Caller, IngestError> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| IngestError::Unauthenticated("Missing bearer token".to_string()))?;

        self.by_token
            .get(token)
            .cloned()
            .ok_or_else(|| IngestError::Unauthenticated("Could not validate credentials".to_string()))
    }
}
