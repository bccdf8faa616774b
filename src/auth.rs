//! Per-session access tokens for reviewer agents and the human-assist
//! mediator. Tokens are opaque random bytes, never derived from model ids.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ReviewError, Result};

/// Pseudo-reviewer id used for operator-raised issues and assist opinions.
pub const HUMAN_MODEL_ID: &str = "human";

/// Mint a fresh opaque token: 24 random bytes, hex-encoded.
pub fn mint_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Token set owned by one session, persisted to `tokens.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessKeys {
    agent_keys: HashMap<String, String>,
    human_assist_key: Option<String>,
}

impl AccessKeys {
    /// Get or mint the access key for one configured agent.
    pub fn ensure_agent_key(&mut self, model_id: &str) -> String {
        self.agent_keys
            .entry(model_id.to_string())
            .or_insert_with(mint_token)
            .clone()
    }

    pub fn agent_key(&self, model_id: &str) -> Option<&str> {
        self.agent_keys.get(model_id).map(String::as_str)
    }

    pub fn remove_agent(&mut self, model_id: &str) {
        self.agent_keys.remove(model_id);
    }

    /// Mint (rotating any previous value) the human-assist key.
    pub fn rotate_human_assist_key(&mut self) -> String {
        let key = mint_token();
        self.human_assist_key = Some(key.clone());
        key
    }

    /// Verify that `key` authorizes `model_id` on this session.
    ///
    /// The human-assist key authorizes only the `human` pseudo-reviewer.
    pub fn authorize(&self, model_id: &str, key: &str) -> Result<()> {
        if model_id == HUMAN_MODEL_ID {
            if self.human_assist_key.as_deref() == Some(key) {
                return Ok(());
            }
            return Err(ReviewError::Auth("invalid human-assist key".into()));
        }
        match self.agent_keys.get(model_id) {
            Some(expected) if expected == key => Ok(()),
            Some(_) => Err(ReviewError::Auth(format!(
                "key does not match agent {}",
                model_id
            ))),
            None => Err(ReviewError::Auth(format!(
                "no key issued for agent {}",
                model_id
            ))),
        }
    }

    /// Reverse-lookup the model id an agent key was issued to.
    pub fn resolve_model_id(&self, key: &str) -> Option<&str> {
        if self.human_assist_key.as_deref() == Some(key) {
            return Some(HUMAN_MODEL_ID);
        }
        self.agent_keys
            .iter()
            .find(|(_, v)| v.as_str() == key)
            .map(|(k, _)| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_token_shape() {
        let token = mint_token();
        assert_eq!(token.len(), 48);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(mint_token(), mint_token());
    }

    #[test]
    fn test_ensure_agent_key_is_stable() {
        let mut keys = AccessKeys::default();
        let first = keys.ensure_agent_key("gpt-5");
        let second = keys.ensure_agent_key("gpt-5");
        assert_eq!(first, second);
    }

    #[test]
    fn test_authorize_rejects_wrong_key() {
        let mut keys = AccessKeys::default();
        let good = keys.ensure_agent_key("a");
        keys.ensure_agent_key("b");

        assert!(keys.authorize("a", &good).is_ok());
        assert!(keys.authorize("b", &good).is_err());
        assert!(keys.authorize("c", &good).is_err());
    }

    #[test]
    fn test_human_assist_key_rotation_invalidates_old() {
        let mut keys = AccessKeys::default();
        let old = keys.rotate_human_assist_key();
        let new = keys.rotate_human_assist_key();

        assert!(keys.authorize(HUMAN_MODEL_ID, &old).is_err());
        assert!(keys.authorize(HUMAN_MODEL_ID, &new).is_ok());
    }

    #[test]
    fn test_resolve_model_id() {
        let mut keys = AccessKeys::default();
        let key = keys.ensure_agent_key("claude-opus");
        assert_eq!(keys.resolve_model_id(&key), Some("claude-opus"));
        assert_eq!(keys.resolve_model_id("bogus"), None);
    }
}
