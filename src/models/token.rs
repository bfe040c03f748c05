use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::models::user::UserId;

pub const TOKEN_PREFIX: &str = "gh_v1_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    Api,
    ReadApi,
    AdminMode,
}

impl TokenScope {
    pub fn parse(s: &str) -> Option<TokenScope> {
        match s {
            "api" => Some(TokenScope::Api),
            "read_api" => Some(TokenScope::ReadApi),
            "admin_mode" => Some(TokenScope::AdminMode),
            _ => None,
        }
    }
}

/// Only the sha256 digest is stored; the raw value is surfaced exactly
/// once, at creation or rotation.
#[derive(Debug, Clone)]
pub struct PersonalAccessToken {
    pub id: u64,
    pub user_id: UserId,
    pub name: String,
    pub scopes: Vec<TokenScope>,
    pub token_digest: String,
    pub revoked: bool,
    pub expires_at: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl PersonalAccessToken {
    pub fn active(&self) -> bool {
        !self.revoked && !self.expired()
    }

    pub fn expired(&self) -> bool {
        match self.expires_at {
            Some(d) => d < Utc::now().date_naive(),
            None => false,
        }
    }

    pub fn matches(&self, raw: &str) -> bool {
        let candidate = digest(raw);
        candidate.as_bytes().ct_eq(self.token_digest.as_bytes()).into()
    }

    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.scopes.contains(&scope)
    }
}

/// Generate a fresh raw token and its storable digest.
pub fn generate() -> (String, String) {
    let raw = format!("{}{}", TOKEN_PREFIX, uuid::Uuid::new_v4().simple());
    let d = digest(&raw);
    (raw, d)
}

pub fn digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}
