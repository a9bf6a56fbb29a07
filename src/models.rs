//! Durable entity records and the credential shapes that move between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Active-account limit for standard users.
pub const STANDARD_ACCOUNT_QUOTA: usize = 3;
/// Active-account limit for premium users.
pub const PREMIUM_ACCOUNT_QUOTA: usize = 10;

/// The chat principal. Upserted on first contact, refreshed on later ones,
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Stable numeric identity from the chat platform.
    pub id: i64,
    pub display_name: String,
    pub premium: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// How many active linked accounts this user may hold.
    pub fn account_quota(&self) -> usize {
        if self.premium {
            PREMIUM_ACCOUNT_QUOTA
        } else {
            STANDARD_ACCOUNT_QUOTA
        }
    }
}

/// One linked external account. The session blob is always vault output —
/// plaintext session material never reaches the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub owner_id: i64,
    pub phone: String,
    pub api_id: String,
    pub api_hash: String,
    /// Encrypted session record, `<hex-nonce>:<hex-ciphertext>:<hex-tag>`.
    pub session_blob: String,
    /// Cleared instead of deleting the row.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(
        owner_id: i64,
        phone: String,
        api_id: String,
        api_hash: String,
        session_blob: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            phone,
            api_id,
            api_hash,
            session_blob,
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }
}

/// Record of one successfully created remote group. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub remote_id: i64,
    pub invite_ref: String,
    pub account_id: Uuid,
    pub owner_id: i64,
    pub member_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Credentials in live-connectable form, handed to the automation client.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub api_id: String,
    pub api_hash: String,
    pub phone: String,
    /// Decrypted session string when resuming an already-linked account.
    pub session: Option<String>,
}

impl ClientCredentials {
    /// Parse the onboarding credential line: exactly three whitespace-separated
    /// tokens, the third starting with `+`. Returns `None` on anything else.
    pub fn parse(input: &str) -> Option<Self> {
        let mut tokens = input.split_whitespace();
        let api_id = tokens.next()?;
        let api_hash = tokens.next()?;
        let phone = tokens.next()?;
        if tokens.next().is_some() || !phone.starts_with('+') {
            return None;
        }
        Some(Self {
            api_id: api_id.to_string(),
            api_hash: api_hash.to_string(),
            phone: phone.to_string(),
            session: None,
        })
    }

    /// Rebuild connectable credentials from a stored account and its
    /// decrypted session string.
    pub fn for_account(account: &Account, session: String) -> Self {
        Self {
            api_id: account.api_id.clone(),
            api_hash: account.api_hash.clone(),
            phone: account.phone.clone(),
            session: Some(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(premium: bool) -> User {
        User {
            id: 42,
            display_name: "Alice".into(),
            premium,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn quota_by_tier() {
        assert_eq!(user(false).account_quota(), 3);
        assert_eq!(user(true).account_quota(), 10);
    }

    #[test]
    fn credentials_parse_happy_path() {
        let creds = ClientCredentials::parse("123456 abcdef123456 +1234567890").unwrap();
        assert_eq!(creds.api_id, "123456");
        assert_eq!(creds.api_hash, "abcdef123456");
        assert_eq!(creds.phone, "+1234567890");
        assert!(creds.session.is_none());
    }

    #[test]
    fn credentials_parse_tolerates_extra_whitespace() {
        let creds = ClientCredentials::parse("  123456\tabcdef123456   +44123 ").unwrap();
        assert_eq!(creds.phone, "+44123");
    }

    #[test]
    fn credentials_parse_rejects_malformed() {
        assert!(ClientCredentials::parse("123456 abcdef").is_none());
        assert!(ClientCredentials::parse("123456 abcdef 1234567890").is_none());
        assert!(ClientCredentials::parse("123456 abcdef +123 extra").is_none());
        assert!(ClientCredentials::parse("").is_none());
    }

    #[test]
    fn new_account_is_active_and_unused() {
        let account = Account::new(
            7,
            "+123".into(),
            "id".into(),
            "hash".into(),
            "aa:bb:cc".into(),
        );
        assert!(account.active);
        assert!(account.last_used_at.is_none());
        assert_eq!(account.owner_id, 7);
    }
}
