//! Join-token extraction from `kubeadm init` output.

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// kubeadm bootstrap tokens default to a 24h TTL.
pub const TOKEN_TTL_HOURS: i64 = 24;

lazy_static! {
    // kubeadm wraps the command with `\` continuations and tabs.
    static ref JOIN_COMMAND: Regex = Regex::new(
        r"kubeadm\s+join\s+(\S+)[\s\\]+--token\s+(\S+)[\s\\]+--discovery-token-ca-cert-hash\s+(\S+)"
    )
    .unwrap();
    static ref BOOTSTRAP_TOKEN: Regex = Regex::new(r"^[a-z0-9]{6}\.[a-z0-9]{16}$").unwrap();
    static ref CA_CERT_HASH: Regex = Regex::new(r"^sha256:[a-f0-9]{64}$").unwrap();
    static ref ENDPOINT: Regex = Regex::new(r"^[A-Za-z0-9.\-]+:\d{1,5}$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinToken {
    pub endpoint: String,
    pub token: String,
    pub ca_cert_hash: String,
    pub captured_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl JoinToken {
    pub fn new(endpoint: &str, token: &str, ca_cert_hash: &str, captured_at: DateTime<Utc>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            token: token.to_string(),
            ca_cert_hash: ca_cert_hash.to_string(),
            captured_at,
            expires_at: captured_at + Duration::hours(TOKEN_TTL_HOURS),
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Operator-typed tokens end up in a shell script; only kubeadm's own shapes pass.
    pub fn check_format(&self) -> Result<(), String> {
        if !ENDPOINT.is_match(&self.endpoint) {
            return Err(format!("endpoint '{}' is not host:port", self.endpoint));
        }
        if !BOOTSTRAP_TOKEN.is_match(&self.token) {
            return Err("token must look like abcdef.0123456789abcdef".into());
        }
        if !CA_CERT_HASH.is_match(&self.ca_cert_hash) {
            return Err("CA cert hash must be sha256:<64 hex digits>".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenExtraction {
    Found(JoinToken),
    NotFound,
}

/// Scan captured output for the worker join command. Never fails; a miss is `NotFound`.
pub fn extract_join_token(output: &str, captured_at: DateTime<Utc>) -> TokenExtraction {
    // The worker join line is printed last, after the control-plane variant.
    match JOIN_COMMAND.captures_iter(output).last() {
        Some(caps) => TokenExtraction::Found(JoinToken::new(&caps[1], &caps[2], &caps[3], captured_at)),
        None => TokenExtraction::NotFound,
    }
}
