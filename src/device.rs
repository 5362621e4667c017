use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::limits::MAX_DEVICE_ID_LEN;

/// Opaque identifier of the physical device a booking was made from.
/// Secondary uniqueness key next to the member id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Accept an externally derived id. Must be non-empty after trimming.
    pub fn parse(raw: &str) -> Result<Self, DeviceError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DeviceError::Missing);
        }
        if trimmed.len() > MAX_DEVICE_ID_LEN {
            return Err(DeviceError::TooLong(trimmed.len()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ambient request signals a fingerprint is derived from.
#[derive(Debug, Clone, Default)]
pub struct DeviceSignals {
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub accept_language: Option<String>,
    pub accept_encoding: Option<String>,
    pub client_addr: Option<IpAddr>,
}

impl DeviceSignals {
    /// Hex SHA-256 over the normalized signals. Stable for the same device
    /// regardless of which member is logged in.
    pub fn fingerprint(&self) -> Result<DeviceId, DeviceError> {
        let addr = self.client_addr.map(|a| a.to_string());
        let parts = [
            normalize(self.user_agent.as_deref()),
            normalize(self.accept.as_deref()),
            normalize(self.accept_language.as_deref()),
            normalize(self.accept_encoding.as_deref()),
            normalize(addr.as_deref()),
        ];
        if parts.iter().all(String::is_empty) {
            return Err(DeviceError::Missing);
        }

        let mut hasher = Sha256::new();
        for part in &parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        Ok(DeviceId(format!("{:x}", hasher.finalize())))
    }
}

fn normalize(signal: Option<&str>) -> String {
    signal.map(|s| s.trim().to_lowercase()).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("device signal missing")]
    Missing,
    #[error("device id too long ({0} bytes)")]
    TooLong(usize),
}
