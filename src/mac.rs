// Link-layer address handling

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A client's MAC address, normalised to lower-case colon notation
///
/// Clients are keyed by this value, so "AA-BB-CC-DD-EE-FF" and
/// "aa:bb:cc:dd:ee:ff" refer to the same client.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(String);

impl MacAddr {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let octets: Vec<&str> = s.trim().split(|c: char| c == ':' || c == '-').collect();

        if octets.len() != 6
            || octets
                .iter()
                .any(|o| o.len() != 2 || !o.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(anyhow!("Invalid MAC address: {:?}", s));
        }

        Ok(MacAddr(octets.join(":").to_lowercase()))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
