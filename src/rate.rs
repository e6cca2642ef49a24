// Bandwidth rate values as understood by tc

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Units accepted by tc for rate parameters (see tc(8), "RATES")
const RATE_UNITS: &[&str] = &[
    "", "bit", "kbit", "mbit", "gbit", "tbit", "kibit", "mibit", "gibit", "tibit", "bps", "kbps",
    "mbps", "gbps", "tbps", "kibps", "mibps", "gibps", "tibps",
];

/// A validated tc rate string such as "5mbit" or "750kbit"
///
/// Stored in normalised (lower case, trimmed) form so that two requests
/// naming the same rate compare equal and no kernel work is repeated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate(String);

impl Rate {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Rate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let rate = s.trim().to_lowercase();

        // Split "12.5mbit" into "12.5" and "mbit"
        let split = rate
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rate.len());
        let (num_str, unit) = rate.split_at(split);

        if num_str.is_empty() {
            return Err(anyhow!("Invalid rate: {:?}", s));
        }

        let number: f64 = num_str
            .parse()
            .map_err(|_| anyhow!("Invalid rate number: {:?}", num_str))?;

        if !(number > 0.0 && number.is_finite()) {
            return Err(anyhow!("Rate must be positive: {:?}", s));
        }

        if !RATE_UNITS.contains(&unit) {
            return Err(anyhow!("Unknown rate unit {:?} in {:?}", unit, s));
        }

        Ok(Rate(rate))
    }
}

impl TryFrom<String> for Rate {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Rate> for String {
    fn from(rate: Rate) -> Self {
        rate.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Desired limits for one client (or one default profile)
///
/// `None` means the direction is not shaped at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rates {
    #[serde(default, alias = "rate_egress", skip_serializing_if = "Option::is_none")]
    pub egress: Option<Rate>,
    #[serde(default, alias = "rate_ingress", skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Rate>,
}

impl Rates {
    pub fn new(egress: Option<Rate>, ingress: Option<Rate>) -> Self {
        Self { egress, ingress }
    }

    pub fn is_empty(&self) -> bool {
        self.egress.is_none() && self.ingress.is_none()
    }

    /// Fill unset directions from `fallback`
    pub fn or(self, fallback: &Rates) -> Rates {
        Rates {
            egress: self.egress.or_else(|| fallback.egress.clone()),
            ingress: self.ingress.or_else(|| fallback.ingress.clone()),
        }
    }
}

impl fmt::Display for Rates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |r: &Option<Rate>| r.as_ref().map_or("-", Rate::as_str).to_string();
        write!(
            f,
            "egress={} ingress={}",
            show(&self.egress),
            show(&self.ingress)
        )
    }
}
