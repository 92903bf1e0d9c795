//! Fingerprint rule table
//!
//! Rules are plain data so they can be overridden from the configuration
//! file. Tokens are normalized with [`super::normalize`] before matching.

use serde::{Deserialize, Serialize};

/// Allow-list plus family exclusions
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FingerprintRules {
    /// A port must contain at least one of these tokens
    pub allow: Vec<String>,
    /// Families rejected even when an allow token matches
    #[serde(default)]
    pub exclude: Vec<ExclusionRule>,
}

/// A device family that shares name fragments with allowed hardware
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExclusionRule {
    pub family: String,
    pub tokens: Vec<String>,
}

impl ExclusionRule {
    fn new(family: &str, tokens: &[&str]) -> Self {
        Self {
            family: family.to_string(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl Default for FingerprintRules {
    fn default() -> Self {
        Self {
            allow: [
                "rehab keys",
                "therakeys",
                "digital piano",
                "keystation",
                "launchkey",
                "mpk mini",
                "usb midi",
                "midi keyboard",
                "drum pad",
            ]
            .iter()
            .map(|t| t.to_string())
            .collect(),
            exclude: vec![
                // Grid controllers ship with the same "usb midi" descriptor as
                // the keyboards from the same vendors
                ExclusionRule::new("grid-controller", &["launchpad", "launch control"]),
                ExclusionRule::new("control-surface", &["x-touch", "mackie control"]),
                ExclusionRule::new("loopback", &["midi through", "loopmidi", "iac driver"]),
            ],
        }
    }
}
