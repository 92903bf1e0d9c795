//! Device authorization
//!
//! Only hardware whose normalized fingerprint matches the allow-list is ever
//! connected. Exclusion rules are checked before the allow-list: several
//! device families share name fragments, and the exclusion decides.

pub mod rules;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

pub use rules::{ExclusionRule, FingerprintRules};

/// Maximum number of rejected ports kept for diagnostics
pub const MAX_REJECTED: usize = 32;

/// Lower-case, strip punctuation, collapse whitespace.
///
/// `"Rehab-Keys  MK2 (USB)"` becomes `"rehabkeys mk2 usb"`.
pub fn normalize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c.to_ascii_lowercase())
            } else if c.is_whitespace() || c == '_' {
                Some(' ')
            } else {
                None
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized form with every separator removed, used for matching.
///
/// `"Mackie-Control"`, `"Mackie Control"` and `"mackie_control"` all become
/// `"mackiecontrol"`.
pub fn compact(raw: &str) -> String {
    normalize(raw).split_whitespace().collect()
}

/// Normalized identity of a port, used only for matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub id: String,
    pub manufacturer: String,
    keys: [String; 3],
}

impl DeviceDescriptor {
    pub fn new(name: &str, id: &str, manufacturer: &str) -> Self {
        Self {
            name: normalize(name),
            id: normalize(id),
            manufacturer: normalize(manufacturer),
            keys: [compact(name), compact(id), compact(manufacturer)],
        }
    }

    /// True if any field contains the token, ignoring case and separators
    pub fn contains(&self, token: &str) -> bool {
        let token = compact(token);
        !token.is_empty() && self.keys.iter().any(|key| key.contains(&token))
    }

    /// Space-joined fingerprint for logs
    pub fn fingerprint(&self) -> String {
        [&self.name, &self.id, &self.manufacturer]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of evaluating a descriptor against the rule table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Authorized { token: String },
    Excluded { family: String, token: String },
    NotAllowed,
}

impl Verdict {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Verdict::Authorized { .. })
    }

    pub fn reason(&self) -> String {
        match self {
            Verdict::Authorized { token } => format!("matched '{}'", token),
            Verdict::Excluded { family, token } => {
                format!("excluded family '{}' ('{}')", family, token)
            }
            Verdict::NotAllowed => "no allow-list token matched".to_string(),
        }
    }
}

/// A port that failed authorization
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedPort {
    pub id: String,
    pub name: String,
    pub reason: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone)]
struct NormalizedExclusion {
    family: String,
    tokens: Vec<String>,
}

/// Allow-list filter with a capped record of rejections
pub struct SecurityFilter {
    allow: Vec<String>,
    exclude: Vec<NormalizedExclusion>,
    rejected: Mutex<VecDeque<RejectedPort>>,
}

impl SecurityFilter {
    pub fn new(rules: &FingerprintRules) -> Self {
        let allow = rules
            .allow
            .iter()
            .map(|t| normalize(t))
            .filter(|t| !t.is_empty())
            .collect();
        let exclude = rules
            .exclude
            .iter()
            .map(|rule| NormalizedExclusion {
                family: rule.family.clone(),
                tokens: rule
                    .tokens
                    .iter()
                    .map(|t| normalize(t))
                    .filter(|t| !t.is_empty())
                    .collect(),
            })
            .collect();

        Self {
            allow,
            exclude,
            rejected: Mutex::new(VecDeque::new()),
        }
    }

    /// Evaluate a descriptor: exclusions first, then the allow-list.
    pub fn evaluate(&self, descriptor: &DeviceDescriptor) -> Verdict {
        for rule in &self.exclude {
            if let Some(token) = rule.tokens.iter().find(|t| descriptor.contains(t)) {
                return Verdict::Excluded {
                    family: rule.family.clone(),
                    token: token.clone(),
                };
            }
        }

        match self.allow.iter().find(|t| descriptor.contains(t)) {
            Some(token) => Verdict::Authorized {
                token: token.clone(),
            },
            None => Verdict::NotAllowed,
        }
    }

    pub fn is_authorized(&self, descriptor: &DeviceDescriptor) -> bool {
        self.evaluate(descriptor).is_authorized()
    }

    /// Record a rejected port, replacing an older record for the same id.
    /// Returns true the first time an id is recorded.
    pub fn record_rejection(&self, id: &str, name: &str, verdict: &Verdict) -> bool {
        let mut rejected = self.rejected.lock();
        let known = rejected.iter().any(|r| r.id == id);
        if !known {
            debug!("Rejected port '{}' ({}): {}", name, id, verdict.reason());
        }
        rejected.retain(|r| r.id != id);
        if rejected.len() >= MAX_REJECTED {
            rejected.pop_front();
        }
        rejected.push_back(RejectedPort {
            id: id.to_string(),
            name: name.to_string(),
            reason: verdict.reason(),
            at_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
        });
        !known
    }

    pub fn rejected(&self) -> Vec<RejectedPort> {
        self.rejected.lock().iter().cloned().collect()
    }
}
