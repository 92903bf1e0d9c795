//! Device handler profiles and resolution
//!
//! A handler implements device-specific semantics for decoded messages.
//! Handlers are contributed as [`HandlerProfile`]s: a match predicate over
//! the normalized [`DeviceDescriptor`] plus a factory. The registry keeps
//! profiles sorted by descending priority (registration order breaks ties)
//! and resolves a device to the first profile that matches.

pub mod builtin;
pub mod registrar;

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use registrar::HandlerRegistrar;

use crate::error::{Error, Result};
use crate::host::DevicePort;
use crate::midi::Message;
use crate::security::{normalize, DeviceDescriptor};
use crate::services::{InstrumentPlaybackService, NotificationSink};

/// Device-specific message semantics
///
/// `on_message` runs on the host's input thread and must return promptly;
/// long work belongs on a task of the handler's own.
pub trait DeviceHandler: Send + Sync {
    fn on_message(&self, message: &Message);

    /// Playback-mode toggle propagated from the application
    fn set_playback_mode(&self, _enabled: bool) {}

    /// Called once when the device disconnects or the manager is destroyed
    fn teardown(&self) {}
}

/// Handler behaviour settings shared by all instances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerSettings {
    pub note_duration_ms: u64,
    pub playback_enabled: bool,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            note_duration_ms: 500,
            playback_enabled: true,
        }
    }
}

/// Everything a factory receives to build a handler for one port
#[derive(Clone)]
pub struct HandlerContext {
    pub port: DevicePort,
    pub playback: Arc<dyn InstrumentPlaybackService>,
    pub notifier: Arc<dyn NotificationSink>,
    pub settings: HandlerSettings,
}

pub type HandlerFactory =
    Arc<dyn Fn(&HandlerContext) -> Result<Arc<dyn DeviceHandler>> + Send + Sync>;

pub type MatchFn = Arc<dyn Fn(&DeviceDescriptor) -> bool + Send + Sync>;

/// How a profile decides whether it applies to a device
#[derive(Clone)]
pub enum DeviceMatcher {
    Predicate(MatchFn),
    /// Declarative keywords: rejected if any `none` token is present,
    /// otherwise matched if any `any` token is present
    Keywords { any: Vec<String>, none: Vec<String> },
}

impl DeviceMatcher {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&DeviceDescriptor) -> bool + Send + Sync + 'static,
    {
        DeviceMatcher::Predicate(Arc::new(f))
    }

    pub fn always() -> Self {
        Self::predicate(|_| true)
    }

    pub fn keywords(any: &[&str], none: &[&str]) -> Self {
        let norm = |tokens: &[&str]| -> Vec<String> {
            tokens
                .iter()
                .map(|t| normalize(t))
                .filter(|t| !t.is_empty())
                .collect()
        };
        DeviceMatcher::Keywords {
            any: norm(any),
            none: norm(none),
        }
    }

    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        match self {
            DeviceMatcher::Predicate(f) => f(descriptor),
            DeviceMatcher::Keywords { any, none } => {
                // Sibling families first, so shared fragments cannot match
                if none.iter().any(|t| descriptor.contains(t)) {
                    return false;
                }
                any.iter().any(|t| descriptor.contains(t))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            DeviceMatcher::Keywords { any, .. } if any.is_empty() => Err(Error::InvalidProfile(
                "keyword matcher has no usable keywords".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for DeviceMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMatcher::Predicate(_) => f.write_str("Predicate(..)"),
            DeviceMatcher::Keywords { any, none } => f
                .debug_struct("Keywords")
                .field("any", any)
                .field("none", none)
                .finish(),
        }
    }
}

/// Where a profile came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSource {
    BuiltIn,
    External(String),
}

/// Canonical form of a profile id: normalized words joined with '-'
pub fn normalize_id(id: &str) -> String {
    normalize(id).replace(' ', "-")
}

#[derive(Clone)]
pub struct HandlerProfile {
    id: String,
    label: String,
    priority: i32,
    matcher: DeviceMatcher,
    factory: HandlerFactory,
    metadata: BTreeMap<String, Value>,
    source: ProfileSource,
}

impl HandlerProfile {
    pub fn builder(id: impl Into<String>) -> HandlerProfileBuilder {
        HandlerProfileBuilder {
            id: id.into(),
            label: None,
            priority: 0,
            matcher: None,
            factory: None,
            metadata: BTreeMap::new(),
            source: ProfileSource::External("unspecified".to_string()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn source(&self) -> &ProfileSource {
        &self.source
    }

    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        self.matcher.matches(descriptor)
    }

    /// Build a handler; factory errors and panics both become
    /// [`Error::HandlerInstantiation`]
    pub fn instantiate(&self, ctx: &HandlerContext) -> Result<Arc<dyn DeviceHandler>> {
        match catch_unwind(AssertUnwindSafe(|| (self.factory)(ctx))) {
            Ok(Ok(handler)) => Ok(handler),
            Ok(Err(e)) => Err(Error::HandlerInstantiation {
                profile: self.id.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::HandlerInstantiation {
                profile: self.id.clone(),
                reason: "factory panicked".to_string(),
            }),
        }
    }
}

impl fmt::Debug for HandlerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerProfile")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("matcher", &self.matcher)
            .field("source", &self.source)
            .finish()
    }
}

pub struct HandlerProfileBuilder {
    id: String,
    label: Option<String>,
    priority: i32,
    matcher: Option<DeviceMatcher>,
    factory: Option<HandlerFactory>,
    metadata: BTreeMap<String, Value>,
    source: ProfileSource,
}

impl HandlerProfileBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn matcher(mut self, matcher: DeviceMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&HandlerContext) -> Result<Arc<dyn DeviceHandler>> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn shared_factory(mut self, factory: HandlerFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn source(mut self, source: ProfileSource) -> Self {
        self.source = source;
        self
    }

    pub fn build(self) -> Result<HandlerProfile> {
        let id = normalize_id(&self.id);
        if id.is_empty() {
            return Err(Error::InvalidProfile(format!(
                "profile id '{}' is empty after normalization",
                self.id
            )));
        }
        let matcher = self
            .matcher
            .ok_or_else(|| Error::InvalidProfile(format!("profile '{}' has no matcher", id)))?;
        matcher.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| Error::InvalidProfile(format!("profile '{}' has no factory", id)))?;

        Ok(HandlerProfile {
            label: self.label.unwrap_or_else(|| self.id.clone()),
            id,
            priority: self.priority,
            matcher,
            factory,
            metadata: self.metadata,
            source: self.source,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Replace an existing profile with the same id
    pub allow_override: bool,
    /// Do not warn when a duplicate id is ignored
    pub silent_duplicate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Added,
    Replaced,
    DuplicateIgnored,
}

/// Priority-ordered set of handler profiles
#[derive(Default)]
pub struct HandlerRegistry {
    profiles: RwLock<Vec<HandlerProfile>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        profile: HandlerProfile,
        options: RegisterOptions,
    ) -> Result<RegisterOutcome> {
        // Profiles built elsewhere are re-checked at the boundary
        if normalize_id(&profile.id) != profile.id || profile.id.is_empty() {
            return Err(Error::InvalidProfile(format!(
                "profile id '{}' is not normalized",
                profile.id
            )));
        }
        profile.matcher.validate()?;

        let mut profiles = self.profiles.write();
        let outcome = match profiles.iter().position(|p| p.id == profile.id) {
            Some(index) if options.allow_override => {
                info!(
                    "Handler profile '{}' replaced (priority {} -> {})",
                    profile.id, profiles[index].priority, profile.priority
                );
                profiles[index] = profile;
                RegisterOutcome::Replaced
            }
            Some(_) => {
                if options.silent_duplicate {
                    debug!("Duplicate handler profile '{}' ignored", profile.id);
                } else {
                    warn!(
                        "Handler profile '{}' already registered, keeping the existing one",
                        profile.id
                    );
                }
                return Ok(RegisterOutcome::DuplicateIgnored);
            }
            None => {
                debug!(
                    "Handler profile '{}' registered (priority {})",
                    profile.id, profile.priority
                );
                profiles.push(profile);
                RegisterOutcome::Added
            }
        };

        // Stable: equal priorities keep registration order
        profiles.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(outcome)
    }

    pub fn unregister(&self, id: &str) -> bool {
        let id = normalize_id(id);
        let mut profiles = self.profiles.write();
        let before = profiles.len();
        profiles.retain(|p| p.id != id);
        profiles.len() != before
    }

    /// First matching profile in priority order. A panicking predicate
    /// counts as no match.
    pub fn resolve(&self, descriptor: &DeviceDescriptor) -> Option<HandlerProfile> {
        let profiles = self.profiles.read().clone();
        profiles.into_iter().find(|profile| {
            match catch_unwind(AssertUnwindSafe(|| profile.matches(descriptor))) {
                Ok(matched) => matched,
                Err(_) => {
                    warn!("Match predicate of '{}' panicked", profile.id);
                    false
                }
            }
        })
    }

    pub fn get(&self, id: &str) -> Option<HandlerProfile> {
        let id = normalize_id(id);
        self.profiles.read().iter().find(|p| p.id == id).cloned()
    }

    /// Profile ids in resolution order
    pub fn profile_ids(&self) -> Vec<String> {
        self.profiles.read().iter().map(|p| p.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
