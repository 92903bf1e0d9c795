//! Built-in handler profiles
//!
//! `generic-keyboard` catches every authorized keyboard that no more
//! specific profile claims. `drum-pads` wins over it for pad controllers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::{DeviceHandler, DeviceMatcher, HandlerContext, HandlerProfile, ProfileSource};
use crate::error::Result;
use crate::midi::{Message, MessageData, MessageKind};
use crate::services::InstrumentPlaybackService;

pub const KEYBOARD_PROFILE_ID: &str = "generic-keyboard";
pub const PAD_PROFILE_ID: &str = "drum-pads";

/// General MIDI percussion channel (1-based)
const PERCUSSION_CHANNEL: u8 = 10;

/// Plays incoming notes through the playback service
pub struct KeyboardHandler {
    device_id: String,
    playback: Arc<dyn InstrumentPlaybackService>,
    note_duration_ms: u64,
    enabled: AtomicBool,
}

impl KeyboardHandler {
    pub fn new(ctx: &HandlerContext) -> Self {
        Self {
            device_id: ctx.port.id.clone(),
            playback: ctx.playback.clone(),
            note_duration_ms: ctx.settings.note_duration_ms,
            enabled: AtomicBool::new(ctx.settings.playback_enabled),
        }
    }
}

impl DeviceHandler for KeyboardHandler {
    fn on_message(&self, message: &Message) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        match (&message.kind, &message.data) {
            (MessageKind::NoteOn, MessageData::Note { note, velocity, .. }) => {
                self.playback
                    .play_note(*note, self.note_duration_ms, *velocity);
            }
            (MessageKind::ProgramChange, MessageData::ProgramChange { program }) => {
                debug!("[{}] program change -> {}", self.device_id, program);
                self.playback.load_instrument(&format!("program:{}", program));
            }
            _ => trace!("[{}] ignoring {}", self.device_id, message.kind),
        }
    }

    fn set_playback_mode(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn teardown(&self) {
        debug!("[{}] keyboard handler released", self.device_id);
    }
}

/// Percussion pads: hits are short, and the kit is loaded on first use
pub struct PadHandler {
    device_id: String,
    playback: Arc<dyn InstrumentPlaybackService>,
    hit_duration_ms: u64,
    enabled: AtomicBool,
    kit_loaded: Mutex<bool>,
}

impl PadHandler {
    /// Pad hits never ring longer than this
    const MAX_HIT_MS: u64 = 250;

    pub fn new(ctx: &HandlerContext) -> Self {
        Self {
            device_id: ctx.port.id.clone(),
            playback: ctx.playback.clone(),
            hit_duration_ms: ctx.settings.note_duration_ms.min(Self::MAX_HIT_MS),
            enabled: AtomicBool::new(ctx.settings.playback_enabled),
            kit_loaded: Mutex::new(false),
        }
    }

    fn ensure_kit(&self, channel: Option<u8>) {
        let mut loaded = self.kit_loaded.lock();
        if !*loaded {
            let kit = if channel == Some(PERCUSSION_CHANNEL) {
                "percussion:gm"
            } else {
                "percussion:pads"
            };
            self.playback.load_instrument(kit);
            *loaded = true;
        }
    }
}

impl DeviceHandler for PadHandler {
    fn on_message(&self, message: &Message) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if let (MessageKind::NoteOn, MessageData::Note { note, velocity, .. }) =
            (&message.kind, &message.data)
        {
            self.ensure_kit(message.channel);
            self.playback.play_note(*note, self.hit_duration_ms, *velocity);
        }
    }

    fn set_playback_mode(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn teardown(&self) {
        *self.kit_loaded.lock() = false;
        debug!("[{}] pad handler released", self.device_id);
    }
}

/// Profiles registered by the access manager at construction
pub fn builtin_profiles() -> Result<Vec<HandlerProfile>> {
    let keyboard = HandlerProfile::builder(KEYBOARD_PROFILE_ID)
        .label("Keyboard")
        .priority(0)
        .matcher(DeviceMatcher::keywords(
            &["keys", "keyboard", "piano", "keystation", "launchkey", "mpk", "usb midi"],
            &["pad", "drum"],
        ))
        .factory(|ctx| Ok(Arc::new(KeyboardHandler::new(ctx)) as Arc<dyn DeviceHandler>))
        .source(ProfileSource::BuiltIn)
        .build()?;

    let pads = HandlerProfile::builder(PAD_PROFILE_ID)
        .label("Drum pads")
        .priority(20)
        .matcher(DeviceMatcher::keywords(&["pad", "drum"], &[]))
        .factory(|ctx| Ok(Arc::new(PadHandler::new(ctx)) as Arc<dyn DeviceHandler>))
        .metadata("percussion", serde_json::Value::Bool(true))
        .source(ProfileSource::BuiltIn)
        .build()?;

    Ok(vec![keyboard, pads])
}
