//! Presence store for cursor and user awareness.
//!
//! A small key/value store replicated outside the document history. Every
//! entry is owned by the peer that last wrote it and carries a per-key
//! logical clock; concurrent writes resolve last-writer-wins on
//! `(clock, owner)`.
//!
//! ## Architecture
//!
//! ```text
//! local selection change
//!       │
//!       ▼
//! PresenceStore::set(peer key, PeerPresence)   (suppressed if unchanged)
//!       │
//!       ▼
//! encode() ──► ephemeral frame ──► remote apply()
//!                                        │
//!                                        ▼
//!                          listeners(PresenceEvent { source: Remote, .. })
//! ```
//!
//! Remote entries that are not refreshed within the timeout are dropped by
//! [`PresenceStore::remove_outdated`]. Local entries never expire.

use crate::cursor::SelectionReference;
use crate::error::{Result, SyncError};
use crate::id::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for remote cursor rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a peer id.
    pub fn from_peer(peer: PeerId) -> Self {
        let hue = ((peer.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb`, alpha dropped.
    pub fn to_hex(&self) -> String {
        let byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", byte(self.r), byte(self.g), byte(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// What a peer publishes about itself under its own key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub name: String,
    pub color: CursorColor,
    pub selection: Option<SelectionReference>,
}

/// Presence key a peer publishes under.
pub fn peer_key(peer: PeerId) -> String {
    peer.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Local,
    Remote,
    Timeout,
}

/// Keys that changed in one store operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub source: ChangeSource,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl PresenceEvent {
    fn new(source: ChangeSource) -> Self {
        Self {
            source,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire format
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEntry {
    key: String,
    owner: PeerId,
    clock: u64,
    /// `None` marks a deletion.
    value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WirePayload {
    entries: Vec<WireEntry>,
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    value: Option<Value>,
    clock: u64,
    owner: PeerId,
    seen: Instant,
}

pub type SubscriptionId = u64;

type Listener = Box<dyn FnMut(&PresenceEvent) + Send>;

pub struct PresenceStore {
    local_peer: PeerId,
    entries: HashMap<String, Entry>,
    timeout: Duration,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: SubscriptionId,
}

impl PresenceStore {
    pub fn new(local_peer: PeerId, timeout: Duration) -> Self {
        Self {
            local_peer,
            entries: HashMap::new(),
            timeout,
            listeners: Vec::new(),
            next_subscription: 1,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    /// Live keys, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| e.value.is_some())
            .map(|(k, _)| k.as_str())
    }

    pub fn owner_of(&self, key: &str) -> Option<PeerId> {
        self.entries
            .get(key)
            .filter(|e| e.value.is_some())
            .map(|e| e.owner)
    }

    pub fn len(&self) -> usize {
        self.keys().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `key` as the local peer. Returns `false` (and notifies nobody)
    /// when the stored value is already equal.
    pub fn set(&mut self, key: &str, value: Value) -> bool {
        let (clock, prior_live) = match self.entries.get(key) {
            Some(e) if e.owner == self.local_peer && e.value.as_ref() == Some(&value) => {
                return false;
            }
            Some(e) => (e.clock + 1, e.value.is_some()),
            None => (1, false),
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Some(value),
                clock,
                owner: self.local_peer,
                seen: Instant::now(),
            },
        );
        let mut event = PresenceEvent::new(ChangeSource::Local);
        if prior_live {
            event.updated.push(key.to_string());
        } else {
            event.added.push(key.to_string());
        }
        self.emit(&event);
        true
    }

    /// Delete `key`. The deletion is replicated like a write.
    pub fn delete(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.value.is_none() {
            return false;
        }
        entry.value = None;
        entry.clock += 1;
        entry.owner = self.local_peer;
        entry.seen = Instant::now();
        let mut event = PresenceEvent::new(ChangeSource::Local);
        event.removed.push(key.to_string());
        self.emit(&event);
        true
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&PresenceEvent) + Send + 'static) -> SubscriptionId {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sub, _)| *sub != id);
        self.listeners.len() != before
    }

    fn emit(&mut self, event: &PresenceEvent) {
        if event.is_empty() {
            return;
        }
        for (_, listener) in self.listeners.iter_mut() {
            listener(event);
        }
    }

    fn encode_where(&self, keep: impl Fn(&Entry) -> bool) -> Result<Vec<u8>> {
        let entries = self
            .entries
            .iter()
            .filter(|(_, e)| keep(e))
            .map(|(key, e)| WireEntry {
                key: key.clone(),
                owner: e.owner,
                clock: e.clock,
                value: e.value.clone(),
            })
            .collect();
        serde_json::to_vec(&WirePayload { entries }).map_err(|e| SyncError::Serialization {
            node: "presence".into(),
            reason: e.to_string(),
        })
    }

    /// Entries written by the local peer, deletions included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let local = self.local_peer;
        self.encode_where(|e| e.owner == local)
    }

    /// Every entry, for answering a peer that just joined.
    pub fn encode_all(&self) -> Result<Vec<u8>> {
        self.encode_where(|_| true)
    }

    pub fn apply(&mut self, bytes: &[u8]) -> Result<PresenceEvent> {
        self.apply_at(bytes, Instant::now())
    }

    /// Merge an encoded payload received at `now`.
    ///
    /// Entries owned by the local peer are ignored. A newer `(clock, owner)`
    /// replaces the stored entry; an identical one only refreshes its
    /// liveness; an older one is dropped.
    pub fn apply_at(&mut self, bytes: &[u8], now: Instant) -> Result<PresenceEvent> {
        let payload: WirePayload = serde_json::from_slice(bytes)
            .map_err(|e| SyncError::MalformedDiff(format!("presence payload: {e}")))?;

        let mut event = PresenceEvent::new(ChangeSource::Remote);
        for wire in payload.entries {
            if wire.owner == self.local_peer {
                continue;
            }
            let prior_live = match self.entries.get_mut(&wire.key) {
                Some(existing) => {
                    let incoming = (wire.clock, wire.owner);
                    let stored = (existing.clock, existing.owner);
                    if incoming == stored {
                        existing.seen = now;
                        continue;
                    }
                    if incoming < stored {
                        log::trace!("stale presence for {} ignored", wire.key);
                        continue;
                    }
                    existing.value.is_some()
                }
                None => false,
            };

            match (&wire.value, prior_live) {
                (Some(_), true) => event.updated.push(wire.key.clone()),
                (Some(_), false) => event.added.push(wire.key.clone()),
                (None, true) => event.removed.push(wire.key.clone()),
                (None, false) => {}
            }
            self.entries.insert(
                wire.key,
                Entry {
                    value: wire.value,
                    clock: wire.clock,
                    owner: wire.owner,
                    seen: now,
                },
            );
        }
        self.emit(&event);
        Ok(event)
    }

    /// Drop remote entries (and any deletion markers) not refreshed within
    /// the timeout. Returns the keys whose values disappeared.
    pub fn remove_outdated(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let local = self.local_peer;
        let mut removed = Vec::new();
        self.entries.retain(|key, e| {
            let expired = now.saturating_duration_since(e.seen) > timeout;
            let keep = match (&e.value, e.owner == local) {
                (Some(_), true) => true,
                (Some(_), false) => !expired,
                (None, _) => !expired,
            };
            if !keep && e.value.is_some() {
                removed.push(key.clone());
            }
            keep
        });
        if !removed.is_empty() {
            log::debug!("presence expired for {} key(s)", removed.len());
            let mut event = PresenceEvent::new(ChangeSource::Timeout);
            event.removed = removed.clone();
            self.emit(&event);
        }
        removed
    }
}

impl std::fmt::Debug for PresenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceStore")
            .field("local_peer", &self.local_peer)
            .field("entries", &self.entries.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

// ===================================================================
// Tests
// ===================================================================
