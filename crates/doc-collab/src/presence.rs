/// Collaborator presence tracking
/// Shows who is connected, who is editing, and where their cursors are
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::CollaboratorId;

/// Color assigned to a collaborator for cursor/selection highlighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Convert to hex color string
    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Fixed palette collaborators draw their colors from
pub const DEFAULT_PALETTE: [UserColor; 8] = [
    UserColor::new(0xE5, 0x39, 0x35),
    UserColor::new(0x1E, 0x88, 0xE5),
    UserColor::new(0x43, 0xA0, 0x47),
    UserColor::new(0xFB, 0x8C, 0x00),
    UserColor::new(0x8E, 0x24, 0xAA),
    UserColor::new(0x00, 0xAC, 0xC1),
    UserColor::new(0xD8, 0x1B, 0x60),
    UserColor::new(0x6D, 0x4C, 0x41),
];

/// Activity state of a collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Idle,
    Editing,
}

/// Selected character range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

/// Cursor position in the editor viewport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
}

/// Collaborator as announced by the transport (join events, roster snapshots)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorInfo {
    #[serde(alias = "user_id")]
    pub id: CollaboratorId,

    #[serde(alias = "username")]
    pub display_name: String,

    #[serde(default, alias = "avatar")]
    pub avatar_url: Option<String>,

    #[serde(default, alias = "status")]
    pub presence: Option<PresenceState>,

    #[serde(default)]
    pub cursor: Option<Cursor>,
}

impl CollaboratorInfo {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: CollaboratorId::new(id),
            display_name: display_name.into(),
            avatar_url: None,
            presence: None,
            cursor: None,
        }
    }
}

/// A connected collaborator's current state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaborator {
    pub id: CollaboratorId,
    pub display_name: String,
    pub initials: String,
    pub avatar_url: Option<String>,
    pub presence: PresenceState,
    pub cursor: Option<Cursor>,
    pub last_activity_at: chrono::DateTime<chrono::Utc>,
    pub joined_at: chrono::DateTime<chrono::Utc>,
    pub color: UserColor,
}

impl Collaborator {
    fn from_info(info: CollaboratorInfo, color: UserColor, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            initials: initials_of(&info.display_name),
            id: info.id,
            display_name: info.display_name,
            avatar_url: info.avatar_url,
            presence: info.presence.unwrap_or(PresenceState::Online),
            cursor: info.cursor,
            last_activity_at: now,
            joined_at: now,
            color,
        }
    }

    /// Update last activity timestamp
    pub fn touch(&mut self, now: chrono::DateTime<chrono::Utc>) {
        self.last_activity_at = now;
    }

    pub fn is_idle(&self) -> bool {
        self.presence == PresenceState::Idle
    }
}

fn initials_of(name: &str) -> String {
    name.chars().take(2).collect::<String>().to_uppercase()
}

/// Hands out palette colors, keeping each collaborator on the same color
/// for the lifetime of the session where possible
#[derive(Debug, Clone)]
pub struct ColorAllocator {
    palette: Vec<UserColor>,
    holders: Vec<Option<CollaboratorId>>,
    last_used: Vec<u64>,
    remembered: HashMap<CollaboratorId, usize>,
    tick: u64,
}

impl ColorAllocator {
    pub fn new(palette: Vec<UserColor>) -> Self {
        let palette = if palette.is_empty() {
            DEFAULT_PALETTE.to_vec()
        } else {
            palette
        };
        let len = palette.len();

        Self {
            palette,
            holders: vec![None; len],
            last_used: vec![0; len],
            remembered: HashMap::new(),
            tick: 0,
        }
    }

    /// Color for `id`: its previous entry if still free, else the least
    /// recently used free entry, else a random (shared) entry
    pub fn acquire(&mut self, id: &CollaboratorId) -> UserColor {
        self.tick += 1;

        if let Some(&slot) = self.remembered.get(id) {
            match &self.holders[slot] {
                Some(holder) if holder == id => return self.palette[slot],
                None => return self.take(slot, id),
                Some(_) => {}
            }
        }

        let free = (0..self.palette.len())
            .filter(|&slot| self.holders[slot].is_none())
            .min_by_key(|&slot| (self.last_used[slot], slot));

        match free {
            Some(slot) => self.take(slot, id),
            None => {
                let slot = rand::thread_rng().gen_range(0..self.palette.len());
                self.remembered.insert(id.clone(), slot);
                self.palette[slot]
            }
        }
    }

    /// Return the entry held by `id` to the free pool
    pub fn release(&mut self, id: &CollaboratorId) {
        self.tick += 1;

        if let Some(&slot) = self.remembered.get(id) {
            if self.holders[slot].as_ref() == Some(id) {
                self.holders[slot] = None;
                self.last_used[slot] = self.tick;
            }
        }
    }

    fn take(&mut self, slot: usize, id: &CollaboratorId) -> UserColor {
        self.holders[slot] = Some(id.clone());
        self.last_used[slot] = self.tick;
        self.remembered.insert(id.clone(), slot);
        self.palette[slot]
    }
}

impl Default for ColorAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PALETTE.to_vec())
    }
}

/// Roster of collaborators connected to one document
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    collaborators: HashMap<CollaboratorId, Collaborator>,
    colors: ColorAllocator,
    idle_timeout: chrono::Duration,
}

impl PresenceTracker {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            collaborators: HashMap::new(),
            colors: ColorAllocator::default(),
            idle_timeout: chrono::Duration::from_std(idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(crate::DEFAULT_IDLE_TIMEOUT_MS as i64)),
        }
    }

    /// Add a collaborator, or bring an already known one back online
    pub fn join(&mut self, info: CollaboratorInfo, now: chrono::DateTime<chrono::Utc>) -> &Collaborator {
        let id = info.id.clone();

        if let Some(existing) = self.collaborators.get_mut(&id) {
            existing.presence = PresenceState::Online;
            existing.touch(now);
        } else {
            let color = self.colors.acquire(&id);
            tracing::debug!("collaborator {} joined with color {}", id, color.to_hex());
            self.collaborators
                .insert(id.clone(), Collaborator::from_info(info, color, now));
        }

        &self.collaborators[&id]
    }

    /// Remove a collaborator after a leave notification
    pub fn leave(&mut self, id: &CollaboratorId) -> Option<Collaborator> {
        let removed = self.collaborators.remove(id);
        if removed.is_some() {
            self.colors.release(id);
        }
        removed
    }

    /// Mark a collaborator as editing after an operation attributed to them.
    /// Returns false for unknown ids.
    pub fn record_operation(&mut self, id: &CollaboratorId, now: chrono::DateTime<chrono::Utc>) -> bool {
        match self.collaborators.get_mut(id) {
            Some(collaborator) => {
                collaborator.presence = PresenceState::Editing;
                collaborator.touch(now);
                true
            }
            None => {
                tracing::trace!("ignoring activity from unknown collaborator {}", id);
                false
            }
        }
    }

    /// Store a cursor position. Refreshes activity but leaves the state as is.
    pub fn update_cursor(
        &mut self,
        id: &CollaboratorId,
        cursor: Cursor,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        match self.collaborators.get_mut(id) {
            Some(collaborator) => {
                collaborator.cursor = Some(cursor);
                collaborator.touch(now);
                true
            }
            None => {
                tracing::trace!("ignoring cursor from unknown collaborator {}", id);
                false
            }
        }
    }

    /// Replace the whole roster with a server snapshot
    pub fn replace_roster(&mut self, roster: Vec<CollaboratorInfo>, now: chrono::DateTime<chrono::Utc>) {
        for id in self.collaborators.keys() {
            if !roster.iter().any(|info| &info.id == id) {
                self.colors.release(id);
            }
        }

        let mut collaborators = HashMap::with_capacity(roster.len());
        for info in roster {
            let color = self.colors.acquire(&info.id);
            let mut collaborator = Collaborator::from_info(info, color, now);
            if let Some(previous) = self.collaborators.get(&collaborator.id) {
                collaborator.joined_at = previous.joined_at;
            }
            collaborators.insert(collaborator.id.clone(), collaborator);
        }

        self.collaborators = collaborators;
    }

    /// Move editing collaborators with no activity for longer than the idle
    /// timeout to idle. Returns the ids that changed.
    pub fn check_idle(&mut self, now: chrono::DateTime<chrono::Utc>) -> Vec<CollaboratorId> {
        let mut went_idle = Vec::new();

        for collaborator in self.collaborators.values_mut() {
            if collaborator.presence == PresenceState::Editing
                && now - collaborator.last_activity_at > self.idle_timeout
            {
                collaborator.presence = PresenceState::Idle;
                went_idle.push(collaborator.id.clone());
            }
        }

        went_idle
    }

    pub fn get(&self, id: &CollaboratorId) -> Option<&Collaborator> {
        self.collaborators.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &CollaboratorId) -> Option<&mut Collaborator> {
        self.collaborators.get_mut(id)
    }

    /// All collaborators in join order
    pub fn collaborators(&self) -> Vec<&Collaborator> {
        let mut all: Vec<&Collaborator> = self.collaborators.values().collect();
        all.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Collaborators that are not idle
    pub fn active_collaborators(&self) -> Vec<&Collaborator> {
        self.collaborators()
            .into_iter()
            .filter(|c| !c.is_idle())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.collaborators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }

    /// Drop everyone, e.g. on disconnect
    pub fn clear(&mut self) {
        for id in self.collaborators.keys() {
            self.colors.release(id);
        }
        self.collaborators.clear();
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::DEFAULT_IDLE_TIMEOUT_MS))
    }
}

pub(crate) fn lock_tracker(tracker: &Mutex<PresenceTracker>) -> MutexGuard<'_, PresenceTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Periodic idle check bound to a session. The task stops when this value
/// is dropped.
#[derive(Debug)]
pub struct IdleMonitor {
    handle: tokio::task::JoinHandle<()>,
}

impl IdleMonitor {
    /// Spawn the check on the current tokio runtime
    pub fn spawn(tracker: Arc<Mutex<PresenceTracker>>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let went_idle = lock_tracker(&tracker).check_idle(chrono::Utc::now());
                for id in went_idle {
                    tracing::debug!("collaborator {} is now idle", id);
                }
            }
        });

        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Abort the task without waiting for the monitor to go out of scope
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
