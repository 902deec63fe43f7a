//! Domain Unicast Address registry.
//!
//! Tracks, per DUA, the interior ML-EID that owns it, the RLOC16 that
//! last registered it, and whether Duplicate Address Detection is
//! still outstanding. A DUA is only usable on the backbone once DAD
//! has run its course without a collision.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use crate::status::RegStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuaEntry {
    pub dua: Ipv6Addr,
    pub ml_eid: [u8; 8],
    pub rloc16: u16,
    pub registered_at: i64,
    pub dad_in_progress: bool,
    pub pending_delete: bool,
}

/// Outcome of a registration attempt, distinguishing a brand-new entry
/// from a refresh of an existing one so the caller knows whether DAD
/// needs to run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuaRegisterOutcome {
    /// New DUA, DAD must run.
    New,
    /// Same ML-EID re-registering (possibly from a different RLOC16
    /// after a mesh move) — DAD is not repeated.
    Refreshed,
    /// A different ML-EID already holds this DUA.
    Conflict,
}

#[derive(Debug, Default)]
pub struct DuaRegistry {
    by_dua: HashMap<Ipv6Addr, DuaEntry>,
}

impl DuaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dua: &Ipv6Addr) -> Option<&DuaEntry> {
        self.by_dua.get(dua)
    }

    pub fn len(&self) -> usize {
        self.by_dua.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_dua.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DuaEntry> {
        self.by_dua.values()
    }

    /// Register or refresh `dua` for `ml_eid`/`rloc16`. The caller
    /// decides what to do with [`DuaRegisterOutcome::New`] (start DAD)
    /// versus the other outcomes (respond immediately).
    pub fn register(
        &mut self,
        dua: Ipv6Addr,
        ml_eid: [u8; 8],
        rloc16: u16,
        now: i64,
    ) -> DuaRegisterOutcome {
        match self.by_dua.get_mut(&dua) {
            Some(existing) if existing.ml_eid == ml_eid => {
                existing.rloc16 = rloc16;
                existing.registered_at = now;
                existing.pending_delete = false;
                DuaRegisterOutcome::Refreshed
            }
            Some(existing) if existing.dad_in_progress => {
                // A second registrant racing the same DUA while DAD is
                // still outstanding loses to whoever asked first.
                let _ = existing;
                DuaRegisterOutcome::Conflict
            }
            Some(_) => DuaRegisterOutcome::Conflict,
            None => {
                self.by_dua.insert(
                    dua,
                    DuaEntry {
                        dua,
                        ml_eid,
                        rloc16,
                        registered_at: now,
                        dad_in_progress: true,
                        pending_delete: false,
                    },
                );
                DuaRegisterOutcome::New
            }
        }
    }

    /// Mark DAD as resolved for `dua`. `collision = true` removes the
    /// entry so the caller can answer with [`RegStatus::Duplicate`];
    /// otherwise the entry becomes live.
    pub fn resolve_dad(&mut self, dua: &Ipv6Addr, collision: bool) -> RegStatus {
        if collision {
            self.by_dua.remove(dua);
            return RegStatus::Duplicate;
        }
        if let Some(entry) = self.by_dua.get_mut(dua) {
            entry.dad_in_progress = false;
        }
        RegStatus::Success
    }

    /// Flag `dua` for removal once its DAD query window closes, without
    /// removing it immediately. Used when a Backbone Answer reports a
    /// conflicting ML-EID while DAD is still outstanding; the registrant
    /// is told after the remaining queries have had a chance to run.
    pub fn mark_pending_delete(&mut self, dua: &Ipv6Addr) -> bool {
        if let Some(entry) = self.by_dua.get_mut(dua) {
            entry.pending_delete = true;
            true
        } else {
            false
        }
    }

    /// Remove a DUA explicitly (timeout `0` on `/n/dr`, or an interior
    /// device leaving).
    pub fn deregister(&mut self, dua: &Ipv6Addr) -> bool {
        self.by_dua.remove(dua).is_some()
    }

    /// Drop every entry owned by `rloc16`, e.g. when the router id is
    /// reassigned. Returns the DUAs removed so callers can notify peers.
    pub fn evict_rloc(&mut self, rloc16: u16) -> Vec<Ipv6Addr> {
        let dead: Vec<Ipv6Addr> =
            self.by_dua.values().filter(|e| e.rloc16 == rloc16).map(|e| e.dua).collect();
        for dua in &dead {
            self.by_dua.remove(dua);
        }
        dead
    }

    pub fn find_by_ml_eid(&self, ml_eid: &[u8; 8]) -> Option<&DuaEntry> {
        self.by_dua.values().find(|e| &e.ml_eid == ml_eid)
    }
}
