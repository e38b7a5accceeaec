use crate::csn::{CSN_STRING_LEN, Csn};
use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Vector clock of one replication domain
///
/// Holds, per server id, the newest CSN originated by that replica that
/// has been incorporated. Entries only move forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    csns: BTreeMap<u16, Csn>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            csns: BTreeMap::new(),
        }
    }

    /// Get the CSN recorded for a replica
    pub fn csn(&self, server_id: u16) -> Option<&Csn> {
        self.csns.get(&server_id)
    }

    /// Record `csn` if it is newer than what is known for its replica
    ///
    /// Returns whether the state changed.
    pub fn update(&mut self, csn: &Csn) -> bool {
        match self.csns.get(&csn.server_id()) {
            Some(current) if !csn.is_newer_than(current) => false,
            _ => {
                self.csns.insert(csn.server_id(), *csn);
                true
            }
        }
    }

    /// Merge another state (take the newest CSN of each replica)
    pub fn update_state(&mut self, other: &ServerState) -> bool {
        let mut changed = false;
        for csn in other.iter() {
            changed |= self.update(csn);
        }
        changed
    }

    /// Remove the entry of `csn`'s replica, only if it is exactly `csn`
    pub fn remove_csn(&mut self, csn: &Csn) -> bool {
        if self.csns.get(&csn.server_id()) == Some(csn) {
            self.csns.remove(&csn.server_id());
            true
        } else {
            false
        }
    }

    /// Whether `csn` has already been incorporated
    pub fn cover(&self, csn: &Csn) -> bool {
        self.csns
            .get(&csn.server_id())
            .is_some_and(|current| current.is_newer_than_or_equal_to(csn))
    }

    pub fn server_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.csns.keys().copied()
    }

    /// CSNs in server id order
    pub fn iter(&self) -> impl Iterator<Item = &Csn> + '_ {
        self.csns.values()
    }

    pub fn len(&self) -> usize {
        self.csns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    pub fn clear(&mut self) {
        self.csns.clear();
    }

    pub fn newest_csn(&self) -> Option<&Csn> {
        self.csns.values().max()
    }

    /// Oldest CSN whose replica is not covered by `excluded`
    ///
    /// A replica is covered when `excluded` holds a CSN for it that is
    /// newer than or equal to the one recorded here.
    pub fn oldest_csn_excluding(&self, excluded: &ServerState) -> Option<&Csn> {
        self.csns
            .values()
            .filter(|csn| !excluded.cover(csn))
            .min()
    }
}

impl fmt::Display for ServerState {
    /// Concatenated fixed-width CSNs, e.g. "00000000000000010001000000000000000000000002000200000000"
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for csn in self.csns.values() {
            write!(f, "{}", csn)?;
        }
        Ok(())
    }
}

impl FromStr for ServerState {
    type Err = DecodeError;

    /// Parse concatenated CSNs; a single space or comma between them is tolerated
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut state = ServerState::new();
        let mut rest = s;
        while !rest.is_empty() {
            rest = rest.trim_start_matches([' ', ',']);
            if rest.is_empty() {
                break;
            }
            if rest.len() < CSN_STRING_LEN || !rest.is_char_boundary(CSN_STRING_LEN) {
                return Err(DecodeError::InvalidCsnLength(rest.len()));
            }
            let (head, tail) = rest.split_at(CSN_STRING_LEN);
            state.update(&head.parse()?);
            rest = tail;
        }
        Ok(state)
    }
}

impl<'a> IntoIterator for &'a ServerState {
    type Item = &'a Csn;
    type IntoIter = std::collections::btree_map::Values<'a, u16, Csn>;

    fn into_iter(self) -> Self::IntoIter {
        self.csns.values()
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<I: IntoIterator<Item = Csn>>(iter: I) -> Self {
        let mut state = ServerState::new();
        for csn in iter {
            state.update(&csn);
        }
        state
    }
}
