use crate::csn::Csn;
use crate::error::DecodeError;
use crate::server_state::ServerState;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Vector clocks of several replication domains
///
/// Shared between publish and heartbeat paths, so every operation takes
/// `&self` and runs under the instance lock. Readers that need more than
/// one lookup should work on a [`snapshot`](Self::snapshot).
///
/// The textual form is the changelog cookie:
/// `domain1:<csn><csn>;domain2:<csn>;`
#[derive(Debug, Default)]
pub struct MultiDomainServerState {
    states: Mutex<BTreeMap<String, ServerState>>,
}

impl MultiDomainServerState {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record `csn` for `domain`, returns whether it was newer than the
    /// CSN already known for its replica
    pub fn update(&self, domain: &str, csn: &Csn) -> bool {
        let mut states = self.states.lock();
        match states.get_mut(domain) {
            Some(state) => state.update(csn),
            None => {
                let mut state = ServerState::new();
                state.update(csn);
                states.insert(domain.to_string(), state);
                true
            }
        }
    }

    /// Merge a whole domain state
    pub fn update_state(&self, domain: &str, state: &ServerState) -> bool {
        let mut states = self.states.lock();
        let current = states.entry(domain.to_string()).or_default();
        current.update_state(state)
    }

    /// Overwrite the state of a domain, even with older CSNs
    pub fn replace(&self, domain: &str, state: ServerState) {
        self.states.lock().insert(domain.to_string(), state);
    }

    /// Merge every domain of `other` into this state
    pub fn update_from(&self, other: &MultiDomainServerState) {
        if std::ptr::eq(self, other) {
            return;
        }
        let incoming = other.snapshot();
        let mut states = self.states.lock();
        for (domain, state) in incoming {
            states.entry(domain).or_default().update_state(&state);
        }
    }

    pub fn get_server_state(&self, domain: &str) -> Option<ServerState> {
        self.states.lock().get(domain).cloned()
    }

    pub fn get_csn(&self, domain: &str, server_id: u16) -> Option<Csn> {
        self.states
            .lock()
            .get(domain)
            .and_then(|state| state.csn(server_id).copied())
    }

    /// Remove the CSN recorded for `csn`'s replica in `domain`, only if it
    /// is exactly `csn`
    pub fn remove_csn(&self, domain: &str, csn: &Csn) -> bool {
        let mut states = self.states.lock();
        states
            .get_mut(domain)
            .is_some_and(|state| state.remove_csn(csn))
    }

    /// Forget a domain entirely
    pub fn remove_domain(&self, domain: &str) -> Option<ServerState> {
        self.states.lock().remove(domain)
    }

    pub fn clear(&self) {
        self.states.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }

    pub fn contains_domain(&self, domain: &str) -> bool {
        self.states.lock().contains_key(domain)
    }

    /// Domains currently tracked, in order
    pub fn domains(&self) -> Vec<String> {
        self.states.lock().keys().cloned().collect()
    }

    /// Copy of the current content, taken under the lock
    pub fn snapshot(&self) -> BTreeMap<String, ServerState> {
        self.states.lock().clone()
    }

    /// Oldest (domain, CSN) pair not covered by `excluded`
    ///
    /// A CSN is covered when `excluded` holds, for the same domain and
    /// replica, a CSN that is newer than or equal to it. Ties on the CSN
    /// are resolved by domain order.
    pub fn get_oldest_csn_excluding(
        &self,
        excluded: &MultiDomainServerState,
    ) -> Option<(String, Csn)> {
        let excluded = excluded.snapshot();
        let states = self.snapshot();
        let empty = ServerState::new();

        let mut oldest: Option<(String, Csn)> = None;
        for (domain, state) in &states {
            let excluded_state = excluded.get(domain).unwrap_or(&empty);
            if let Some(csn) = state.oldest_csn_excluding(excluded_state) {
                let is_older = oldest.as_ref().is_none_or(|(_, current)| csn < current);
                if is_older {
                    oldest = Some((domain.clone(), *csn));
                }
            }
        }
        oldest
    }

    /// Encode as a cookie string
    pub fn to_cookie(&self) -> String {
        self.to_string()
    }

    /// Decode a cookie string
    pub fn from_cookie(cookie: &str) -> Result<Self, DecodeError> {
        cookie.parse()
    }
}

impl Clone for MultiDomainServerState {
    fn clone(&self) -> Self {
        Self {
            states: Mutex::new(self.snapshot()),
        }
    }
}

impl PartialEq for MultiDomainServerState {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        // never hold both locks at once
        let mine = self.snapshot();
        let theirs = other.snapshot();
        mine == theirs
    }
}

impl Eq for MultiDomainServerState {}

impl From<BTreeMap<String, ServerState>> for MultiDomainServerState {
    fn from(states: BTreeMap<String, ServerState>) -> Self {
        Self {
            states: Mutex::new(states),
        }
    }
}

impl fmt::Display for MultiDomainServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (domain, state) in self.snapshot() {
            write!(f, "{}:{};", domain, state)?;
        }
        Ok(())
    }
}

impl FromStr for MultiDomainServerState {
    type Err = DecodeError;

    fn from_str(cookie: &str) -> Result<Self, Self::Err> {
        let mut states: BTreeMap<String, ServerState> = BTreeMap::new();
        let mut tokens: Vec<&str> = cookie.split(';').collect();
        // trailing separators carry no domain
        while tokens.last().is_some_and(|t| t.is_empty()) {
            tokens.pop();
        }

        for token in tokens {
            let (domain, csns) = token.split_once(':').unwrap_or((token, ""));
            let state: ServerState = csns.parse().map_err(|e: DecodeError| {
                DecodeError::InvalidCookie {
                    cookie: cookie.to_string(),
                    reason: e.to_string(),
                }
            })?;
            states
                .entry(domain.to_string())
                .or_default()
                .update_state(&state);
        }

        Ok(Self::from(states))
    }
}
