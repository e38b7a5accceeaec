use crate::csn::Csn;
use crate::server_state::ServerState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Source of wall clock milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
struct GeneratorState {
    last_timestamp: u64,
    last_seqnum: u32,
}

/// Issues CSNs for one replica
///
/// Successive CSNs are strictly increasing even when the wall clock stalls
/// or goes backwards, and `adjust` keeps them ahead of every CSN observed
/// from other replicas (hybrid logical clock).
pub struct CsnGenerator {
    server_id: u16,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl CsnGenerator {
    pub fn new(server_id: u16, clock: Arc<dyn Clock>) -> Self {
        Self {
            server_id,
            clock,
            state: Mutex::new(GeneratorState {
                last_timestamp: 0,
                last_seqnum: 0,
            }),
        }
    }

    /// Create a generator that will never issue a CSN older than the
    /// CSNs recorded in `state`
    pub fn from_state(server_id: u16, state: &ServerState, clock: Arc<dyn Clock>) -> Self {
        let generator = Self::new(server_id, clock);
        for csn in state.iter() {
            generator.adjust(csn);
        }
        generator
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    pub fn new_csn(&self) -> Csn {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if now > state.last_timestamp {
            state.last_timestamp = now;
            state.last_seqnum = 0;
        } else if state.last_seqnum == u32::MAX {
            // seqnum exhausted for this millisecond, borrow the next one
            state.last_timestamp += 1;
            state.last_seqnum = 0;
        } else {
            state.last_seqnum += 1;
        }

        Csn::new(state.last_timestamp, self.server_id, state.last_seqnum)
    }

    /// Make sure the next issued CSN is newer than `csn`
    pub fn adjust(&self, csn: &Csn) {
        let mut state = self.state.lock();
        let last = Csn::new(state.last_timestamp, self.server_id, state.last_seqnum);
        if !csn.is_newer_than(&last) {
            return;
        }

        if csn.server_id() <= self.server_id {
            // same millisecond: (time, us, seqnum + 1) already sorts after csn
            state.last_timestamp = csn.time();
            state.last_seqnum = csn.seqnum();
        } else {
            // a higher server id wins every tie on time, move past it
            state.last_timestamp = csn.time().saturating_add(1);
            state.last_seqnum = 0;
        }

        trace!(
            "CSN generator {} adjusted to {} after observing {}",
            self.server_id,
            Csn::new(state.last_timestamp, self.server_id, state.last_seqnum),
            csn
        );
    }
}

impl std::fmt::Debug for CsnGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("CsnGenerator")
            .field("server_id", &self.server_id)
            .field("last_timestamp", &state.last_timestamp)
            .field("last_seqnum", &state.last_seqnum)
            .finish()
    }
}
