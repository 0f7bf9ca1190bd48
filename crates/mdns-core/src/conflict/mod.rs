//! Conflict resolution
//!
//! Each unique record runs a small state machine:
//!
//! ```text
//! Pending ──► Probing ──► Announced ──► Withdrawn
//!                │            │
//!                ▼            ▼
//!            Conflict     (re-probe)
//! ```
//!
//! Shared records start directly in `Announced`. The engine calls
//! [`ProbeState::advance`] whenever a record's deadline passes and acts on
//! the returned [`Step`].

pub mod rename;

use crate::record::ResourceRecord;
use crate::wire::WireRecord;
use std::cmp::Ordering;
use std::time::Duration;
use tokio::time::Instant;

pub use rename::{increment_host_label, increment_label_suffix};

/// Lifecycle phase of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting for the initial delay, or for its anchor to verify
    Pending,
    /// Probe queries are being sent
    Probing,
    /// Verified; may still have announcements left to send
    Announced,
    /// Lost a probe; terminal
    Conflict,
    /// Goodbyes sent; terminal
    Withdrawn,
}

/// Probe and announcement timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTiming {
    pub probe_count: u8,
    pub probe_interval: Duration,
    pub announce_count: u8,
    pub announce_interval: Duration,
    pub goodbye_count: u8,
    pub goodbye_interval: Duration,
    pub max_initial_delay: Duration,
    pub max_send_failures: u32,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            probe_count: 3,
            probe_interval: Duration::from_millis(250),
            announce_count: 2,
            announce_interval: Duration::from_secs(1),
            goodbye_count: 2,
            goodbye_interval: Duration::from_millis(250),
            max_initial_delay: Duration::from_millis(250),
            max_send_failures: 5,
        }
    }
}

/// What the engine must do after advancing a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing due
    Idle,
    /// Send a probe query; `first` asks for a unicast response
    Probe { first: bool },
    /// Probing finished without conflict; send the first announcement
    Verified,
    /// Send a further announcement
    Announce,
}

/// Per-record probe state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeState {
    pub phase: Phase,
    pub probes_sent: u8,
    pub announcements_left: u8,
    pub next_at: Option<Instant>,
    pub send_failures: u32,
}

impl ProbeState {
    /// A unique record that starts probing at `start_at`
    pub fn unique(start_at: Instant) -> Self {
        Self {
            phase: Phase::Pending,
            probes_sent: 0,
            announcements_left: 0,
            next_at: Some(start_at),
            send_failures: 0,
        }
    }

    /// A record that waits for another record to verify before announcing
    pub fn awaiting_anchor() -> Self {
        Self {
            phase: Phase::Pending,
            probes_sent: 0,
            announcements_left: 0,
            next_at: None,
            send_failures: 0,
        }
    }

    /// A shared record, announced without probing
    pub fn shared(now: Instant, timing: &ProbeTiming) -> Self {
        let mut state = Self::awaiting_anchor();
        state.start_announcing(now, timing);
        state
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.next_at, Some(at) if at <= now)
    }

    /// Verified records may be announced and defended
    pub fn is_verified(&self) -> bool {
        self.phase == Phase::Announced
    }

    /// Still claiming its name
    pub fn is_probing(&self) -> bool {
        matches!(self.phase, Phase::Pending | Phase::Probing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Conflict | Phase::Withdrawn)
    }

    /// Advance the machine if its deadline has passed
    pub fn advance(&mut self, now: Instant, timing: &ProbeTiming) -> Step {
        if !self.is_due(now) {
            return Step::Idle;
        }

        match self.phase {
            Phase::Pending => {
                self.phase = Phase::Probing;
                self.probes_sent = 1;
                self.next_at = Some(now + timing.probe_interval);
                Step::Probe { first: true }
            }
            Phase::Probing if self.probes_sent < timing.probe_count => {
                self.probes_sent += 1;
                self.next_at = Some(now + timing.probe_interval);
                Step::Probe { first: false }
            }
            Phase::Probing => {
                self.phase = Phase::Announced;
                self.announcements_left = timing.announce_count.saturating_sub(1);
                self.schedule_next_announcement(now, timing);
                Step::Verified
            }
            Phase::Announced if self.announcements_left > 0 => {
                self.announcements_left -= 1;
                self.schedule_next_announcement(now, timing);
                Step::Announce
            }
            Phase::Announced | Phase::Conflict | Phase::Withdrawn => {
                self.next_at = None;
                Step::Idle
            }
        }
    }

    fn schedule_next_announcement(&mut self, now: Instant, timing: &ProbeTiming) {
        self.next_at = if self.announcements_left > 0 {
            Some(now + timing.announce_interval)
        } else {
            None
        };
    }

    /// Queue a full round of announcements starting at `now`
    pub fn start_announcing(&mut self, now: Instant, timing: &ProbeTiming) {
        self.phase = Phase::Announced;
        self.announcements_left = timing.announce_count;
        self.next_at = if timing.announce_count > 0 { Some(now) } else { None };
    }

    /// Go back to probing, e.g. after a conflicting answer or an interface change
    pub fn restart_probing(&mut self, start_at: Instant) {
        self.phase = Phase::Pending;
        self.probes_sent = 0;
        self.announcements_left = 0;
        self.next_at = Some(start_at);
    }

    /// A probe reached no interface; retry it on the next interval
    ///
    /// Returns `true` once the failure budget is exhausted.
    pub fn probe_send_failed(&mut self, now: Instant, timing: &ProbeTiming) -> bool {
        self.send_failures += 1;
        if self.probes_sent > 0 {
            self.probes_sent -= 1;
        }
        if self.probes_sent == 0 {
            self.phase = Phase::Pending;
        }
        self.next_at = Some(now + timing.probe_interval);
        self.send_failures >= timing.max_send_failures
    }

    pub fn send_succeeded(&mut self) {
        self.send_failures = 0;
    }

    /// Stop all activity until probing or announcing is restarted
    pub fn pause(&mut self) {
        if self.phase == Phase::Probing {
            self.phase = Phase::Pending;
            self.probes_sent = 0;
        }
        self.next_at = None;
    }

    pub fn mark_conflict(&mut self) {
        self.phase = Phase::Conflict;
        self.next_at = None;
    }
}

/// Outcome of a simultaneous-probe tie-break
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// Our data is greater; keep probing
    Won,
    /// Their data is greater; we must rename or give up
    Lost,
    /// Both sides propose the same data
    Identical,
}

/// The fields compared by the tie-break, in comparison order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProbeKey<'a> {
    pub rrclass: u16,
    pub rrtype: u16,
    pub rdata: &'a [u8],
}

impl<'a> From<&'a ResourceRecord> for ProbeKey<'a> {
    fn from(rr: &'a ResourceRecord) -> Self {
        Self {
            rrclass: rr.rrclass,
            rrtype: rr.rrtype,
            rdata: &rr.rdata,
        }
    }
}

impl<'a> From<&'a WireRecord> for ProbeKey<'a> {
    fn from(rr: &'a WireRecord) -> Self {
        Self {
            rrclass: rr.rrclass,
            rrtype: rr.rrtype,
            rdata: &rr.rdata,
        }
    }
}

/// Compare our proposed records against theirs (RFC 6762 §8.2)
///
/// Both sets are sorted and compared pairwise. The first difference decides;
/// if one set is a prefix of the other, the longer set wins.
pub fn tie_break<'a, 'b>(
    ours: impl IntoIterator<Item = ProbeKey<'a>>,
    theirs: impl IntoIterator<Item = ProbeKey<'b>>,
) -> TieBreak {
    let mut ours: Vec<ProbeKey<'a>> = ours.into_iter().collect();
    let mut theirs: Vec<ProbeKey<'b>> = theirs.into_iter().collect();
    ours.sort();
    theirs.sort();

    for (a, b) in ours.iter().zip(theirs.iter()) {
        match (a.rrclass, a.rrtype, a.rdata).cmp(&(b.rrclass, b.rrtype, b.rdata)) {
            Ordering::Greater => return TieBreak::Won,
            Ordering::Less => return TieBreak::Lost,
            Ordering::Equal => {}
        }
    }

    match ours.len().cmp(&theirs.len()) {
        Ordering::Greater => TieBreak::Won,
        Ordering::Less => TieBreak::Lost,
        Ordering::Equal => TieBreak::Identical,
    }
}

/// Whether an answer seen on the network contradicts our unique record
///
/// Goodbyes and identical data are never conflicts.
pub fn is_conflicting_answer(ours: &ResourceRecord, answer: &WireRecord) -> bool {
    ours.is_unique()
        && ours.same_rrset(answer)
        && !answer.is_goodbye()
        && answer.rdata != ours.rdata
}
