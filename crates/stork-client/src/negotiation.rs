use std::time::{Duration, Instant};

use stork_shared::NegotiationSignal;
use tracing::debug;

/// Which side of the offer/answer exchange this end plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Open,
    Closed,
}

/// What the orchestrator should do with an inbound negotiation signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationAction {
    /// Hand the signal to the direct channel.
    Apply,
    /// Drop the signal.
    Ignore(&'static str),
    /// Drop this attempt and answer the remote's offer as a new responder.
    Restart,
}

/// Offer/answer bookkeeping for one direct-channel attempt.
#[derive(Debug)]
pub struct NegotiationSession {
    role: Role,
    state: NegotiationState,
    local_candidates: usize,
    remote_candidates: usize,
    started_at: Instant,
}

impl NegotiationSession {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            local_candidates: 0,
            remote_candidates: 0,
            started_at: Instant::now(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record a signal produced by the local channel before it is relayed.
    pub fn on_local_signal(&mut self, signal: &NegotiationSignal) {
        match signal {
            NegotiationSignal::Offer { .. } => self.state = NegotiationState::OfferSent,
            NegotiationSignal::Answer { .. } => self.state = NegotiationState::AnswerSent,
            NegotiationSignal::Candidate { .. } => self.local_candidates += 1,
        }
    }

    /// Decide what to do with a signal from the remote end.
    ///
    /// When both ends initiated at once (glare), the end with the lower
    /// identity restarts as the responder; `local_wins` tells the session
    /// whether this end has the higher identity.
    pub fn on_remote_signal(
        &mut self,
        signal: &NegotiationSignal,
        local_wins: bool,
    ) -> NegotiationAction {
        if self.state == NegotiationState::Closed {
            return NegotiationAction::Ignore("negotiation closed");
        }

        match signal {
            NegotiationSignal::Offer { .. } => match (self.role, self.state) {
                (Role::Responder, NegotiationState::Idle) => {
                    self.state = NegotiationState::OfferReceived;
                    debug!("Received offer");
                    NegotiationAction::Apply
                }
                // A fresh offer on a settled or open attempt means the remote
                // started over.
                (Role::Responder, _) | (Role::Initiator, NegotiationState::Open) => {
                    NegotiationAction::Restart
                }
                (Role::Initiator, _) if local_wins => {
                    NegotiationAction::Ignore("offer collision, remote will yield")
                }
                (Role::Initiator, _) => NegotiationAction::Restart,
            },
            NegotiationSignal::Answer { .. } => {
                if self.role == Role::Responder {
                    return NegotiationAction::Ignore("answer received by responder");
                }
                if self.state != NegotiationState::OfferSent {
                    return NegotiationAction::Ignore("answer without outstanding offer");
                }
                self.state = NegotiationState::AnswerReceived;
                debug!("Received answer");
                NegotiationAction::Apply
            }
            NegotiationSignal::Candidate { .. } => {
                self.remote_candidates += 1;
                NegotiationAction::Apply
            }
        }
    }

    pub fn on_open(&mut self) {
        debug!(
            role = ?self.role,
            local_candidates = self.local_candidates,
            remote_candidates = self.remote_candidates,
            elapsed_ms = self.elapsed().as_millis() as u64,
            "Direct channel negotiated"
        );
        self.state = NegotiationState::Open;
    }

    pub fn close(&mut self) {
        self.state = NegotiationState::Closed;
    }
}
