//! Master election: Raft-style terms and voting, no log replication.
//!
//! Safety rule: a node acts as master only in a term it won and only until
//! it hears a higher term. Votes are held for the process lifetime; a node
//! grants at most one candidate per term.

use rand::Rng;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Master,
}

/// Outcome of an `AnnounceMaster` receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// Adopted the announced master (possibly cancelling a candidacy).
    Adopted,
    /// This node was master and stepped down to a higher term.
    Demoted,
    /// Stale term; ignored.
    Ignored,
}

#[derive(Debug)]
struct ElectionInner {
    role: Role,
    term: u64,
    /// Vote cast this process lifetime: (term, candidate).
    voted: Option<(u64, String)>,
    known_master: Option<String>,
    last_master_contact: Instant,
}

/// Per-node election state. All transitions go through one lock so vote
/// and term checks are atomic.
pub struct Election {
    inner: Mutex<ElectionInner>,
}

impl Election {
    pub fn new(initial_role: Role, known_master: Option<String>) -> Self {
        Self {
            inner: Mutex::new(ElectionInner {
                role: initial_role,
                term: 0,
                voted: None,
                known_master,
                last_master_contact: Instant::now(),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.lock().unwrap().role
    }

    pub fn term(&self) -> u64 {
        self.inner.lock().unwrap().term
    }

    pub fn known_master(&self) -> Option<String> {
        self.inner.lock().unwrap().known_master.clone()
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Master
    }

    /// Record any successful contact with the current master.
    pub fn note_master_contact(&self) {
        self.inner.lock().unwrap().last_master_contact = Instant::now();
    }

    pub fn master_silent_for(&self) -> Duration {
        self.inner
            .lock()
            .unwrap()
            .last_master_contact
            .elapsed()
    }

    /// Voting rule: grant in term T iff T >= our term and we have not voted
    /// for a different candidate in T. Re-requests from the granted
    /// candidate stay granted. Returns (granted, our current term).
    pub fn handle_request_vote(&self, term: u64, candidate: &str) -> (bool, u64) {
        let mut inner = self.inner.lock().unwrap();
        if term < inner.term {
            return (false, inner.term);
        }
        if term > inner.term {
            // Newer term: whatever we were doing is over.
            inner.term = term;
            if inner.role == Role::Master {
                tracing::info!(term, "stepping down: saw higher-term vote request");
            }
            inner.role = Role::Follower;
        }
        let granted = match &inner.voted {
            Some((voted_term, voted_for)) if *voted_term == term => voted_for == candidate,
            _ => {
                inner.voted = Some((term, candidate.to_string()));
                true
            }
        };
        if granted {
            tracing::debug!(term, candidate, "vote granted");
        }
        (granted, inner.term)
    }

    /// A master announcement. Higher or equal term from someone else wins
    /// unless we are the master of that same term.
    pub fn handle_announce(&self, term: u64, master: &str, self_addr: &str) -> AnnounceOutcome {
        let mut inner = self.inner.lock().unwrap();
        if term < inner.term || (term == inner.term && inner.role == Role::Master) {
            return AnnounceOutcome::Ignored;
        }
        let was_master = inner.role == Role::Master;
        inner.term = term;
        inner.role = Role::Follower;
        inner.known_master = Some(master.to_string());
        inner.last_master_contact = Instant::now();
        if master == self_addr {
            // Our own announcement echoed back.
            inner.role = Role::Master;
            return AnnounceOutcome::Ignored;
        }
        if was_master {
            tracing::info!(term, master, "demoted by higher-term announcement");
            AnnounceOutcome::Demoted
        } else {
            tracing::info!(term, master, "adopted master");
            AnnounceOutcome::Adopted
        }
    }

    /// Enter candidacy: bump term, vote for self. Returns the new term.
    pub fn start_candidacy(&self, self_addr: &str) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.term += 1;
        inner.role = Role::Candidate;
        inner.voted = Some((inner.term, self_addr.to_string()));
        inner.known_master = None;
        tracing::info!(term = inner.term, "starting election");
        inner.term
    }

    /// Adopt a higher term observed in a reply; cancels any candidacy.
    pub fn observe_term(&self, term: u64) {
        let mut inner = self.inner.lock().unwrap();
        if term > inner.term {
            inner.term = term;
            inner.role = Role::Follower;
        }
    }

    /// Claim victory for `term`. Fails when the candidacy was superseded
    /// while votes were in flight.
    pub fn win(&self, term: u64, self_addr: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.role != Role::Candidate || inner.term != term {
            return false;
        }
        inner.role = Role::Master;
        inner.known_master = Some(self_addr.to_string());
        inner.last_master_contact = Instant::now();
        tracing::info!(term, "won election");
        true
    }

    /// Concede the round; stay in the bumped term as follower.
    pub fn concede(&self, term: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.role == Role::Candidate && inner.term == term {
            inner.role = Role::Follower;
        }
    }

    /// Force-master at startup for a node configured as the initial master.
    pub fn assume_master(&self, self_addr: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.role = Role::Master;
        inner.known_master = Some(self_addr.to_string());
    }
}

/// Votes needed to win among `peer_count` known peers (including self).
pub fn quorum(peer_count: usize) -> usize {
    peer_count / 2 + 1
}

/// Randomized election timeout drawn from the configured window.
pub fn election_backoff(window_ms: (u64, u64)) -> Duration {
    let (lo, hi) = window_ms;
    let hi = hi.max(lo + 1);
    Duration::from_millis(rand::thread_rng().gen_range(lo..hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_vote_per_term() {
        let e = Election::new(Role::Follower, None);
        let (granted, _) = e.handle_request_vote(1, "a:1");
        assert!(granted);
        let (granted, _) = e.handle_request_vote(1, "b:1");
        assert!(!granted, "second candidate in the same term is refused");
        let (granted, _) = e.handle_request_vote(1, "a:1");
        assert!(granted, "re-request from the granted candidate stays granted");
    }

    #[test]
    fn stale_term_vote_refused() {
        let e = Election::new(Role::Follower, None);
        e.handle_request_vote(5, "a:1");
        let (granted, term) = e.handle_request_vote(3, "b:1");
        assert!(!granted);
        assert_eq!(term, 5);
    }

    #[test]
    fn higher_term_resets_vote() {
        let e = Election::new(Role::Follower, None);
        assert!(e.handle_request_vote(1, "a:1").0);
        assert!(e.handle_request_vote(2, "b:1").0);
    }

    #[test]
    fn candidacy_votes_for_self() {
        let e = Election::new(Role::Follower, None);
        let term = e.start_candidacy("me:1");
        assert_eq!(term, 1);
        assert_eq!(e.role(), Role::Candidate);
        // Another candidate in the same term is refused: we voted for us.
        assert!(!e.handle_request_vote(term, "other:1").0);
    }

    #[test]
    fn win_requires_live_candidacy() {
        let e = Election::new(Role::Follower, None);
        let term = e.start_candidacy("me:1");
        // A higher term arrives before the victory is claimed.
        e.observe_term(term + 1);
        assert!(!e.win(term, "me:1"));
        assert_eq!(e.role(), Role::Follower);
    }

    #[test]
    fn master_demoted_by_higher_term_announce() {
        let e = Election::new(Role::Follower, None);
        let term = e.start_candidacy("me:1");
        assert!(e.win(term, "me:1"));
        assert_eq!(
            e.handle_announce(term + 1, "other:1", "me:1"),
            AnnounceOutcome::Demoted
        );
        assert_eq!(e.role(), Role::Follower);
        assert_eq!(e.known_master().as_deref(), Some("other:1"));
    }

    #[test]
    fn master_ignores_equal_term_announce() {
        let e = Election::new(Role::Follower, None);
        let term = e.start_candidacy("me:1");
        assert!(e.win(term, "me:1"));
        assert_eq!(
            e.handle_announce(term, "other:1", "me:1"),
            AnnounceOutcome::Ignored
        );
        assert!(e.is_master());
    }

    #[test]
    fn no_two_masters_in_one_term() {
        // Three nodes; two start candidacies in the same term.
        let a = Election::new(Role::Follower, None);
        let b = Election::new(Role::Follower, None);
        let c = Election::new(Role::Follower, None);

        let term_a = a.start_candidacy("a:1");
        let term_b = b.start_candidacy("b:1");
        assert_eq!(term_a, term_b);

        // Voter c can grant at most one of them in this term.
        let c_grants_a = c.handle_request_vote(term_a, "a:1").0;
        let c_grants_b = c.handle_request_vote(term_b, "b:1").0;
        assert!(c_grants_a ^ c_grants_b);

        // a and b refuse each other (self-votes), so only the candidate c
        // granted can reach the 2-of-3 quorum.
        assert!(!a.handle_request_vote(term_b, "b:1").0);
        assert!(!b.handle_request_vote(term_a, "a:1").0);

        let a_votes = 1 + usize::from(c_grants_a);
        let b_votes = 1 + usize::from(c_grants_b);
        let q = quorum(3);
        assert!(!(a_votes >= q && b_votes >= q));
    }

    #[test]
    fn quorum_is_majority() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }

    #[test]
    fn backoff_within_window() {
        for _ in 0..32 {
            let d = election_backoff((1000, 2000));
            assert!(d >= Duration::from_millis(1000) && d < Duration::from_millis(2000));
        }
    }
}
