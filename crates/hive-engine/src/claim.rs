//! Claim ledger: per-caller reservations of dispatcher resources.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::GenError;

/// One of the three counters a claim tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// Outstanding waits for a worker.
    Waits,
    /// In-flight generations currently holding a worker.
    Live,
    /// Still-pending sub-generations (a batch may fan out, redirects re-arm).
    Gens,
}

/// A caller's reservation of dispatcher resources. Owned by exactly one
/// session; complete only when all three counters are back to zero.
pub struct Claim {
    waits: AtomicU64,
    live: AtomicU64,
    gens: AtomicU64,
    cancel: CancellationToken,
    session_closed: Arc<AtomicBool>,
}

impl Claim {
    fn new(cancel: CancellationToken, session_closed: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            waits: AtomicU64::new(0),
            live: AtomicU64::new(0),
            gens: AtomicU64::new(0),
            cancel,
            session_closed,
        })
    }

    /// A detached claim for callers without a session ledger.
    pub fn standalone(shutdown: &CancellationToken) -> Arc<Self> {
        Self::new(shutdown.child_token(), Arc::new(AtomicBool::new(false)))
    }

    fn counter(&self, kind: ClaimKind) -> &AtomicU64 {
        match kind {
            ClaimKind::Waits => &self.waits,
            ClaimKind::Live => &self.live,
            ClaimKind::Gens => &self.gens,
        }
    }

    /// Reserve `n` more of `kind`. Forbidden once cancelled.
    pub fn extend(&self, kind: ClaimKind, n: u64) -> Result<(), GenError> {
        if self.should_cancel() {
            return Err(GenError::Cancelled);
        }
        self.counter(kind).fetch_add(n, Ordering::AcqRel);
        Ok(())
    }

    /// Release `n` of `kind`. Must not underflow; a mismatch is a pipeline
    /// bug and is clamped after logging.
    pub fn complete(&self, kind: ClaimKind, n: u64) {
        let counter = self.counter(kind);
        let res = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            cur.checked_sub(n)
        });
        if res.is_err() {
            tracing::error!(?kind, n, "claim counter underflow; clamping to zero");
            counter.store(0, Ordering::Release);
        }
    }

    pub fn count(&self, kind: ClaimKind) -> u64 {
        self.counter(kind).load(Ordering::Acquire)
    }

    /// True once every counter is back to zero.
    pub fn is_settled(&self) -> bool {
        self.count(ClaimKind::Waits) == 0
            && self.count(ClaimKind::Live) == 0
            && self.count(ClaimKind::Gens) == 0
    }

    /// Abort any suspended wait or driver stream held under this claim.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The token is set, or the owning session has been torn down.
    pub fn should_cancel(&self) -> bool {
        self.cancel.is_cancelled() || self.session_closed.load(Ordering::Acquire)
    }

    /// Resolves when the cancel token fires. Session teardown cancels the
    /// token too, so this covers both.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Per-caller bag of outstanding claims. Tearing the session down cancels
/// every claim it still holds.
pub struct SessionLedger {
    closed: Arc<AtomicBool>,
    claims: Mutex<Vec<Weak<Claim>>>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            claims: Mutex::new(Vec::new()),
        }
    }

    /// Open a claim under this session. Its cancel token is a child of the
    /// global shutdown signal, so process shutdown cancels it as well.
    pub fn new_claim(&self, shutdown: &CancellationToken) -> Arc<Claim> {
        let claim = Claim::new(shutdown.child_token(), self.closed.clone());
        let mut claims = self.claims.lock().expect("ledger poisoned");
        claims.retain(|c| c.strong_count() > 0);
        claims.push(Arc::downgrade(&claim));
        claim
    }

    /// Tear the session down: all outstanding claims observe cancellation.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let claims = self.claims.lock().expect("ledger poisoned");
        for claim in claims.iter().filter_map(Weak::upgrade) {
            claim.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Claims still alive and not yet settled.
    pub fn outstanding(&self) -> usize {
        self.claims
            .lock()
            .expect("ledger poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_settled())
            .count()
    }
}

impl Default for SessionLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::{Claim, ClaimKind, SessionLedger};

    #[test]
    fn counters_balance_and_settle() {
        let shutdown = CancellationToken::new();
        let claim = Claim::standalone(&shutdown);

        claim.extend(ClaimKind::Waits, 1).unwrap();
        claim.extend(ClaimKind::Gens, 2).unwrap();
        assert!(!claim.is_settled());

        claim.complete(ClaimKind::Waits, 1);
        claim.complete(ClaimKind::Gens, 2);
        assert!(claim.is_settled());
    }

    #[test]
    fn underflow_is_clamped() {
        let shutdown = CancellationToken::new();
        let claim = Claim::standalone(&shutdown);
        claim.extend(ClaimKind::Live, 1).unwrap();
        claim.complete(ClaimKind::Live, 3);
        assert_eq!(claim.count(ClaimKind::Live), 0);
    }

    #[test]
    fn extend_after_cancel_is_refused() {
        let shutdown = CancellationToken::new();
        let claim = Claim::standalone(&shutdown);
        claim.cancel();
        assert!(claim.extend(ClaimKind::Waits, 1).is_err());
        // Completes still land so the ledger can balance.
        claim.complete(ClaimKind::Waits, 0);
    }

    #[test]
    fn global_shutdown_cancels_claims() {
        let shutdown = CancellationToken::new();
        let claim = Claim::standalone(&shutdown);
        assert!(!claim.should_cancel());
        shutdown.cancel();
        assert!(claim.should_cancel());
    }

    #[test]
    fn session_close_cancels_outstanding_claims() {
        let shutdown = CancellationToken::new();
        let ledger = SessionLedger::new();
        let a = ledger.new_claim(&shutdown);
        let b = ledger.new_claim(&shutdown);
        a.extend(ClaimKind::Gens, 1).unwrap();

        ledger.close();
        assert!(a.should_cancel());
        assert!(b.should_cancel());
        assert!(a.extend(ClaimKind::Live, 1).is_err());
    }
}
