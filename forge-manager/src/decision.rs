use serde::Serialize;

/// Outcome of one decision step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ForgeDecision {
    pub forge: bool,
    /// The debounced cluster term that went into `forge`.
    pub cluster_eligible: bool,
}

/// `forge = is_leader && cluster_eligible`, with hysteresis on the cluster
/// term only.
///
/// - becoming eligible needs two consecutive eligible reads;
/// - a fresh ineligible read applies immediately;
/// - a missing read (store unavailable) keeps the previous value for one tick,
///   after which the term drops to ineligible.
///
/// The leadership term is never debounced: losing the lease stops forging on
/// the same tick.
#[derive(Debug, Default)]
pub struct ForgeDecisionEngine {
    committed: bool,
    pending: bool,
    missed_reads: u32,
}

impl ForgeDecisionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine for a replica that starts with credentials already installed
    /// (bootstrap). The cluster term starts committed so a fresh eligible read
    /// keeps them in place, but with no missed-read allowance: the first tick
    /// must confirm eligibility or forging stops.
    pub fn bootstrapped() -> Self {
        Self {
            committed: true,
            pending: false,
            missed_reads: 1,
        }
    }

    /// `cluster` is `None` when no fresh eligibility read was possible.
    pub fn decide(&mut self, is_leader: bool, cluster: Option<bool>) -> ForgeDecision {
        match cluster {
            Some(true) => {
                self.missed_reads = 0;
                if !self.committed {
                    if self.pending {
                        self.committed = true;
                        self.pending = false;
                    } else {
                        self.pending = true;
                    }
                }
            }
            Some(false) => {
                self.missed_reads = 0;
                self.committed = false;
                self.pending = false;
            }
            None => {
                self.missed_reads = self.missed_reads.saturating_add(1);
                self.pending = false;
                if self.missed_reads > 1 {
                    self.committed = false;
                }
            }
        }

        ForgeDecision {
            forge: is_leader && self.committed,
            cluster_eligible: self.committed,
        }
    }
}
