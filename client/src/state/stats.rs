#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub n_results_received: u64,
    pub n_results_acked: u64,
    pub n_results_failed: u64,
    pub n_results_aborted: u64,
    pub n_miss_deadline: u64,
    pub cpu_time_total: f64,

    // transfers
    pub n_transfers_completed: u64,
    pub n_url_failovers: u64,
    pub n_mirrors_exhausted: u64,
    pub n_verification_failures: u64,

    // scheduler RPCs
    pub n_rpc_succeeded: u64,
    pub n_rpc_failures: u64,
    pub n_entities_rejected: u64,

    // component's duration
    pub scheduler_sum_dur: f64,
    pub scheduler_samples: u32,
    pub gc_sum_dur: f64,
    pub gc_samples: u32,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn avg_scheduler_dur(&self) -> f64 {
        if self.scheduler_samples == 0 {
            0.
        } else {
            self.scheduler_sum_dur / self.scheduler_samples as f64
        }
    }
}
