//! Garbage collection of finished entities.
//!
//! Files follow `FileDeletionPolicy`: with `Eager` every unreferenced,
//! non-sticky file without an active transfer is deleted as soon as the last
//! entity naming it is gone; with `Retain` files stay until
//! `ClientState::delete_file` is called for them.

use std::time::Instant;

use log::{debug, info, warn};

use super::client_state::ClientState;
use crate::config::client_config::FileDeletionPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub results_removed: usize,
    pub workunits_removed: usize,
    pub app_versions_removed: usize,
    pub files_deleted: usize,
}

impl ClientState {
    pub fn garbage_collect(&mut self) -> GcReport {
        let t = Instant::now();
        info!("garbage collection started");
        let mut report = GcReport::default();

        // results the server acknowledged
        let results_to_remove = Self::get_map_keys_by_predicate(&self.results, |r| {
            r.got_server_ack && r.ready_to_report
        });
        for result_id in results_to_remove {
            match self.remove_result(result_id) {
                Ok(_) => report.results_removed += 1,
                Err(e) => warn!("{}", e),
            }
        }

        let workunits_to_remove = Self::get_map_keys_by_predicate(&self.workunits, |wu| wu.ref_cnt == 0);
        for wu_id in workunits_to_remove {
            if self.remove_workunit(wu_id).is_ok() {
                report.workunits_removed += 1;
            }
        }

        let versions_to_remove = Self::get_map_keys_by_predicate(&self.app_versions, |av| av.ref_cnt == 0);
        for av_id in versions_to_remove {
            if !self.is_superseded(av_id) {
                continue;
            }
            if self.remove_app_version(av_id).is_ok() {
                report.app_versions_removed += 1;
            }
        }

        if self.config.file_deletion == FileDeletionPolicy::Eager {
            let files_to_delete = Self::get_map_keys_by_predicate(&self.file_infos, |f| {
                f.ref_cnt == 0 && !f.sticky
            });
            for file_id in files_to_delete {
                if self.transfers.is_active(file_id) {
                    continue;
                }
                match self.delete_file(file_id) {
                    Ok(()) => report.files_deleted += 1,
                    Err(e) => warn!("{}", e),
                }
            }
        }

        debug!("{:?}", report);
        info!("garbage collection finished");
        let duration = t.elapsed().as_secs_f64();
        self.stats.borrow_mut().gc_sum_dur += duration;
        self.stats.borrow_mut().gc_samples += 1;
        report
    }
}
