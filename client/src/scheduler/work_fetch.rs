//! How much work to ask each project for, and which projects to contact.

use log::debug;
use serde::Serialize;

use crate::common::{ProjectId, Time};
use crate::state::client_state::ClientState;
use crate::state::result::{ResultInfo, ResultState};

#[derive(Clone, Serialize, Debug, PartialEq)]
pub struct WorkFetchRequest {
    pub project_id: ProjectId,
    // seconds of work wanted
    pub req_secs: f64,
    // seconds of work already queued for this project
    pub queued_secs: f64,
    // time until a CPU frees up if the queue of every project runs
    pub estimated_delay: f64,
}

impl ClientState {
    // estimated CPU seconds a result still needs
    fn est_remaining_secs(&self, result: &ResultInfo) -> f64 {
        if result.ready_to_report || result.state.is_terminal() {
            return 0.;
        }
        if !matches!(
            result.state,
            ResultState::New
                | ResultState::FilesDownloading
                | ResultState::FilesDownloaded
                | ResultState::Computing
        ) {
            return 0.;
        }
        let fpops = result
            .workunit_id
            .and_then(|id| self.workunits.get(&id))
            .map(|wu| wu.rsc_fpops_est)
            .unwrap_or(0.);
        (fpops / self.config.host_flops - result.final_cpu_time).max(0.)
    }

    pub fn queued_secs(&self, project_id: ProjectId) -> f64 {
        self.results
            .values()
            .filter(|r| r.project_id == project_id)
            .map(|r| self.est_remaining_secs(r))
            .sum()
    }

    /// Sets `work_request` of every project to its share of the work buffer
    /// minus what it already has queued.
    pub fn compute_work_requests(&mut self) -> Vec<WorkFetchRequest> {
        let project_ids = Self::get_map_keys_by_predicate(&self.projects, |p| {
            !p.suspended_via_gui && !p.non_cpu_intensive
        });
        let total_share: f64 = project_ids
            .iter()
            .map(|id| self.projects[id].resource_share)
            .sum();
        let ncpus = self.config.ncpus as f64;
        let total_queued: f64 = project_ids.iter().map(|id| self.queued_secs(*id)).sum();
        let estimated_delay = total_queued / ncpus;

        let mut requests = Vec::new();
        for project_id in project_ids {
            let queued_secs = self.queued_secs(project_id);
            let Some(project) = self.projects.get_mut(&project_id) else {
                continue;
            };
            let share_frac = project.resource_share / total_share;
            let req_secs = (self.config.work_buf_secs * ncpus * share_frac - queued_secs).max(0.);
            project.work_request = req_secs;
            let request = WorkFetchRequest {
                project_id,
                req_secs,
                queued_secs,
                estimated_delay,
            };
            debug!("{}: {:?}", project.get_project_name(), request);
            requests.push(request);
        }
        requests
    }

    fn has_results_to_report(&self, project_id: ProjectId) -> bool {
        self.results
            .values()
            .any(|r| r.project_id == project_id && r.ready_to_report && !r.got_server_ack)
    }

    /// Projects with a reason to get a scheduler RPC now, in master URL
    /// order. Projects inside their backoff window are left out.
    pub fn projects_needing_contact(&mut self, now: Time) -> Vec<ProjectId> {
        let mut candidates: Vec<(String, ProjectId)> = self
            .projects
            .values()
            .filter(|p| !p.suspended_via_gui)
            .filter(|p| {
                p.sched_rpc_pending || p.work_request > 0. || self.has_results_to_report(p.id)
            })
            .map(|p| (p.master_url.clone(), p.id))
            .collect();
        candidates.sort();

        let interval = self.config.min_report_interval;
        let mut res = Vec::new();
        for (_, project_id) in candidates {
            let Some(project) = self.projects.get_mut(&project_id) else {
                continue;
            };
            if project.waiting_until_min_rpc_time(now, interval) {
                continue;
            }
            res.push(project_id);
        }
        res
    }
}
