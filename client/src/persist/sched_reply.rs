//! Scheduler RPC replies and what they do to the client state.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{ProjectId, Time};
use crate::error::{ClientError, Result};
use crate::state::app::{App, AppVersion};
use crate::state::client_state::{ClientState, ResultOutcome};
use crate::state::file_info::FileInfo;
use crate::state::result::ResultInfo;
use crate::state::workunit::Workunit;

/// A decoded scheduler reply. Entities stay as raw values so that a bad one
/// can be rejected without losing the rest of the reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerReply {
    // seconds to wait before the next RPC
    pub request_delay: f64,
    pub project_name: Option<String>,
    pub user_name: Option<String>,
    pub team_name: Option<String>,
    pub user_total_credit: Option<f64>,
    pub user_expavg_credit: Option<f64>,
    pub host_total_credit: Option<f64>,
    pub host_expavg_credit: Option<f64>,
    pub hostid: Option<u32>,
    pub host_venue: Option<String>,
    pub project_prefs: Option<String>,
    pub code_sign_key: Option<String>,
    pub scheduler_urls: Vec<String>,
    pub apps: Vec<Value>,
    pub file_infos: Vec<Value>,
    pub app_versions: Vec<Value>,
    pub workunits: Vec<Value>,
    pub results: Vec<Value>,
    // names of results the server has received
    pub result_acks: Vec<String>,
    pub messages: Vec<String>,
}

pub fn parse_reply(text: &str) -> Result<SchedulerReply> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, Default)]
pub struct ReplyOutcome {
    pub linked: usize,
    pub acked: usize,
    pub rejected: Vec<ClientError>,
}

impl ReplyOutcome {
    fn record<T>(&mut self, res: Result<T>) -> Option<T> {
        match res {
            Ok(v) => {
                self.linked += 1;
                Some(v)
            }
            Err(e) => {
                warn!("Rejected entity from scheduler reply: {}", e);
                self.rejected.push(e);
                None
            }
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

impl ClientState {
    /// Applies a successful scheduler RPC reply to the project's entities.
    pub fn handle_scheduler_reply(
        &mut self,
        project_id: ProjectId,
        reply: SchedulerReply,
        now: Time,
    ) -> Result<ReplyOutcome> {
        let max_len = self.config.max_text_len;
        let project = self
            .project_mut(project_id)
            .ok_or_else(|| ClientError::ProjectNotFound(project_id.to_string()))?;
        project.record_rpc_success();
        project.sched_rpc_pending = false;
        project.rpc_seqno += 1;
        if reply.request_delay > 0. {
            project.set_min_rpc_time(now + reply.request_delay);
        }

        let mut updated = project.clone();
        if let Some(v) = reply.project_name {
            updated.project_name = v;
        }
        if let Some(v) = reply.user_name {
            updated.user_name = v;
        }
        if let Some(v) = reply.team_name {
            updated.team_name = v;
        }
        if let Some(v) = reply.host_venue {
            updated.host_venue = v;
        }
        if let Some(v) = reply.project_prefs {
            updated.project_prefs = v;
        }
        if let Some(v) = reply.code_sign_key {
            updated.code_sign_key = v;
        }
        if !reply.scheduler_urls.is_empty() {
            updated.scheduler_urls = reply.scheduler_urls;
        }
        updated.user_total_credit = reply.user_total_credit.unwrap_or(updated.user_total_credit);
        updated.user_expavg_credit = reply.user_expavg_credit.unwrap_or(updated.user_expavg_credit);
        updated.host_total_credit = reply.host_total_credit.unwrap_or(updated.host_total_credit);
        updated.host_expavg_credit = reply.host_expavg_credit.unwrap_or(updated.host_expavg_credit);
        updated.hostid = reply.hostid.unwrap_or(updated.hostid);

        let mut outcome = ReplyOutcome::default();
        match updated.validate(max_len) {
            Ok(()) => *project = updated,
            Err(e) => {
                warn!("Ignoring project fields from scheduler reply: {}", e);
                outcome.rejected.push(e);
            }
        }
        let project_name = project.get_project_name().to_string();
        for msg in &reply.messages {
            info!("[{}] {}", project_name, msg);
        }

        for v in reply.apps {
            let res = decode::<App>(v).and_then(|app| self.link_app(project_id, app));
            outcome.record(res);
        }
        for v in reply.file_infos {
            let res = decode::<FileInfo>(v).and_then(|f| self.link_file_info(project_id, f, true));
            outcome.record(res);
        }
        for v in reply.app_versions {
            let res = decode::<AppVersion>(v).and_then(|av| self.link_app_version(project_id, av));
            outcome.record(res);
        }
        for v in reply.workunits {
            let res = decode::<Workunit>(v).and_then(|mut wu| {
                // new work always binds to the newest version
                wu.version_num = 0;
                self.link_workunit(project_id, wu)
            });
            outcome.record(res);
        }
        for v in reply.results {
            let res = decode::<ResultInfo>(v).and_then(|mut r| {
                // the client alone decides a result's progress
                r.state = Default::default();
                r.ready_to_report = false;
                r.got_server_ack = false;
                self.link_result(project_id, r)
            });
            if let Some(result_id) = outcome.record(res) {
                if let Some(r) = self.result(result_id) {
                    info!("[{}] Got new result {}", project_name, r.name);
                }
                self.stats.borrow_mut().n_results_received += 1;
            }
        }

        for name in reply.result_acks {
            let res = self
                .lookup_result(project_id, &name)
                .ok_or(ClientError::ResultNotFound(name))
                .and_then(|id| self.report_result_outcome(id, ResultOutcome::ServerAck));
            match res {
                Ok(()) => outcome.acked += 1,
                Err(e) => {
                    warn!("Bad result ack: {}", e);
                    outcome.rejected.push(e);
                }
            }
        }

        {
            let mut stats = self.stats.borrow_mut();
            stats.n_rpc_succeeded += 1;
            stats.n_entities_rejected += outcome.rejected.len() as u64;
        }
        self.update_results(now);
        Ok(outcome)
    }

    /// Records a failed scheduler RPC and backs the project off.
    pub fn handle_scheduler_failure(&mut self, project_id: ProjectId, now: Time) -> Result<()> {
        let policy = self.config.rpc_backoff;
        let project = self
            .project_mut(project_id)
            .ok_or_else(|| ClientError::ProjectNotFound(project_id.to_string()))?;
        project.record_rpc_failure(now, &policy);
        warn!(
            "{}: scheduler request failed ({} in a row), retry in {:.0}s",
            project.get_project_name(),
            project.nrpc_failures,
            project.min_rpc_time - now
        );
        self.stats.borrow_mut().n_rpc_failures += 1;
        Ok(())
    }
}
