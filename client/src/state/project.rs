use std::f64::consts::LN_2;

use log::info;
use serde::{Deserialize, Serialize};

use super::text::{check_all, check_text};
use crate::common::{ProjectId, Time};
use crate::config::client_config::BackoffPolicy;
use crate::error::{ClientError, Result};

pub const DEFAULT_RESOURCE_SHARE: f64 = 100.;

// half-life of the exponentially averaged CPU time (s)
const EXP_AVG_HALF_LIFE: f64 = 7. * 86400.;

/// A project the host is attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    #[serde(skip)]
    pub id: ProjectId,

    // account
    pub master_url: String,
    pub authenticator: String,
    pub project_prefs: String,
    pub project_specific_prefs: String,
    pub gui_urls: String,
    pub resource_share: f64,
    pub host_venue: String,

    // reported by the server
    pub scheduler_urls: Vec<String>,
    pub project_name: String,
    pub user_name: String,
    pub team_name: String,
    pub email_hash: String,
    pub cross_project_id: String,
    pub user_total_credit: f64,
    pub user_expavg_credit: f64,
    pub user_create_time: f64,
    pub rpc_seqno: u32,
    pub hostid: u32,
    pub host_total_credit: f64,
    pub host_expavg_credit: f64,
    pub host_create_time: f64,
    pub code_sign_key: String,

    // host-dependent state
    pub exp_avg_cpu: f64,
    pub exp_avg_mod_time: Time,
    pub nrpc_failures: u32,
    pub master_fetch_failures: u32,
    pub min_rpc_time: Time,
    #[serde(skip)]
    pub min_report_min_rpc_time: Time,
    pub master_url_fetch_pending: bool,
    pub sched_rpc_pending: bool,
    pub tentative: bool,
    pub anonymous_platform: bool,
    pub non_cpu_intensive: bool,
    pub send_file_list: bool,
    pub suspended_via_gui: bool,

    // CPU scheduler
    pub debt: f64,
    // work fetch (s)
    #[serde(skip)]
    pub work_request: f64,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            id: 0,
            master_url: String::new(),
            authenticator: String::new(),
            project_prefs: String::new(),
            project_specific_prefs: String::new(),
            gui_urls: String::new(),
            resource_share: DEFAULT_RESOURCE_SHARE,
            host_venue: String::new(),
            scheduler_urls: Vec::new(),
            project_name: String::new(),
            user_name: String::new(),
            team_name: String::new(),
            email_hash: String::new(),
            cross_project_id: String::new(),
            user_total_credit: 0.,
            user_expavg_credit: 0.,
            user_create_time: 0.,
            rpc_seqno: 0,
            hostid: 0,
            host_total_credit: 0.,
            host_expavg_credit: 0.,
            host_create_time: 0.,
            code_sign_key: String::new(),
            exp_avg_cpu: 0.,
            exp_avg_mod_time: 0.,
            nrpc_failures: 0,
            master_fetch_failures: 0,
            min_rpc_time: 0.,
            min_report_min_rpc_time: 0.,
            master_url_fetch_pending: false,
            sched_rpc_pending: false,
            tentative: false,
            anonymous_platform: false,
            non_cpu_intensive: false,
            send_file_list: false,
            suspended_via_gui: false,
            debt: 0.,
            work_request: 0.,
        }
    }
}

impl Project {
    pub fn new(master_url: &str, authenticator: &str) -> Self {
        Self {
            master_url: master_url.to_string(),
            authenticator: authenticator.to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self, max_len: usize) -> Result<()> {
        if self.master_url.is_empty() {
            return Err(ClientError::Parse("project without master URL".to_string()));
        }
        if !(self.resource_share > 0.) {
            return Err(ClientError::Parse(format!(
                "{}: resource share must be positive, got {}",
                self.master_url, self.resource_share
            )));
        }
        check_text("master_url", &self.master_url, max_len)?;
        check_text("authenticator", &self.authenticator, max_len)?;
        check_text("project_name", &self.project_name, max_len)?;
        check_text("host_venue", &self.host_venue, max_len)?;
        check_all(
            "scheduler_url",
            self.scheduler_urls.iter().map(String::as_str),
            max_len,
        )
    }

    pub fn get_project_name(&self) -> &str {
        if self.project_name.is_empty() {
            &self.master_url
        } else {
            &self.project_name
        }
    }

    /// Directory name for the project's files, derived from the master URL.
    pub fn dir_name(&self) -> String {
        let url = self
            .master_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.master_url);
        url.trim_end_matches('/')
            .chars()
            .map(|c| match c {
                '/' | ':' | '\\' | '?' | '*' | '"' | '<' | '>' | '|' => '_',
                c => c,
            })
            .collect()
    }

    /// Copies the host-dependent fields of a project read from the state
    /// file into one read from its account file.
    pub fn copy_state_fields(&mut self, p: &Project) {
        self.scheduler_urls = p.scheduler_urls.clone();
        self.project_name = p.project_name.clone();
        self.user_name = p.user_name.clone();
        self.team_name = p.team_name.clone();
        self.email_hash = p.email_hash.clone();
        self.cross_project_id = p.cross_project_id.clone();
        self.user_total_credit = p.user_total_credit;
        self.user_expavg_credit = p.user_expavg_credit;
        self.user_create_time = p.user_create_time;
        self.rpc_seqno = p.rpc_seqno;
        self.hostid = p.hostid;
        self.host_total_credit = p.host_total_credit;
        self.host_expavg_credit = p.host_expavg_credit;
        self.host_create_time = p.host_create_time;
        self.exp_avg_cpu = p.exp_avg_cpu;
        self.exp_avg_mod_time = p.exp_avg_mod_time;
        self.nrpc_failures = p.nrpc_failures;
        self.master_fetch_failures = p.master_fetch_failures;
        self.min_rpc_time = p.min_rpc_time;
        self.master_url_fetch_pending = p.master_url_fetch_pending;
        self.sched_rpc_pending = p.sched_rpc_pending;
        self.send_file_list = p.send_file_list;
        self.non_cpu_intensive = p.non_cpu_intensive;
        self.suspended_via_gui = p.suspended_via_gui;
        self.code_sign_key = p.code_sign_key.clone();
        self.debt = p.debt;
    }

    pub fn set_min_rpc_time(&mut self, future_time: Time) {
        if future_time > self.min_rpc_time {
            self.min_rpc_time = future_time;
        }
        self.min_report_min_rpc_time = 0.;
    }

    pub fn record_rpc_failure(&mut self, now: Time, policy: &BackoffPolicy) {
        self.nrpc_failures += 1;
        self.min_rpc_time = now + policy.delay(self.nrpc_failures);
        self.min_report_min_rpc_time = 0.;
    }

    pub fn record_rpc_success(&mut self) {
        self.nrpc_failures = 0;
        self.min_rpc_time = 0.;
        self.min_report_min_rpc_time = 0.;
    }

    pub fn may_contact(&self, now: Time) -> bool {
        self.min_rpc_time == 0. || now >= self.min_rpc_time
    }

    /// Same as `!may_contact`, but tells the user about the deferral at most
    /// once per `report_interval`.
    pub fn waiting_until_min_rpc_time(&mut self, now: Time, report_interval: f64) -> bool {
        if self.may_contact(now) {
            return false;
        }
        if now >= self.min_report_min_rpc_time {
            info!(
                "{}: deferring communication for {:.0}s",
                self.get_project_name(),
                self.min_rpc_time - now
            );
            self.min_report_min_rpc_time = now + report_interval;
        }
        true
    }

    pub fn update_exp_avg_cpu(&mut self, cpu_secs: f64, now: Time) {
        if self.exp_avg_mod_time > 0. && now > self.exp_avg_mod_time {
            let diff = now - self.exp_avg_mod_time;
            let weight = (-diff * LN_2 / EXP_AVG_HALF_LIFE).exp();
            self.exp_avg_cpu =
                self.exp_avg_cpu * weight + (1. - weight) * (cpu_secs / (diff / 86400.));
        }
        self.exp_avg_mod_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            min_secs: 60.,
            max_secs: 3600.,
        }
    }

    #[test]
    fn contact_blocked_until_min_rpc_time() {
        let mut p = Project::new("http://p.example/", "auth");
        assert!(p.may_contact(0.));

        p.record_rpc_failure(1000., &policy());
        assert_eq!(p.nrpc_failures, 1);
        assert!(!p.may_contact(1000.));
        assert!(!p.may_contact(1059.));
        assert!(p.may_contact(1060.));

        p.record_rpc_failure(1060., &policy());
        assert_eq!(p.min_rpc_time, 1180.);

        p.record_rpc_success();
        assert_eq!(p.nrpc_failures, 0);
        assert_eq!(p.min_rpc_time, 0.);
        assert!(p.may_contact(1060.));
    }

    #[test]
    fn deferral_message_is_throttled() {
        let mut p = Project::new("http://p.example/", "auth");
        p.record_rpc_failure(0., &policy());
        assert!(p.waiting_until_min_rpc_time(1., 30.));
        assert_eq!(p.min_report_min_rpc_time, 31.);
        assert!(p.waiting_until_min_rpc_time(10., 30.));
        assert_eq!(p.min_report_min_rpc_time, 31.);
        assert!(!p.waiting_until_min_rpc_time(60., 30.));
    }

    #[test]
    fn set_min_rpc_time_never_moves_backwards() {
        let mut p = Project::new("http://p.example/", "auth");
        p.set_min_rpc_time(500.);
        p.set_min_rpc_time(100.);
        assert_eq!(p.min_rpc_time, 500.);
    }

    #[test]
    fn dir_name_strips_scheme_and_slashes() {
        let p = Project::new("http://setiathome.berkeley.edu/sah/", "");
        assert_eq!(p.dir_name(), "setiathome.berkeley.edu_sah");
    }

    #[test]
    fn validate_rejects_bad_share_and_long_url() {
        let mut p = Project::new("http://p.example/", "auth");
        assert!(p.validate(256).is_ok());
        p.resource_share = 0.;
        assert!(p.validate(256).is_err());
        p.resource_share = 1.;
        p.master_url = format!("http://{}", "x".repeat(300));
        assert!(matches!(
            p.validate(256),
            Err(ClientError::TextTooLong { .. })
        ));
    }

    #[test]
    fn copy_state_fields_keeps_account_fields() {
        let mut account = Project::new("http://p.example/", "secret");
        account.resource_share = 50.;
        let mut state = Project::new("http://p.example/", "");
        state.debt = 12.5;
        state.hostid = 7;
        state.resource_share = 1.;
        account.copy_state_fields(&state);
        assert_eq!(account.authenticator, "secret");
        assert_eq!(account.resource_share, 50.);
        assert_eq!(account.debt, 12.5);
        assert_eq!(account.hostid, 7);
    }
}
