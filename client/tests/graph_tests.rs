//! Integration tests for the entity graph.
//!
//! These tests validate that:
//! - master URLs identify projects uniquely;
//! - reference counts equal the number of live file references and guard
//!   deletion of files, work units and app versions;
//! - oversized text is rejected without touching the graph;
//! - a result whose work unit is gone is tolerated once acknowledged.

mod common;

use boinc_client::config::client_config::ClientConfig;
use boinc_client::error::ClientError;
use boinc_client::state::app::{App, AppVersion};
use boinc_client::state::client_state::{ClientState, ResultOutcome};
use boinc_client::state::file_info::FileInfo;
use boinc_client::state::file_ref::FileRef;
use boinc_client::state::project::Project;
use boinc_client::state::result::ResultInfo;
use boinc_client::state::workunit::Workunit;

#[test]
fn master_url_is_unique() {
    let mut state = ClientState::new(ClientConfig::default());
    let a = common::attach(&mut state, "http://a/", 100.);
    assert!(matches!(
        state.add_project(Project::new("http://a/", "other")),
        Err(ClientError::DuplicateProject(_))
    ));
    let b = common::attach(&mut state, "http://b/", 100.);
    assert_ne!(a, b);
    assert_eq!(state.project_ids(), vec![a, b]);
    assert_eq!(state.lookup_project("http://a/"), Some(a));
}

#[test]
fn file_reference_counts_are_exact() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = ClientState::new(common::config_in(dir.path()));
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);
    let shared = common::input_file("shared", &["http://dl/shared"]);

    let r1 = common::add_job(&mut state, p, "wu1", vec![shared.clone()], 1e9);
    let r2 = common::add_job(&mut state, p, "wu2", vec![shared.clone(), shared], 1e9);

    let shared_id = state.lookup_file(p, "shared").unwrap();
    let exe_id = state.lookup_file(p, "exe").unwrap();
    assert_eq!(state.file_info(shared_id).unwrap().ref_cnt, 3);
    assert_eq!(state.file_info(exe_id).unwrap().ref_cnt, 1);
    let av = state.app_version_ids()[0];
    assert_eq!(state.app_version(av).unwrap().ref_cnt, 2);

    assert!(matches!(
        state.delete_file(shared_id),
        Err(ClientError::StillReferenced { ref_cnt: 3, .. })
    ));
    let wu1 = state.lookup_workunit(p, "wu1").unwrap();
    assert!(matches!(
        state.remove_workunit(wu1),
        Err(ClientError::StillReferenced { ref_cnt: 1, .. })
    ));

    // finish and acknowledge the first result: only its references go away
    state.abort_result(r1).unwrap();
    state.report_result_outcome(r1, ResultOutcome::ServerAck).unwrap();
    let report = state.garbage_collect();
    assert_eq!(report.results_removed, 1);
    assert_eq!(report.workunits_removed, 1);
    assert_eq!(state.file_info(shared_id).unwrap().ref_cnt, 2);
    assert_eq!(state.app_version(av).unwrap().ref_cnt, 1);
    assert!(state.lookup_file(p, "wu1_out").is_none());
    assert!(state.result(r2).is_some());

    state.abort_result(r2).unwrap();
    state.report_result_outcome(r2, ResultOutcome::ServerAck).unwrap();
    state.garbage_collect();
    assert!(state.lookup_file(p, "shared").is_none());
    // still named by the app version
    assert_eq!(state.file_info(exe_id).unwrap().ref_cnt, 1);
}

#[test]
fn sticky_files_are_kept() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    let mut f = FileInfo::new("prefs");
    f.sticky = true;
    let id = state.link_file_info(p, f, false).unwrap();
    assert!(matches!(state.delete_file(id), Err(ClientError::StickyFile(_))));
    state.garbage_collect();
    assert!(state.file_info(id).is_some());
}

#[test]
fn only_superseded_unused_app_versions_are_removed() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    state.link_app(p, App::new("app")).unwrap();
    let old = state.link_app_version(p, AppVersion::new("app", 100, vec![])).unwrap();
    let new = state.link_app_version(p, AppVersion::new("app", 200, vec![])).unwrap();
    let wu = state.link_workunit(p, Workunit::new("wu", "app")).unwrap();

    // work units run the newest version
    assert_eq!(state.workunit(wu).unwrap().avp_id, Some(new));
    assert_eq!(state.workunit(wu).unwrap().version_num, 200);
    assert!(matches!(
        state.remove_app_version(new),
        Err(ClientError::StillReferenced { .. })
    ));
    state.remove_app_version(old).unwrap();

    state.remove_workunit(wu).unwrap();
    assert!(matches!(
        state.remove_app_version(new),
        Err(ClientError::NotSuperseded(_))
    ));
}

#[test]
fn dangling_references_reject_the_entity_only() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);

    let mut wu = Workunit::new("wu", "app");
    wu.input_files = vec![FileRef::new("exe", "exe"), FileRef::new("nowhere", "in")];
    assert!(matches!(
        state.link_workunit(p, wu),
        Err(ClientError::FileNotFound(_))
    ));
    // nothing was counted for the rejected work unit
    let exe = state.lookup_file(p, "exe").unwrap();
    assert_eq!(state.file_info(exe).unwrap().ref_cnt, 1);
    assert!(state.workunit_ids().is_empty());

    assert!(matches!(
        state.link_workunit(p, Workunit::new("wu", "no_such_app")),
        Err(ClientError::AppNotFound(_))
    ));
}

#[test]
fn oversized_text_is_rejected_not_truncated() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    let long = "x".repeat(257);
    assert!(matches!(
        state.link_app(p, App::new(&long)),
        Err(ClientError::TextTooLong { len: 257, max: 256, .. })
    ));
    assert!(state.app_ids().is_empty());
    state.link_app(p, App::new(&"x".repeat(256))).unwrap();
}

#[test]
fn acknowledged_result_survives_without_workunit() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);

    let orphan = ResultInfo::new("gone_0", "gone", 100.);
    assert!(matches!(
        state.link_result(p, orphan.clone()),
        Err(ClientError::WorkunitNotFound(_))
    ));

    let mut acked = orphan;
    acked.got_server_ack = true;
    let r = state.link_result(p, acked).unwrap();
    let result = state.result(r).unwrap();
    assert_eq!(result.workunit_id, None);
    assert!(state.result_input_file_ids(result).is_empty());
    state.update_results(0.);
    assert!(state.all_runnable_results().is_empty());
}

#[test]
fn result_names_derive_from_workunit() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);
    state.link_workunit(p, Workunit::new("wu", "app")).unwrap();
    let a = state.link_result(p, ResultInfo::new("", "wu", 0.)).unwrap();
    let b = state.link_result(p, ResultInfo::new("", "wu", 0.)).unwrap();
    assert_eq!(state.result(a).unwrap().name, "wu_0");
    assert_eq!(state.result(b).unwrap().name, "wu_1");
}

#[test]
fn derived_name_skips_names_in_use_after_gc() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);
    state.link_workunit(p, Workunit::new("wu", "app")).unwrap();
    let a = state.link_result(p, ResultInfo::new("", "wu", 0.)).unwrap();
    state.link_result(p, ResultInfo::new("", "wu", 0.)).unwrap();

    state.abort_result(a).unwrap();
    state.report_result_outcome(a, ResultOutcome::ServerAck).unwrap();
    assert_eq!(state.garbage_collect().results_removed, 1);
    // "wu_1" still holds the work unit
    assert!(state.lookup_workunit(p, "wu").is_some());

    let c = state.link_result(p, ResultInfo::new("", "wu", 0.)).unwrap();
    assert_eq!(state.result(c).unwrap().name, "wu_0");
    let d = state.link_result(p, ResultInfo::new("", "wu", 0.)).unwrap();
    assert_eq!(state.result(d).unwrap().name, "wu_2");
}

#[test]
fn referenced_project_cannot_be_detached() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    let app = state.link_app(p, App::new("app")).unwrap();
    assert!(matches!(
        state.detach_project(p),
        Err(ClientError::StillReferenced { kind: "project", .. })
    ));
    assert!(state.app(app).is_some());

    let q = common::attach(&mut state, "http://q/", 100.);
    state.detach_project(q).unwrap();
    assert!(state.lookup_project("http://q/").is_none());
}
