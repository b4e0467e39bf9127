//! Integration tests for file transfers.
//!
//! These tests validate that:
//! - downloads fail over across the download mirrors in order, never touch
//!   an upload mirror, and end by failing every dependent result;
//! - bytes that do not verify are fetched again;
//! - aborting a result cancels only transfers nobody else needs;
//! - past-deadline work is transferred last;
//! - transfer threads hand their events to the control thread.

mod common;

use std::fs;
use std::thread;

use boinc_client::config::client_config::ClientConfig;
use boinc_client::error::ClientError;
use boinc_client::state::client_state::{ClientState, TransferOutcome};
use boinc_client::state::file_info::{md5_file, FileUrl};
use boinc_client::state::result::ResultState;
use boinc_client::transfer::events::TransferEvent;
use boinc_client::transfer::failover::Direction;

#[test]
fn exhausted_mirrors_fail_the_result() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);
    let mut input = common::input_file("in", &["http://m0/in", "http://m1/in", "http://m2/in"]);
    // no explicit direction: recognised as an upload mirror
    input.urls.push(FileUrl {
        url: "http://m3/file_upload_handler".to_string(),
        upload: None,
    });
    let r = common::add_job(&mut state, p, "wu", vec![input], 1e9);
    state.update_results(0.);
    assert_eq!(state.result(r).unwrap().state, ResultState::FilesDownloading);

    let in_id = state.lookup_file(p, "in").unwrap();
    let mut tried = vec![state.start_transfer(in_id, Direction::Download).unwrap()];
    loop {
        match state.on_transfer_complete(in_id, false, -184).unwrap() {
            TransferOutcome::Retry { url } => tried.push(url),
            TransferOutcome::Failed => break,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(tried, vec!["http://m0/in", "http://m1/in", "http://m2/in"]);

    let result = state.result(r).unwrap();
    assert!(result.ready_to_report);
    assert_eq!(result.state, ResultState::FilesDownloading);
    assert_eq!(result.stderr_out.matches("<download_error>").count(), 1);
    assert!(result.stderr_out.contains("<file_name>in</file_name>"));
    assert!(result.stderr_out.ends_with("</stderr_txt>\n"));
    assert_eq!(state.stats.borrow().n_mirrors_exhausted, 1);
    assert_eq!(state.active_transfer_count(), 0);
    // a failed file is not offered again
    assert!(state
        .pending_transfers(Direction::Download, 0.)
        .iter()
        .all(|t| t.file_id != in_id));
}

#[test]
fn second_transfer_of_a_file_is_refused() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);
    let exe = state.lookup_file(p, "exe").unwrap();
    state.start_transfer(exe, Direction::Download).unwrap();
    assert!(matches!(
        state.start_transfer(exe, Direction::Download),
        Err(ClientError::TransferInProgress(_))
    ));
    assert_eq!(state.transfer_url(exe), Some("http://dl/exe"));
}

#[test]
fn bad_checksum_triggers_refetch() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = ClientState::new(common::config_in(dir.path()));
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);
    let mut input = common::input_file("in", &["http://m0/in"]);
    input.md5_cksum = "0".repeat(32);
    input.nbytes = 5.;
    common::add_job(&mut state, p, "wu", vec![input], 1e9);
    let in_id = state.lookup_file(p, "in").unwrap();
    let path = state.file_path(in_id).unwrap();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"hello").unwrap();

    state.start_transfer(in_id, Direction::Download).unwrap();
    assert_eq!(
        state.on_transfer_complete(in_id, true, 0).unwrap(),
        TransferOutcome::Refetch
    );
    let file = state.file_info(in_id).unwrap();
    assert!(!file.is_present());
    assert_eq!(file.had_failure(), None);
    assert!(state
        .pending_transfers(Direction::Download, 0.)
        .iter()
        .any(|t| t.file_id == in_id));
    assert_eq!(state.stats.borrow().n_verification_failures, 1);

    let (md5, _) = md5_file(&path).unwrap();
    state.file_info_mut(in_id).unwrap().md5_cksum = md5;
    state.start_transfer(in_id, Direction::Download).unwrap();
    assert_eq!(
        state.on_transfer_complete(in_id, true, 0).unwrap(),
        TransferOutcome::Completed
    );
    assert!(state.file_info(in_id).unwrap().is_present());
}

#[test]
fn abort_cancels_only_unshared_transfers() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);
    let shared = common::input_file("shared", &["http://dl/shared"]);
    let r1 = common::add_job(
        &mut state,
        p,
        "wu1",
        vec![shared.clone(), common::input_file("own1", &["http://dl/own1"])],
        1e9,
    );
    let r2 = common::add_job(
        &mut state,
        p,
        "wu2",
        vec![shared, common::input_file("own2", &["http://dl/own2"])],
        1e9,
    );
    state.update_results(0.);
    for t in state.pending_transfers(Direction::Download, 0.) {
        state.start_transfer(t.file_id, Direction::Download).unwrap();
    }
    assert_eq!(state.active_transfer_count(), 4);

    let own1 = state.lookup_file(p, "own1").unwrap();
    let cancelled = state.abort_result(r1).unwrap();
    assert_eq!(cancelled, vec![own1]);
    assert_eq!(state.active_transfer_count(), 3);
    let result = state.result(r1).unwrap();
    assert_eq!(result.state, ResultState::Aborted);
    assert!(result.ready_to_report);
    assert_eq!(state.result(r2).unwrap().state, ResultState::FilesDownloading);

    // terminal results cannot be aborted again
    assert!(state.abort_result(r1).is_err());
}

#[test]
fn past_deadline_downloads_go_last() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);
    common::add_job(&mut state, p, "late", vec![common::input_file("a_late", &["http://dl/1"])], 100.);
    common::add_job(&mut state, p, "soon", vec![common::input_file("b_soon", &["http://dl/2"])], 500.);

    let order: Vec<String> = state
        .pending_transfers(Direction::Download, 0.)
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert!(order.iter().position(|n| n == "a_late") < order.iter().position(|n| n == "b_soon"));

    let order: Vec<String> = state
        .pending_transfers(Direction::Download, 200.)
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(order.last().map(String::as_str), Some("a_late"));
}

#[test]
fn events_from_transfer_threads() {
    let mut state = ClientState::new(ClientConfig::default());
    let p = common::attach(&mut state, "http://p/", 100.);
    common::add_app(&mut state, p);
    let exe = state.lookup_file(p, "exe").unwrap();
    state.start_transfer(exe, Direction::Download).unwrap();

    let sender = state.transfer_sender();
    thread::spawn(move || {
        sender
            .send(TransferEvent::Progress {
                file_id: exe,
                bytes: 100.,
            })
            .unwrap();
        sender
            .send(TransferEvent::Complete {
                file_id: exe,
                ok: false,
                error_code: -113,
            })
            .unwrap();
    })
    .join()
    .unwrap();

    assert_eq!(state.process_transfer_events(), 2);
    assert_eq!(state.file_info(exe).unwrap().had_failure(), Some(-113));
    assert_eq!(state.active_transfer_count(), 0);
}
