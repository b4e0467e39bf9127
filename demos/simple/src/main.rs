use std::fs;
use std::io::Write;

use boinc_client::config::client_config::ClientConfig;
use boinc_client::error::Result;
use boinc_client::persist::sched_reply::{parse_reply, SchedulerReply};
use boinc_client::persist::state_file::write_state;
use boinc_client::persist::visibility::WriteContext;
use boinc_client::state::client_state::{ClientState, ResultOutcome};
use boinc_client::state::project::Project;
use boinc_client::transfer::events::TransferEvent;
use boinc_client::transfer::failover::Direction;
use env_logger::Builder;
use log::{info, warn};

const NRESULTS: usize = 6;
const NPERIODS: usize = 40;

fn init_logger() {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}

// a reply carrying one app and `n` work units with one result each
fn work_reply(prefix: &str, n: usize, fpops: f64) -> String {
    let mut files = vec![format!(
        r#"{{"name": "{p}_app", "executable": true, "urls": [{{"url": "http://{p}/dl/{p}_app"}}]}}"#,
        p = prefix
    )];
    let mut workunits = Vec::new();
    let mut results = Vec::new();
    for i in 0..n {
        files.push(format!(
            r#"{{"name": "{p}_in_{i}", "urls": [{{"url": "http://{p}/dl/{p}_in_{i}"}}]}}"#,
            p = prefix,
            i = i
        ));
        files.push(format!(
            r#"{{"name": "{p}_out_{i}", "generated_locally": true, "upload_when_present": true,
                "urls": [{{"url": "http://{p}/file_upload_handler"}}]}}"#,
            p = prefix,
            i = i
        ));
        workunits.push(format!(
            r#"{{"name": "{p}_wu_{i}", "app_name": "{p}_app", "rsc_fpops_est": {f},
                "input_files": [{{"file_name": "{p}_in_{i}"}}]}}"#,
            p = prefix,
            i = i,
            f = fpops
        ));
        results.push(format!(
            r#"{{"wu_name": "{p}_wu_{i}", "report_deadline": 1e9,
                "output_files": [{{"file_name": "{p}_out_{i}"}}]}}"#,
            p = prefix,
            i = i
        ));
    }
    format!(
        r#"{{"project_name": "{p}", "apps": [{{"name": "{p}_app"}}],
            "file_infos": [{files}],
            "app_versions": [{{"app_name": "{p}_app", "version_num": 100,
                "app_files": [{{"file_name": "{p}_app", "main_program": true}}]}}],
            "workunits": [{wus}], "results": [{results}]}}"#,
        p = prefix,
        files = files.join(","),
        wus = workunits.join(","),
        results = results.join(",")
    )
}

// pretends to be the transfer subsystem: every pending transfer succeeds
fn run_transfers(state: &mut ClientState, now: f64) -> Result<()> {
    for direction in [Direction::Download, Direction::Upload] {
        for pending in state.pending_transfers(direction, now) {
            state.start_transfer(pending.file_id, direction)?;
            if direction == Direction::Download {
                if let Some(path) = state.file_path(pending.file_id) {
                    if let Some(dir) = path.parent() {
                        fs::create_dir_all(dir)?;
                    }
                    fs::write(&path, pending.name.as_bytes())?;
                }
            }
            let event = TransferEvent::Complete {
                file_id: pending.file_id,
                ok: true,
                error_code: 0,
            };
            if state.transfer_sender().send(event).is_err() {
                warn!("transfer inbox closed");
            }
        }
    }
    state.process_transfer_events();
    Ok(())
}

fn finish_result(state: &mut ClientState, result_id: u64, now: f64) -> Result<()> {
    let Some(result) = state.result(result_id) else {
        return Ok(());
    };
    let outputs: Vec<u64> = result.output_file_ids().collect();
    for file_id in outputs {
        if let Some(path) = state.file_path(file_id) {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, b"result")?;
        }
    }
    state.report_result_outcome(
        result_id,
        ResultOutcome::Finished {
            cpu_time: 0.,
            now,
            stderr_txt: String::new(),
        },
    )
}

fn simulation(config: ClientConfig) -> Result<()> {
    let quantum = config.cpu_sched_period;
    let host_flops = config.host_flops;
    let mut state = ClientState::new(config);

    let mut project_ids = Vec::new();
    for (url, share) in [("http://alpha/", 100.), ("http://beta/", 300.)] {
        let mut project = Project::new(url, "demo_auth");
        project.resource_share = share;
        project_ids.push(state.add_project(project)?);
    }
    for (&project_id, prefix) in project_ids.iter().zip(["alpha", "beta"]) {
        let reply = parse_reply(&work_reply(prefix, NRESULTS, 4. * quantum * host_flops))?;
        let outcome = state.handle_scheduler_reply(project_id, reply, 0.)?;
        info!("{}: linked {} entities", prefix, outcome.linked);
    }

    let mut now = 0.;
    for _ in 0..NPERIODS {
        run_transfers(&mut state, now)?;
        state.update_results(now);

        for result_id in state.schedule_cpus(now) {
            state.report_result_outcome(result_id, ResultOutcome::Quantum { cpu_time: quantum, now })?;
            let done = match state.result(result_id) {
                Some(r) => {
                    let est = r
                        .workunit_id
                        .and_then(|id| state.workunit(id))
                        .map(|wu| wu.rsc_fpops_est / host_flops)
                        .unwrap_or(0.);
                    r.final_cpu_time >= est
                }
                None => false,
            };
            if done {
                finish_result(&mut state, result_id, now)?;
            }
        }
        now += quantum;

        run_transfers(&mut state, now)?;
        state.update_results(now);
        state.compute_work_requests();
        for project_id in state.projects_needing_contact(now) {
            let acks: Vec<String> = state
                .result_ids()
                .into_iter()
                .filter_map(|id| state.result(id))
                .filter(|r| r.project_id == project_id && r.ready_to_report && !r.got_server_ack)
                .map(|r| r.name.clone())
                .collect();
            let reply = SchedulerReply {
                result_acks: acks,
                request_delay: quantum,
                ..Default::default()
            };
            if let Err(e) = state.handle_scheduler_reply(project_id, reply, now) {
                warn!("{}", e);
            }
        }
        state.garbage_collect();
    }

    for project_id in project_ids {
        if let Some(p) = state.project(project_id) {
            info!(
                "{}: share {} debt {:.0} exp_avg_cpu {:.0}",
                p.get_project_name(),
                p.resource_share,
                p.debt,
                p.exp_avg_cpu
            );
        }
    }
    let stats = state.stats.borrow().clone();
    info!("{:#?}", stats);
    info!("{}", write_state(&state, WriteContext::Gui)?);
    Ok(())
}

fn main() -> Result<()> {
    init_logger();
    let config = ClientConfig::from_file("config.yaml")?;
    simulation(config)
}
