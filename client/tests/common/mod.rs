//! Builders shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;

use boinc_client::common::{FileId, ProjectId, ResultId, Time};
use boinc_client::config::client_config::ClientConfig;
use boinc_client::state::app::{App, AppVersion};
use boinc_client::state::client_state::ClientState;
use boinc_client::state::file_info::{FileInfo, FileStatus, FileUrl};
use boinc_client::state::file_ref::FileRef;
use boinc_client::state::project::Project;
use boinc_client::state::result::ResultInfo;
use boinc_client::state::workunit::Workunit;

pub fn config_in(dir: &Path) -> ClientConfig {
    ClientConfig {
        data_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

pub fn attach(state: &mut ClientState, url: &str, share: f64) -> ProjectId {
    let mut project = Project::new(url, "auth");
    project.resource_share = share;
    state.add_project(project).unwrap()
}

/// Links app "app" with version 100 whose executable is "exe".
pub fn add_app(state: &mut ClientState, project_id: ProjectId) {
    state.link_app(project_id, App::new("app")).unwrap();
    let mut exe = FileInfo::new("exe");
    exe.executable = true;
    exe.urls = vec![FileUrl::download("http://dl/exe")];
    state.link_file_info(project_id, exe, false).unwrap();
    state
        .link_app_version(project_id, AppVersion::new("app", 100, vec![FileRef::main_program("exe")]))
        .unwrap();
}

pub fn input_file(name: &str, urls: &[&str]) -> FileInfo {
    let mut file = FileInfo::new(name);
    file.urls = urls.iter().map(|u| FileUrl::download(u)).collect();
    file
}

/// Links a work unit `name` reading `inputs` (files linked already or
/// linked here) and one result writing `<name>_out`.
pub fn add_job(
    state: &mut ClientState,
    project_id: ProjectId,
    name: &str,
    inputs: Vec<FileInfo>,
    deadline: Time,
) -> ResultId {
    let mut refs = Vec::new();
    for file in inputs {
        refs.push(FileRef::new(&file.name, &file.name));
        state.link_file_info(project_id, file, true).unwrap();
    }
    let mut out = FileInfo::new(&format!("{}_out", name));
    out.generated_locally = true;
    out.upload_when_present = true;
    out.urls = vec![FileUrl::upload("http://up/file_upload_handler")];
    let out_name = out.name.clone();
    state.link_file_info(project_id, out, false).unwrap();

    let mut wu = Workunit::new(name, "app");
    wu.input_files = refs;
    wu.rsc_fpops_est = 3600e9;
    state.link_workunit(project_id, wu).unwrap();

    let mut result = ResultInfo::new("", name, deadline);
    result.output_files = vec![FileRef::new(&out_name, &out_name)];
    state.link_result(project_id, result).unwrap()
}

pub fn mark_present(state: &mut ClientState, file_id: FileId) {
    state.file_info_mut(file_id).unwrap().status = FileStatus::Present;
}

/// Marks every downloadable file present and moves results to
/// files-downloaded.
pub fn make_runnable(state: &mut ClientState) {
    for file_id in state.file_ids() {
        if !state.file_info(file_id).unwrap().generated_locally {
            mark_present(state, file_id);
        }
    }
    state.update_results(0.);
}
