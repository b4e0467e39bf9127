//! Reading and writing the client state document.
//!
//! The document holds one block per project with its apps, files, app
//! versions, work units and results in dependency order. Ids, links and
//! reference counts are not written; parsing re-links the graph and so
//! rebuilds them.

use std::io::{Read, Write};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::visibility::{to_value, EntityKind, WriteContext};
use crate::common::ProjectId;
use crate::config::client_config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::state::app::{App, AppVersion};
use crate::state::client_state::ClientState;
use crate::state::file_info::FileInfo;
use crate::state::project::Project;
use crate::state::result::ResultInfo;
use crate::state::workunit::Workunit;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ProjectBlock {
    project: Value,
    apps: Vec<Value>,
    file_infos: Vec<Value>,
    app_versions: Vec<Value>,
    workunits: Vec<Value>,
    results: Vec<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StateDocument {
    projects: Vec<ProjectBlock>,
}

fn project_block(state: &ClientState, project_id: ProjectId, ctx: WriteContext) -> Result<ProjectBlock> {
    let project = state
        .project(project_id)
        .ok_or_else(|| ClientError::ProjectNotFound(project_id.to_string()))?;
    let mut block = ProjectBlock {
        project: to_value(EntityKind::Project, project, ctx)?,
        ..Default::default()
    };
    for id in state.app_ids() {
        if let Some(app) = state.app(id).filter(|a| a.project_id == project_id) {
            block.apps.push(to_value(EntityKind::App, app, ctx)?);
        }
    }
    for id in state.file_ids() {
        if let Some(file) = state.file_info(id).filter(|f| f.project_id == project_id) {
            block.file_infos.push(to_value(EntityKind::FileInfo, file, ctx)?);
        }
    }
    for id in state.app_version_ids() {
        if let Some(av) = state.app_version(id).filter(|av| av.project_id == project_id) {
            block.app_versions.push(to_value(EntityKind::AppVersion, av, ctx)?);
        }
    }
    for id in state.workunit_ids() {
        if let Some(wu) = state.workunit(id).filter(|wu| wu.project_id == project_id) {
            block.workunits.push(to_value(EntityKind::Workunit, wu, ctx)?);
        }
    }
    for id in state.result_ids() {
        if let Some(r) = state.result(id).filter(|r| r.project_id == project_id) {
            block.results.push(to_value(EntityKind::Result, r, ctx)?);
        }
    }
    Ok(block)
}

pub fn write_state_to<W: Write>(state: &ClientState, sink: W, ctx: WriteContext) -> Result<()> {
    let mut doc = StateDocument::default();
    for project_id in state.project_ids() {
        doc.projects.push(project_block(state, project_id, ctx)?);
    }
    serde_json::to_writer_pretty(sink, &doc)?;
    Ok(())
}

pub fn write_state(state: &ClientState, ctx: WriteContext) -> Result<String> {
    let mut buf = Vec::new();
    write_state_to(state, &mut buf, ctx)?;
    String::from_utf8(buf).map_err(|e| ClientError::Parse(e.to_string()))
}

// parses and links every entity of one list, collecting what was rejected
fn link_all<T, F>(
    state: &mut ClientState,
    values: Vec<Value>,
    rejected: &mut Vec<ClientError>,
    mut link: F,
) where
    T: for<'de> Deserialize<'de>,
    F: FnMut(&mut ClientState, T) -> Result<u64>,
{
    for value in values {
        let res = serde_json::from_value::<T>(value)
            .map_err(ClientError::from)
            .and_then(|entity| link(state, entity));
        if let Err(e) = res {
            warn!("Rejected entity: {}", e);
            state.stats.borrow_mut().n_entities_rejected += 1;
            rejected.push(e);
        }
    }
}

/// Rebuilds the client state from a document. A malformed document is an
/// error; a malformed or dangling entity is skipped and returned alongside
/// the state.
pub fn parse_state_from<R: Read>(
    source: R,
    config: ClientConfig,
) -> Result<(ClientState, Vec<ClientError>)> {
    let doc: StateDocument = serde_json::from_reader(source)?;
    let mut state = ClientState::new(config);
    let mut rejected = Vec::new();

    for block in doc.projects {
        let project_id = match serde_json::from_value::<Project>(block.project)
            .map_err(ClientError::from)
            .and_then(|p| state.add_project(p))
        {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejected project and its entities: {}", e);
                state.stats.borrow_mut().n_entities_rejected += 1;
                rejected.push(e);
                continue;
            }
        };
        link_all(&mut state, block.apps, &mut rejected, |s, app: App| {
            s.link_app(project_id, app)
        });
        link_all(&mut state, block.file_infos, &mut rejected, |s, f: FileInfo| {
            s.link_file_info(project_id, f, false)
        });
        link_all(&mut state, block.app_versions, &mut rejected, |s, av: AppVersion| {
            s.link_app_version(project_id, av)
        });
        link_all(&mut state, block.workunits, &mut rejected, |s, wu: Workunit| {
            s.link_workunit(project_id, wu)
        });
        link_all(&mut state, block.results, &mut rejected, |s, r: ResultInfo| {
            s.link_result(project_id, r)
        });
    }
    info!(
        "Loaded state: {} projects, {} results, {} rejected entities",
        state.project_ids().len(),
        state.result_ids().len(),
        rejected.len()
    );
    Ok((state, rejected))
}

pub fn parse_state(text: &str, config: ClientConfig) -> Result<(ClientState, Vec<ClientError>)> {
    parse_state_from(text.as_bytes(), config)
}
