//! The client's entity graph.
//!
//! Entities live in id-keyed maps; cross references are ids resolved through
//! those maps, so a missing target is an ordinary `None`. Reference counts of
//! files, app versions and work units change only in the link/unlink hooks
//! below.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, info, warn};
use rand::Rng;
use rand_pcg::Pcg64;
use rustc_hash::FxHashMap;
use sugars::{rc, refcell};

use super::app::{App, AppVersion};
use super::file_info::FileInfo;
use super::file_ref::FileRef;
use super::project::Project;
use super::result::{ErrorReport, FileError, ResultInfo, ResultState};
use super::stats::ClientStats;
use super::text::check_text;
use super::workunit::Workunit;
use crate::common::{
    AppId, AppVersionId, FileId, FloatWrapper, ProjectId, ResultId, Time, WorkunitId,
};
use crate::config::client_config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::scheduler::cpu_sched::{CpuScheduler, PeriodState, SchedProject, SchedResult};
use crate::transfer::events::{TransferEvent, TransferInbox, TransferSender};
use crate::transfer::failover::{Direction, FailoverStep, TransferTable};

// error code given to output files that are missing or invalid after computing
pub const ERR_OUTPUT_FILE: i32 = -161;

/// What the execution host reports about a result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultOutcome {
    // a scheduling quantum ended and the result keeps running
    Quantum {
        cpu_time: f64,
        now: Time,
    },
    Finished {
        cpu_time: f64,
        now: Time,
        stderr_txt: String,
    },
    Failed {
        cpu_time: f64,
        now: Time,
        message: String,
        exit_status: i32,
        signal: i32,
        stderr_txt: String,
    },
    CouldntStart {
        message: String,
        error_code: i32,
        stderr_txt: String,
    },
    ServerAck,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransfer {
    pub file_id: FileId,
    pub name: String,
    pub url: String,
}

/// Result of feeding a transfer completion into the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Completed,
    // bytes arrived but did not verify; the file is pending again
    Refetch,
    Retry { url: String },
    Failed,
}

enum ResultStep {
    Advance(ResultState),
    DownloadFailed,
    UploadFailed,
}

pub struct ClientState {
    pub config: ClientConfig,
    pub(crate) projects: FxHashMap<ProjectId, Project>,
    pub(crate) apps: FxHashMap<AppId, App>,
    pub(crate) app_versions: FxHashMap<AppVersionId, AppVersion>,
    pub(crate) workunits: FxHashMap<WorkunitId, Workunit>,
    pub(crate) results: FxHashMap<ResultId, ResultInfo>,
    pub(crate) file_infos: FxHashMap<FileId, FileInfo>,
    pub(crate) transfers: TransferTable,
    pub(crate) cpu_sched: CpuScheduler,
    inbox: TransferInbox,
    rand: Pcg64,
    next_id: u64,
    pub stats: Rc<RefCell<ClientStats>>,
}

impl ClientState {
    pub fn new(config: ClientConfig) -> Self {
        let stats = rc!(refcell!(ClientStats::new()));
        let cpu_sched = CpuScheduler::new(config.ncpus, config.cpu_sched_period, stats.clone());
        Self {
            rand: config.rng(),
            config,
            projects: FxHashMap::default(),
            apps: FxHashMap::default(),
            app_versions: FxHashMap::default(),
            workunits: FxHashMap::default(),
            results: FxHashMap::default(),
            file_infos: FxHashMap::default(),
            transfers: TransferTable::new(),
            cpu_sched,
            inbox: TransferInbox::new(),
            next_id: 1,
            stats,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn get_map_keys_by_predicate<K: Clone + Ord, V, F>(
        hm: &FxHashMap<K, V>,
        predicate: F,
    ) -> Vec<K>
    where
        F: Fn(&V) -> bool,
    {
        let mut res = hm
            .iter()
            .filter(|(_, v)| predicate(*v))
            .map(|(k, _)| (*k).clone())
            .collect::<Vec<_>>();
        res.sort();
        res
    }

    // lookups

    pub fn project(&self, id: ProjectId) -> Option<&Project> {
        self.projects.get(&id)
    }

    pub fn project_mut(&mut self, id: ProjectId) -> Option<&mut Project> {
        self.projects.get_mut(&id)
    }

    pub fn app(&self, id: AppId) -> Option<&App> {
        self.apps.get(&id)
    }

    pub fn app_version(&self, id: AppVersionId) -> Option<&AppVersion> {
        self.app_versions.get(&id)
    }

    pub fn workunit(&self, id: WorkunitId) -> Option<&Workunit> {
        self.workunits.get(&id)
    }

    pub fn result(&self, id: ResultId) -> Option<&ResultInfo> {
        self.results.get(&id)
    }

    pub fn file_info(&self, id: FileId) -> Option<&FileInfo> {
        self.file_infos.get(&id)
    }

    pub fn file_info_mut(&mut self, id: FileId) -> Option<&mut FileInfo> {
        self.file_infos.get_mut(&id)
    }

    pub fn project_ids(&self) -> Vec<ProjectId> {
        Self::get_map_keys_by_predicate(&self.projects, |_| true)
    }

    pub fn app_ids(&self) -> Vec<AppId> {
        Self::get_map_keys_by_predicate(&self.apps, |_| true)
    }

    pub fn app_version_ids(&self) -> Vec<AppVersionId> {
        Self::get_map_keys_by_predicate(&self.app_versions, |_| true)
    }

    pub fn workunit_ids(&self) -> Vec<WorkunitId> {
        Self::get_map_keys_by_predicate(&self.workunits, |_| true)
    }

    pub fn result_ids(&self) -> Vec<ResultId> {
        Self::get_map_keys_by_predicate(&self.results, |_| true)
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        Self::get_map_keys_by_predicate(&self.file_infos, |_| true)
    }

    pub fn lookup_project(&self, master_url: &str) -> Option<ProjectId> {
        self.projects
            .values()
            .find(|p| p.master_url == master_url)
            .map(|p| p.id)
    }

    pub fn lookup_app(&self, project_id: ProjectId, name: &str) -> Option<AppId> {
        self.apps
            .values()
            .find(|a| a.project_id == project_id && a.name == name)
            .map(|a| a.id)
    }

    pub fn lookup_app_version(&self, app_id: AppId, version_num: u32) -> Option<AppVersionId> {
        self.app_versions
            .values()
            .find(|av| av.app_id == app_id && av.version_num == version_num)
            .map(|av| av.id)
    }

    pub fn newest_app_version(&self, app_id: AppId) -> Option<AppVersionId> {
        self.app_versions
            .values()
            .filter(|av| av.app_id == app_id)
            .max_by_key(|av| av.version_num)
            .map(|av| av.id)
    }

    pub fn lookup_workunit(&self, project_id: ProjectId, name: &str) -> Option<WorkunitId> {
        self.workunits
            .values()
            .find(|wu| wu.project_id == project_id && wu.name == name)
            .map(|wu| wu.id)
    }

    pub fn lookup_result(&self, project_id: ProjectId, name: &str) -> Option<ResultId> {
        self.results
            .values()
            .find(|r| r.project_id == project_id && r.name == name)
            .map(|r| r.id)
    }

    pub fn lookup_file(&self, project_id: ProjectId, name: &str) -> Option<FileId> {
        self.file_infos
            .values()
            .find(|f| f.project_id == project_id && f.name == name)
            .map(|f| f.id)
    }

    /// Where the bytes of a file live on disk.
    pub fn file_path(&self, file_id: FileId) -> Option<PathBuf> {
        let file = self.file_infos.get(&file_id)?;
        let project = self.projects.get(&file.project_id)?;
        Some(
            self.config
                .data_dir
                .join("projects")
                .join(project.dir_name())
                .join(&file.name),
        )
    }

    fn require_project(&self, project_id: ProjectId) -> Result<&Project> {
        self.projects
            .get(&project_id)
            .ok_or_else(|| ClientError::ProjectNotFound(project_id.to_string()))
    }

    fn require_result(&self, result_id: ResultId) -> Result<&ResultInfo> {
        self.results
            .get(&result_id)
            .ok_or_else(|| ClientError::ResultNotFound(result_id.to_string()))
    }

    fn require_file(&self, file_id: FileId) -> Result<&FileInfo> {
        self.file_infos
            .get(&file_id)
            .ok_or_else(|| ClientError::FileNotFound(file_id.to_string()))
    }

    // linking

    pub fn add_project(&mut self, mut project: Project) -> Result<ProjectId> {
        project.validate(self.config.max_text_len)?;
        if self.lookup_project(&project.master_url).is_some() {
            return Err(ClientError::DuplicateProject(project.master_url));
        }
        let id = self.alloc_id();
        project.id = id;
        info!("Attached to project {}", project.master_url);
        self.projects.insert(id, project);
        Ok(id)
    }

    /// Removes a project that nothing refers to any more.
    pub fn detach_project(&mut self, project_id: ProjectId) -> Result<Project> {
        let project = self.require_project(project_id)?;
        let refs = self.apps.values().filter(|a| a.project_id == project_id).count()
            + self
                .app_versions
                .values()
                .filter(|av| av.project_id == project_id)
                .count()
            + self
                .workunits
                .values()
                .filter(|wu| wu.project_id == project_id)
                .count()
            + self
                .results
                .values()
                .filter(|r| r.project_id == project_id)
                .count()
            + self
                .file_infos
                .values()
                .filter(|f| f.project_id == project_id)
                .count();
        if refs > 0 {
            return Err(ClientError::StillReferenced {
                kind: "project",
                name: project.master_url.clone(),
                ref_cnt: refs as u32,
            });
        }
        self.cpu_sched.period.projects.remove(&project_id);
        self.projects
            .remove(&project_id)
            .ok_or_else(|| ClientError::ProjectNotFound(project_id.to_string()))
    }

    pub fn link_app(&mut self, project_id: ProjectId, mut app: App) -> Result<AppId> {
        self.require_project(project_id)?;
        check_text("app name", &app.name, self.config.max_text_len)?;
        if self.lookup_app(project_id, &app.name).is_some() {
            return Err(ClientError::DuplicateEntity {
                kind: "app",
                name: app.name,
            });
        }
        let id = self.alloc_id();
        app.id = id;
        app.project_id = project_id;
        debug!("Linked app {}", app.name);
        self.apps.insert(id, app);
        Ok(id)
    }

    /// Adds a file description. With `merge_existing`, a description of a
    /// file the project already has is merged into it instead of rejected.
    pub fn link_file_info(
        &mut self,
        project_id: ProjectId,
        mut file: FileInfo,
        merge_existing: bool,
    ) -> Result<FileId> {
        self.require_project(project_id)?;
        let max = self.config.max_text_len;
        check_text("file name", &file.name, max)?;
        for url in &file.urls {
            check_text("file url", &url.url, max)?;
        }
        if let Some(existing) = self.lookup_file(project_id, &file.name) {
            if !merge_existing {
                return Err(ClientError::DuplicateEntity {
                    kind: "file",
                    name: file.name,
                });
            }
            if let Some(f) = self.file_infos.get_mut(&existing) {
                f.merge_info(&file);
            }
            return Ok(existing);
        }
        let id = self.alloc_id();
        file.id = id;
        file.project_id = project_id;
        file.ref_cnt = 0;
        file.result_id = None;
        if self.config.randomize_first_url && file.current_url.is_none() && file.urls.len() > 1 {
            file.current_url = Some(self.rand.gen_range(0..file.urls.len()));
        }
        debug!("Linked file {}", file.name);
        self.file_infos.insert(id, file);
        Ok(id)
    }

    // resolves every ref before touching any count, so a failure links nothing
    fn resolve_file_refs(&self, project_id: ProjectId, refs: &mut [FileRef]) -> Result<()> {
        let max = self.config.max_text_len;
        for r in refs.iter() {
            check_text("file_ref name", &r.file_name, max)?;
            check_text("open_name", &r.open_name, max)?;
        }
        let mut ids = Vec::with_capacity(refs.len());
        for r in refs.iter() {
            let id = self
                .lookup_file(project_id, &r.file_name)
                .ok_or_else(|| ClientError::FileNotFound(r.file_name.clone()))?;
            ids.push(id);
        }
        for (r, id) in refs.iter_mut().zip(ids) {
            r.file_id = Some(id);
        }
        Ok(())
    }

    fn incref_files(&mut self, refs: &[FileRef]) {
        for id in refs.iter().filter_map(|r| r.file_id) {
            if let Some(f) = self.file_infos.get_mut(&id) {
                f.ref_cnt += 1;
            }
        }
    }

    fn decref_files(&mut self, refs: &[FileRef]) {
        for id in refs.iter().filter_map(|r| r.file_id) {
            if let Some(f) = self.file_infos.get_mut(&id) {
                assert!(f.ref_cnt > 0, "reference count of file {} underflow", f.name);
                f.ref_cnt -= 1;
            }
        }
    }

    pub fn link_app_version(
        &mut self,
        project_id: ProjectId,
        mut av: AppVersion,
    ) -> Result<AppVersionId> {
        self.require_project(project_id)?;
        let app_id = self
            .lookup_app(project_id, &av.app_name)
            .ok_or_else(|| ClientError::AppNotFound(av.app_name.clone()))?;
        if self.lookup_app_version(app_id, av.version_num).is_some() {
            return Err(ClientError::DuplicateEntity {
                kind: "app version",
                name: av.version_string(),
            });
        }
        self.resolve_file_refs(project_id, &mut av.app_files)?;
        self.incref_files(&av.app_files);
        let id = self.alloc_id();
        av.id = id;
        av.app_id = app_id;
        av.project_id = project_id;
        av.ref_cnt = 0;
        debug!("Linked app version {}", av.version_string());
        self.app_versions.insert(id, av);
        Ok(id)
    }

    pub fn link_workunit(&mut self, project_id: ProjectId, mut wu: Workunit) -> Result<WorkunitId> {
        self.require_project(project_id)?;
        let max = self.config.max_text_len;
        check_text("workunit name", &wu.name, max)?;
        check_text("command_line", &wu.command_line, max)?;
        check_text("env_vars", &wu.env_vars, max)?;
        if self.lookup_workunit(project_id, &wu.name).is_some() {
            return Err(ClientError::DuplicateEntity {
                kind: "workunit",
                name: wu.name,
            });
        }
        let app_id = self
            .lookup_app(project_id, &wu.app_name)
            .ok_or_else(|| ClientError::AppNotFound(wu.app_name.clone()))?;
        // a work unit fresh from the server takes the newest version; a
        // parsed one stays on the version it was bound to
        let avp_id = if wu.version_num == 0 {
            self.newest_app_version(app_id)
        } else {
            self.lookup_app_version(app_id, wu.version_num)
        }
        .ok_or_else(|| ClientError::NoAppVersion(format!("{} {}", wu.app_name, wu.version_num)))?;
        self.resolve_file_refs(project_id, &mut wu.input_files)?;

        let av = self
            .app_versions
            .get_mut(&avp_id)
            .ok_or_else(|| ClientError::NoAppVersion(wu.app_name.clone()))?;
        av.ref_cnt += 1;
        wu.version_num = av.version_num;
        self.incref_files(&wu.input_files);

        let id = self.alloc_id();
        wu.id = id;
        wu.project_id = project_id;
        wu.app_id = app_id;
        wu.avp_id = Some(avp_id);
        wu.ref_cnt = 0;
        debug!("Linked workunit {} (version {})", wu.name, wu.version_num);
        self.workunits.insert(id, wu);
        Ok(id)
    }

    pub fn link_result(&mut self, project_id: ProjectId, mut result: ResultInfo) -> Result<ResultId> {
        self.require_project(project_id)?;
        let max = self.config.max_text_len;
        check_text("wu_name", &result.wu_name, max)?;
        let workunit_id = self.lookup_workunit(project_id, &result.wu_name);
        if workunit_id.is_none() && !result.got_server_ack {
            return Err(ClientError::WorkunitNotFound(result.wu_name));
        }
        if result.name.is_empty() {
            // first index whose name is free; removed results leave gaps
            let mut n = 0;
            while self
                .lookup_result(project_id, &ResultInfo::derive_name(&result.wu_name, n))
                .is_some()
            {
                n += 1;
            }
            result.name = ResultInfo::derive_name(&result.wu_name, n);
        }
        check_text("result name", &result.name, max)?;
        if self.lookup_result(project_id, &result.name).is_some() {
            return Err(ClientError::DuplicateEntity {
                kind: "result",
                name: result.name,
            });
        }
        self.resolve_file_refs(project_id, &mut result.output_files)?;
        self.incref_files(&result.output_files);

        let id = self.alloc_id();
        for file_id in result.output_file_ids().collect::<Vec<_>>() {
            if let Some(f) = self.file_infos.get_mut(&file_id) {
                f.result_id = Some(id);
            }
        }
        result.app_id = None;
        if let Some(wu) = workunit_id.and_then(|wu_id| self.workunits.get_mut(&wu_id)) {
            wu.ref_cnt += 1;
            result.app_id = Some(wu.app_id);
        }
        result.id = id;
        result.project_id = project_id;
        result.workunit_id = workunit_id;
        debug!("Linked result {}", result.name);
        self.results.insert(id, result);
        Ok(id)
    }

    // unlinking

    pub(crate) fn remove_result(&mut self, result_id: ResultId) -> Result<ResultInfo> {
        let result = self
            .results
            .remove(&result_id)
            .ok_or_else(|| ClientError::ResultNotFound(result_id.to_string()))?;
        self.decref_files(&result.output_files);
        for file_id in result.output_file_ids() {
            if let Some(f) = self.file_infos.get_mut(&file_id) {
                f.result_id = None;
            }
        }
        if let Some(wu) = result
            .workunit_id
            .and_then(|wu_id| self.workunits.get_mut(&wu_id))
        {
            assert!(wu.ref_cnt > 0, "reference count of workunit {} underflow", wu.name);
            wu.ref_cnt -= 1;
        }
        debug!("Removed result {}", result.name);
        Ok(result)
    }

    pub fn remove_workunit(&mut self, wu_id: WorkunitId) -> Result<Workunit> {
        let wu = self
            .workunits
            .get(&wu_id)
            .ok_or_else(|| ClientError::WorkunitNotFound(wu_id.to_string()))?;
        if wu.ref_cnt > 0 {
            return Err(ClientError::StillReferenced {
                kind: "workunit",
                name: wu.name.clone(),
                ref_cnt: wu.ref_cnt,
            });
        }
        let wu = self
            .workunits
            .remove(&wu_id)
            .ok_or_else(|| ClientError::WorkunitNotFound(wu_id.to_string()))?;
        self.decref_files(&wu.input_files);
        if let Some(av) = wu.avp_id.and_then(|id| self.app_versions.get_mut(&id)) {
            assert!(av.ref_cnt > 0, "reference count of {} underflow", av.version_string());
            av.ref_cnt -= 1;
        }
        debug!("Removed workunit {}", wu.name);
        Ok(wu)
    }

    pub fn is_superseded(&self, av_id: AppVersionId) -> bool {
        match self.app_versions.get(&av_id) {
            Some(av) => self.newest_app_version(av.app_id) != Some(av_id),
            None => false,
        }
    }

    pub fn remove_app_version(&mut self, av_id: AppVersionId) -> Result<AppVersion> {
        let av = self
            .app_versions
            .get(&av_id)
            .ok_or_else(|| ClientError::NoAppVersion(av_id.to_string()))?;
        if av.ref_cnt > 0 {
            return Err(ClientError::StillReferenced {
                kind: "app version",
                name: av.version_string(),
                ref_cnt: av.ref_cnt,
            });
        }
        if !self.is_superseded(av_id) {
            return Err(ClientError::NotSuperseded(av.version_string()));
        }
        let av = self
            .app_versions
            .remove(&av_id)
            .ok_or_else(|| ClientError::NoAppVersion(av_id.to_string()))?;
        self.decref_files(&av.app_files);
        debug!("Removed app version {}", av.version_string());
        Ok(av)
    }

    /// Deletes a file's bytes and its entry. Refused while anything refers
    /// to the file, while it is sticky, or while it is being transferred.
    pub fn delete_file(&mut self, file_id: FileId) -> Result<()> {
        let file = self.require_file(file_id)?;
        if file.ref_cnt > 0 {
            return Err(ClientError::StillReferenced {
                kind: "file",
                name: file.name.clone(),
                ref_cnt: file.ref_cnt,
            });
        }
        if file.sticky {
            return Err(ClientError::StickyFile(file.name.clone()));
        }
        if self.transfers.is_active(file_id) {
            return Err(ClientError::TransferInProgress(file.name.clone()));
        }
        if let Some(path) = self.file_path(file_id) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(file) = self.file_infos.remove(&file_id) {
            debug!("Deleted file {}", file.name);
        }
        Ok(())
    }

    // file sets

    /// Input files of a result: its work unit's inputs and the files of the
    /// app version it runs. Empty once the work unit is gone.
    pub fn result_input_file_ids(&self, result: &ResultInfo) -> Vec<FileId> {
        let Some(wu) = result.workunit_id.and_then(|id| self.workunits.get(&id)) else {
            return Vec::new();
        };
        let mut ids: Vec<FileId> = wu.input_files.iter().filter_map(|r| r.file_id).collect();
        if let Some(av) = wu.avp_id.and_then(|id| self.app_versions.get(&id)) {
            ids.extend(av.app_files.iter().filter_map(|r| r.file_id));
        }
        ids
    }

    fn file_errors<I>(&self, ids: I) -> Vec<FileError>
    where
        I: IntoIterator<Item = FileId>,
    {
        ids.into_iter()
            .filter_map(|id| self.file_infos.get(&id))
            .filter_map(FileError::of)
            .collect()
    }

    pub fn workunit_had_download_failure(&self, wu_id: WorkunitId) -> Option<i32> {
        let wu = self.workunits.get(&wu_id)?;
        wu.input_files
            .iter()
            .filter_map(|r| r.file_id)
            .filter_map(|id| self.file_infos.get(&id))
            .find_map(|f| f.had_failure())
    }

    pub fn app_version_had_download_failure(&self, av_id: AppVersionId) -> Option<i32> {
        let av = self.app_versions.get(&av_id)?;
        av.app_files
            .iter()
            .filter_map(|r| r.file_id)
            .filter_map(|id| self.file_infos.get(&id))
            .find_map(|f| f.had_failure())
    }

    /// One line per failed file of a work unit and its app version.
    pub fn get_file_errors(&self, wu_id: WorkunitId) -> String {
        let Some(wu) = self.workunits.get(&wu_id) else {
            return String::new();
        };
        let mut ids: Vec<FileId> = wu.input_files.iter().filter_map(|r| r.file_id).collect();
        if let Some(av) = wu.avp_id.and_then(|id| self.app_versions.get(&id)) {
            ids.extend(av.app_files.iter().filter_map(|r| r.file_id));
        }
        self.file_errors(ids)
            .iter()
            .map(|e| format!("{}: error {} ({})\n", e.file_name, e.error_code, e.error_msg))
            .collect()
    }

    pub fn clear_app_version_errors(&mut self, av_id: AppVersionId) {
        let ids: Vec<FileId> = match self.app_versions.get(&av_id) {
            Some(av) => av.app_files.iter().filter_map(|r| r.file_id).collect(),
            None => return,
        };
        for id in ids {
            if let Some(f) = self.file_infos.get_mut(&id) {
                if f.had_failure().is_some() {
                    f.reset();
                }
            }
        }
    }

    // result lifecycle

    fn next_result_step(&self, result: &ResultInfo) -> Option<ResultStep> {
        if result.ready_to_report || result.state.is_terminal() {
            return None;
        }
        match result.state {
            ResultState::New => Some(ResultStep::Advance(ResultState::FilesDownloading)),
            ResultState::FilesDownloading => {
                let inputs = self.result_input_file_ids(result);
                let files: Vec<&FileInfo> =
                    inputs.iter().filter_map(|id| self.file_infos.get(id)).collect();
                if result.workunit_id.is_none() {
                    None
                } else if files.iter().any(|f| f.had_failure().is_some()) {
                    Some(ResultStep::DownloadFailed)
                } else if files.iter().all(|f| f.is_present()) {
                    Some(ResultStep::Advance(ResultState::FilesDownloaded))
                } else {
                    None
                }
            }
            ResultState::ComputeDone => Some(ResultStep::Advance(ResultState::FilesUploading)),
            ResultState::FilesUploading => {
                let failed = result
                    .output_file_ids()
                    .filter_map(|id| self.file_infos.get(&id))
                    .any(|f| f.had_failure().is_some());
                if failed {
                    Some(ResultStep::UploadFailed)
                } else if result.is_upload_done(&self.file_infos) {
                    Some(ResultStep::Advance(ResultState::FilesUploaded))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Moves every result forward as far as its files allow. Returns the
    /// number of steps taken.
    pub fn update_results(&mut self, now: Time) -> usize {
        let mut steps = 0;
        for id in self.result_ids() {
            loop {
                let Some(result) = self.results.get(&id) else {
                    break;
                };
                let Some(step) = self.next_result_step(result) else {
                    break;
                };
                steps += 1;
                let outcome = match step {
                    ResultStep::Advance(next) => self.set_result_state(id, next, now),
                    ResultStep::DownloadFailed => self.report_result_error(
                        id,
                        "input file download failed",
                        0,
                        0,
                        "",
                    ),
                    ResultStep::UploadFailed => {
                        self.report_result_error(id, "output file upload failed", 0, 0, "")
                    }
                };
                if let Err(e) = outcome {
                    warn!("Result {}: {}", id, e);
                    break;
                }
            }
        }
        steps
    }

    fn set_result_state(&mut self, result_id: ResultId, next: ResultState, now: Time) -> Result<()> {
        let result = self
            .results
            .get_mut(&result_id)
            .ok_or_else(|| ClientError::ResultNotFound(result_id.to_string()))?;
        result.set_state(next)?;
        if next == ResultState::FilesUploaded {
            result.flush_stderr();
            info!("Result {} is ready to report", result.name);
            if result.past_deadline(now) {
                self.stats.borrow_mut().n_miss_deadline += 1;
            }
        }
        Ok(())
    }

    /// Appends an error report to the result and marks it ready to report.
    /// Which files are listed depends on the state the failure happened in.
    pub fn report_result_error(
        &mut self,
        result_id: ResultId,
        message: &str,
        exit_status: i32,
        signal: i32,
        stderr_txt: &str,
    ) -> Result<()> {
        let result = self.require_result(result_id)?;
        let state = result.state;
        let stderr_txt = if stderr_txt.is_empty() {
            result.stderr_txt.clone()
        } else {
            stderr_txt.to_string()
        };
        let file_errors = match state {
            ResultState::New | ResultState::FilesDownloading => {
                self.file_errors(self.result_input_file_ids(result))
            }
            ResultState::ComputeDone | ResultState::FilesUploading => {
                self.file_errors(result.output_file_ids())
            }
            _ => Vec::new(),
        };
        let report = ErrorReport {
            state,
            message: message.to_string(),
            exit_status,
            signal,
            file_errors,
            stderr_txt,
        };

        let result = self
            .results
            .get_mut(&result_id)
            .ok_or_else(|| ClientError::ResultNotFound(result_id.to_string()))?;
        result.append_error_report(&report);
        if matches!(state, ResultState::FilesDownloaded | ResultState::Computing) {
            result.set_state(ResultState::ComputeError)?;
        }
        warn!("Result {} failed: {}", result.name, message);
        self.stats.borrow_mut().n_results_failed += 1;
        Ok(())
    }

    fn file_has_other_consumer(&self, file_id: FileId, except: ResultId) -> bool {
        let in_app_version = self
            .app_versions
            .values()
            .any(|av| av.app_files.iter().any(|r| r.file_id == Some(file_id)));
        if in_app_version {
            return true;
        }
        self.results.values().any(|r| {
            r.id != except
                && !r.state.is_terminal()
                && (r.output_file_ids().any(|id| id == file_id)
                    || self.result_input_file_ids(r).contains(&file_id))
        })
    }

    /// Aborts a result right away. Transfers of its files are cancelled
    /// unless another live result or an app version still needs the file.
    /// Returns the files whose transfers were cancelled.
    pub fn abort_result(&mut self, result_id: ResultId) -> Result<Vec<FileId>> {
        let result = self.require_result(result_id)?;
        if !result.state.can_transition_to(ResultState::Aborted) {
            return Err(ClientError::InvalidTransition {
                result: result_id,
                from: result.state,
                to: ResultState::Aborted,
            });
        }
        let files: BTreeSet<FileId> = self
            .result_input_file_ids(result)
            .into_iter()
            .chain(result.output_file_ids())
            .collect();

        let mut cancelled = Vec::new();
        for file_id in files {
            if self.transfers.is_active(file_id) && !self.file_has_other_consumer(file_id, result_id)
            {
                self.transfers.cancel(file_id);
                cancelled.push(file_id);
            }
        }

        let result = self
            .results
            .get_mut(&result_id)
            .ok_or_else(|| ClientError::ResultNotFound(result_id.to_string()))?;
        result.abort()?;
        info!("Aborted result {}", result.name);
        self.stats.borrow_mut().n_results_aborted += 1;
        Ok(cancelled)
    }

    // CPU scheduling

    fn is_schedulable_project(&self, project_id: ProjectId) -> bool {
        self.projects
            .get(&project_id)
            .map(|p| !p.suspended_via_gui)
            .unwrap_or(false)
    }

    pub fn all_runnable_results(&self) -> Vec<ResultId> {
        Self::get_map_keys_by_predicate(&self.results, |r| {
            r.is_runnable() && self.is_schedulable_project(r.project_id)
        })
    }

    fn sched_snapshot(&self) -> Vec<SchedProject> {
        let mut runnable: FxHashMap<ProjectId, Vec<SchedResult>> = FxHashMap::default();
        for id in self.all_runnable_results() {
            let r = &self.results[&id];
            runnable.entry(r.project_id).or_default().push(SchedResult {
                id,
                name: r.name.clone(),
                report_deadline: r.report_deadline,
            });
        }
        self.project_ids()
            .into_iter()
            .filter_map(|id| self.projects.get(&id))
            .map(|p| SchedProject {
                id: p.id,
                master_url: p.master_url.clone(),
                resource_share: p.resource_share,
                debt: p.debt,
                non_cpu_intensive: p.non_cpu_intensive,
                runnable: runnable.remove(&p.id).unwrap_or_default(),
            })
            .collect()
    }

    fn run_scheduling_pass(&mut self, ncpus: u32, now: Time) -> Vec<ResultId> {
        let snapshot = self.sched_snapshot();
        let outcome = self.cpu_sched.run(&snapshot, ncpus, now);
        for (project_id, debt) in outcome.debts {
            if let Some(p) = self.projects.get_mut(&project_id) {
                p.debt = debt;
            }
        }
        for &id in &outcome.selected {
            let starting = self
                .results
                .get(&id)
                .map(|r| r.state == ResultState::FilesDownloaded)
                .unwrap_or(false);
            if starting {
                if let Err(e) = self.set_result_state(id, ResultState::Computing, now) {
                    warn!("Result {}: {}", id, e);
                }
            }
        }
        outcome.selected
    }

    /// Hands every CPU to a result; returns the results to run this period.
    pub fn schedule_cpus(&mut self, now: Time) -> Vec<ResultId> {
        let ncpus = self.cpu_sched.ncpus();
        self.run_scheduling_pass(ncpus, now)
    }

    /// The single result that should get the next free CPU.
    pub fn select_next_result(&mut self, now: Time) -> Option<ResultId> {
        self.run_scheduling_pass(1, now).into_iter().next()
    }

    pub fn period_state(&self) -> &PeriodState {
        &self.cpu_sched.period
    }

    fn charge_cpu(&mut self, result_id: ResultId, cpu_time: f64, now: Time) -> Result<()> {
        let result = self
            .results
            .get_mut(&result_id)
            .ok_or_else(|| ClientError::ResultNotFound(result_id.to_string()))?;
        result.final_cpu_time += cpu_time;
        let project_id = result.project_id;
        if let Some(p) = self.projects.get_mut(&project_id) {
            p.debt -= cpu_time;
            p.update_exp_avg_cpu(cpu_time, now);
        }
        self.cpu_sched.record_work(project_id, cpu_time);
        self.stats.borrow_mut().cpu_time_total += cpu_time;
        Ok(())
    }

    // verifies the outputs of a finished result; failures mark the file
    fn check_output_files(&mut self, result_id: ResultId) -> Result<bool> {
        let ids: Vec<FileId> = self.require_result(result_id)?.output_file_ids().collect();
        let mut all_ok = true;
        for id in ids {
            let Some(path) = self.file_path(id) else {
                continue;
            };
            let Some(file) = self.file_infos.get_mut(&id) else {
                continue;
            };
            if !file.generated_locally {
                continue;
            }
            if let Err(e) = file.mark_present(&path) {
                file.error_code = Some(ERR_OUTPUT_FILE);
                file.error_msg = e.to_string();
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    pub fn report_result_outcome(&mut self, result_id: ResultId, outcome: ResultOutcome) -> Result<()> {
        self.require_result(result_id)?;
        match outcome {
            ResultOutcome::Quantum { cpu_time, now } => self.charge_cpu(result_id, cpu_time, now),
            ResultOutcome::Finished {
                cpu_time,
                now,
                stderr_txt,
            } => {
                self.charge_cpu(result_id, cpu_time, now)?;
                let result = self
                    .results
                    .get_mut(&result_id)
                    .ok_or_else(|| ClientError::ResultNotFound(result_id.to_string()))?;
                result.set_state(ResultState::ComputeDone)?;
                result.exit_status = 0;
                // rendered last, after any error report of the upload
                result.stderr_txt = stderr_txt;
                if !self.check_output_files(result_id)? {
                    self.report_result_error(result_id, "output files missing or invalid", 0, 0, "")?;
                }
                self.update_results(now);
                Ok(())
            }
            ResultOutcome::Failed {
                cpu_time,
                now,
                message,
                exit_status,
                signal,
                stderr_txt,
            } => {
                self.charge_cpu(result_id, cpu_time, now)?;
                self.report_result_error(result_id, &message, exit_status, signal, &stderr_txt)
            }
            ResultOutcome::CouldntStart {
                message,
                error_code,
                stderr_txt,
            } => self.report_result_error(result_id, &message, error_code, 0, &stderr_txt),
            ResultOutcome::ServerAck => {
                let result = self
                    .results
                    .get_mut(&result_id)
                    .ok_or_else(|| ClientError::ResultNotFound(result_id.to_string()))?;
                if !result.got_server_ack {
                    result.got_server_ack = true;
                    self.stats.borrow_mut().n_results_acked += 1;
                }
                Ok(())
            }
        }
    }

    // file transfers

    // most urgent live result needing each file; a file counts as past
    // deadline only when every result needing it is
    fn file_urgency(&self, now: Time) -> FxHashMap<FileId, (bool, FloatWrapper)> {
        let mut urgency: FxHashMap<FileId, (bool, FloatWrapper)> = FxHashMap::default();
        for r in self.results.values().filter(|r| !r.state.is_terminal()) {
            let key = (r.past_deadline(now), FloatWrapper(r.report_deadline));
            for id in self
                .result_input_file_ids(r)
                .into_iter()
                .chain(r.output_file_ids())
            {
                let entry = urgency.entry(id).or_insert(key);
                if key < *entry {
                    *entry = key;
                }
            }
        }
        urgency
    }

    fn needs_transfer(&self, file: &FileInfo, direction: Direction) -> bool {
        if file.had_failure().is_some() || self.transfers.is_active(file.id) {
            return false;
        }
        match direction {
            Direction::Download => {
                !file.generated_locally
                    && !file.is_present()
                    && file.ref_cnt > 0
                    && file.has_urls(false)
            }
            Direction::Upload => {
                file.generated_locally
                    && file.is_present()
                    && file.upload_when_present
                    && !file.uploaded
                    && file.has_urls(true)
            }
        }
    }

    /// Files waiting for a transfer in `direction`, most urgent first.
    /// Files needed only by results past their deadline come last.
    pub fn pending_transfers(&self, direction: Direction, now: Time) -> Vec<PendingTransfer> {
        let urgency = self.file_urgency(now);
        let mut pending: Vec<((bool, FloatWrapper), PendingTransfer)> = self
            .file_infos
            .values()
            .filter(|f| self.needs_transfer(f, direction))
            .filter_map(|f| {
                let url = f.current_url(direction.is_upload())?.to_string();
                let key = urgency
                    .get(&f.id)
                    .copied()
                    .unwrap_or((false, FloatWrapper(f64::MAX)));
                Some((
                    key,
                    PendingTransfer {
                        file_id: f.id,
                        name: f.name.clone(),
                        url,
                    },
                ))
            })
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        pending.into_iter().map(|(_, p)| p).collect()
    }

    /// Starts a transfer and returns the URL to use.
    pub fn start_transfer(&mut self, file_id: FileId, direction: Direction) -> Result<String> {
        let file = self
            .file_infos
            .get_mut(&file_id)
            .ok_or_else(|| ClientError::FileNotFound(file_id.to_string()))?;
        let transfer = self.transfers.start(file, direction)?;
        Ok(transfer.url.clone())
    }

    pub fn on_transfer_progress(&mut self, file_id: FileId, bytes: f64) -> Result<()> {
        let file = self
            .file_infos
            .get_mut(&file_id)
            .ok_or_else(|| ClientError::FileNotFound(file_id.to_string()))?;
        self.transfers.on_progress(file, bytes)
    }

    pub fn on_transfer_complete(
        &mut self,
        file_id: FileId,
        ok: bool,
        error_code: i32,
    ) -> Result<TransferOutcome> {
        let path = self.file_path(file_id);
        let file = self
            .file_infos
            .get_mut(&file_id)
            .ok_or_else(|| ClientError::FileNotFound(file_id.to_string()))?;

        if !ok {
            self.stats.borrow_mut().n_url_failovers += 1;
            return match self.transfers.on_failure(file, error_code)? {
                FailoverStep::Retry { url } => Ok(TransferOutcome::Retry { url }),
                FailoverStep::Exhausted => {
                    warn!("{}: {}", file.name, file.error_msg);
                    self.stats.borrow_mut().n_mirrors_exhausted += 1;
                    self.fail_dependents(file_id);
                    Ok(TransferOutcome::Failed)
                }
            };
        }

        let transfer = self.transfers.on_success(file)?;
        self.stats.borrow_mut().n_transfers_completed += 1;
        if transfer.direction == Direction::Download {
            let verified = match &path {
                Some(path) => file.mark_present(path),
                None => Err(ClientError::FileNotFound(file.name.clone())),
            };
            if let Err(e) = verified {
                warn!("{}; fetching again", e);
                file.reset();
                self.stats.borrow_mut().n_verification_failures += 1;
                return Ok(TransferOutcome::Refetch);
            }
            debug!("Downloaded {}", file.name);
        } else {
            debug!("Uploaded {}", file.name);
        }
        Ok(TransferOutcome::Completed)
    }

    // a file ran out of mirrors: every result waiting on it reports an error
    fn fail_dependents(&mut self, file_id: FileId) {
        let Some(file) = self.file_infos.get(&file_id) else {
            return;
        };
        let message = format!("file {} failed: {}", file.name, file.error_msg);
        let error_code = file.error_code.unwrap_or(0);
        let dependents = Self::get_map_keys_by_predicate(&self.results, |r| {
            if r.ready_to_report {
                return false;
            }
            match r.state {
                ResultState::New | ResultState::FilesDownloading => {
                    self.result_input_file_ids(r).contains(&file_id)
                }
                ResultState::ComputeDone | ResultState::FilesUploading => {
                    r.output_file_ids().any(|id| id == file_id)
                }
                _ => false,
            }
        });
        for id in dependents {
            if let Err(e) = self.report_result_error(id, &message, error_code, 0, "") {
                warn!("Result {}: {}", id, e);
            }
        }
    }

    /// Sender for transfer threads; events are applied by
    /// `process_transfer_events` on the control thread.
    pub fn transfer_sender(&self) -> TransferSender {
        self.inbox.sender()
    }

    pub fn process_transfer_events(&mut self) -> usize {
        let events = self.inbox.try_recv_all();
        let n = events.len();
        for event in events {
            let res = match event {
                TransferEvent::Progress { file_id, bytes } => {
                    self.on_transfer_progress(file_id, bytes)
                }
                TransferEvent::Complete {
                    file_id,
                    ok,
                    error_code,
                } => self.on_transfer_complete(file_id, ok, error_code).map(|_| ()),
            };
            if let Err(e) = res {
                warn!("Dropped transfer event: {}", e);
            }
        }
        n
    }

    pub fn active_transfer_count(&self) -> usize {
        self.transfers.len()
    }

    pub fn transfer_url(&self, file_id: FileId) -> Option<&str> {
        self.transfers.get(file_id).map(|t| t.url.as_str())
    }
}
