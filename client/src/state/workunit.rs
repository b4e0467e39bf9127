use serde::{Deserialize, Serialize};

use super::file_ref::FileRef;
use crate::common::{AppId, AppVersionId, ProjectId, WorkunitId};

/// A task description issued by a project. Only the link fields and the
/// reference count change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Workunit {
    #[serde(skip)]
    pub id: WorkunitId,
    #[serde(skip)]
    pub project_id: ProjectId,
    #[serde(skip)]
    pub app_id: AppId,
    #[serde(skip)]
    pub avp_id: Option<AppVersionId>,
    pub name: String,
    pub app_name: String,
    // bound by the client when the work unit arrives; 0 until then
    pub version_num: u32,
    pub command_line: String,
    // environment variables in URL format
    pub env_vars: String,
    pub input_files: Vec<FileRef>,
    pub rsc_fpops_est: f64,
    pub rsc_fpops_bound: f64,
    pub rsc_memory_bound: f64,
    pub rsc_disk_bound: f64,
    #[serde(skip)]
    pub ref_cnt: u32,
}

impl Workunit {
    pub fn new(name: &str, app_name: &str) -> Self {
        Self {
            name: name.to_string(),
            app_name: app_name.to_string(),
            ..Default::default()
        }
    }
}
