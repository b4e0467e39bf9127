use serde::{Deserialize, Serialize};

use super::file_ref::FileRef;
use crate::common::{AppId, AppVersionId, ProjectId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct App {
    #[serde(skip)]
    pub id: AppId,
    #[serde(skip)]
    pub project_id: ProjectId,
    pub name: String,
}

impl App {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// One executable build of an app. Work units that run it hold a reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppVersion {
    #[serde(skip)]
    pub id: AppVersionId,
    #[serde(skip)]
    pub app_id: AppId,
    #[serde(skip)]
    pub project_id: ProjectId,
    pub app_name: String,
    pub version_num: u32,
    pub app_files: Vec<FileRef>,
    #[serde(skip)]
    pub ref_cnt: u32,
}

impl AppVersion {
    pub fn new(app_name: &str, version_num: u32, app_files: Vec<FileRef>) -> Self {
        Self {
            app_name: app_name.to_string(),
            version_num,
            app_files,
            ..Default::default()
        }
    }

    /// e.g. "setiathome 4.05"
    pub fn version_string(&self) -> String {
        format!(
            "{} {}.{:02}",
            self.app_name,
            self.version_num / 100,
            self.version_num % 100
        )
    }

    pub fn main_program(&self) -> Option<&FileRef> {
        self.app_files.iter().find(|f| f.main_program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_splits_hundredths() {
        let av = AppVersion::new("setiathome", 405, Vec::new());
        assert_eq!(av.version_string(), "setiathome 4.05");
        let av = AppVersion::new("einstein", 1200, Vec::new());
        assert_eq!(av.version_string(), "einstein 12.00");
    }

    #[test]
    fn main_program_is_flagged_ref() {
        let av = AppVersion::new(
            "app",
            1,
            vec![FileRef::new("lib.so", "lib.so"), FileRef::main_program("app_1")],
        );
        assert_eq!(av.main_program().unwrap().file_name, "app_1");
    }
}
