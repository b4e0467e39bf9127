use serde::{Deserialize, Serialize};

use crate::common::FileId;

/// Binds a file into the file set of a work unit, result or app version.
///
/// The app opens the file under `open_name`; `file_id` is filled in when the
/// reference is linked against the owning project's files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileRef {
    pub file_name: String,
    pub open_name: String,
    pub main_program: bool,
    // copy the file into the slot instead of linking it
    pub copy_file: bool,
    #[serde(skip)]
    pub file_id: Option<FileId>,
}

impl FileRef {
    pub fn new(file_name: &str, open_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            open_name: open_name.to_string(),
            ..Default::default()
        }
    }

    pub fn main_program(file_name: &str) -> Self {
        Self {
            main_program: true,
            ..Self::new(file_name, file_name)
        }
    }

    pub fn open_name(&self) -> &str {
        if self.open_name.is_empty() {
            &self.file_name
        } else {
            &self.open_name
        }
    }
}
