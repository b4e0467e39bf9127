use std::fmt::Write;

use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use super::file_info::FileInfo;
use super::file_ref::FileRef;
use crate::common::{AppId, FileId, ProjectId, ResultId, Time, WorkunitId};
use crate::error::{ClientError, Result};

/// Progress of a result on this host, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    #[default]
    New,
    FilesDownloading,
    FilesDownloaded,
    ComputeError,
    Computing,
    ComputeDone,
    FilesUploading,
    FilesUploaded,
    Aborted,
}

impl ResultState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResultState::ComputeError | ResultState::FilesUploaded | ResultState::Aborted
        )
    }

    pub fn can_transition_to(self, next: ResultState) -> bool {
        use ResultState::*;
        if next == Aborted {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (New, FilesDownloading)
                | (FilesDownloading, FilesDownloaded)
                | (FilesDownloaded, Computing)
                | (FilesDownloaded, ComputeError)
                | (Computing, ComputeError)
                | (Computing, ComputeDone)
                | (ComputeDone, FilesUploading)
                | (FilesUploading, FilesUploaded)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileError {
    pub file_name: String,
    pub error_code: i32,
    pub error_msg: String,
}

impl FileError {
    pub fn of(file: &FileInfo) -> Option<Self> {
        file.had_failure().map(|error_code| Self {
            file_name: file.name.clone(),
            error_code,
            error_msg: file.error_msg.clone(),
        })
    }
}

/// Error description appended to a result's `stderr_out`. The server reads
/// the error entries first and the captured stderr last.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub state: ResultState,
    pub message: String,
    pub exit_status: i32,
    pub signal: i32,
    pub file_errors: Vec<FileError>,
    pub stderr_txt: String,
}

impl ErrorReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        // writing into a String cannot fail
        let _ = write!(
            out,
            "<message>\n{}\n</message>\n<exit_status>{}</exit_status>\n<signal>{}</signal>\n",
            self.message, self.exit_status, self.signal
        );
        match self.state {
            ResultState::New | ResultState::FilesDownloading => {
                for e in &self.file_errors {
                    Self::write_file_error(&mut out, "download_error", e);
                }
            }
            ResultState::FilesDownloaded => {
                let _ = writeln!(out, "<couldnt_start>{}</couldnt_start>", self.exit_status);
            }
            ResultState::ComputeDone | ResultState::FilesUploading => {
                for e in &self.file_errors {
                    Self::write_file_error(&mut out, "upload_error", e);
                }
            }
            _ => {}
        }
        let _ = write!(out, "<stderr_txt>\n{}\n</stderr_txt>\n", self.stderr_txt);
        out
    }

    fn write_file_error(out: &mut String, tag: &str, e: &FileError) {
        let _ = write!(
            out,
            "<{tag}>\n    <file_name>{}</file_name>\n    <error_code>{}</error_code>\n    <error_message>{}</error_message>\n</{tag}>\n",
            e.file_name,
            e.error_code,
            e.error_msg,
            tag = tag
        );
    }
}

/// One instance of a work unit being processed on this host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ResultInfo {
    #[serde(skip)]
    pub id: ResultId,
    #[serde(skip)]
    pub project_id: ProjectId,
    #[serde(skip)]
    pub app_id: Option<AppId>,
    // absent once the server acknowledged the result and the work unit is gone
    #[serde(skip)]
    pub workunit_id: Option<WorkunitId>,
    pub name: String,
    pub wu_name: String,
    pub report_deadline: Time,
    pub output_files: Vec<FileRef>,
    pub ready_to_report: bool,
    pub got_server_ack: bool,
    pub final_cpu_time: f64,
    pub state: ResultState,
    pub exit_status: i32,
    pub stderr_out: String,
    // captured application stderr not yet rendered into stderr_out
    pub stderr_txt: String,
}

impl ResultInfo {
    pub fn new(name: &str, wu_name: &str, report_deadline: Time) -> Self {
        Self {
            name: name.to_string(),
            wu_name: wu_name.to_string(),
            report_deadline,
            ..Default::default()
        }
    }

    /// Name of the `n`-th result of a work unit.
    pub fn derive_name(wu_name: &str, n: usize) -> String {
        format!("{}_{}", wu_name, n)
    }

    pub fn set_state(&mut self, next: ResultState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ClientError::InvalidTransition {
                result: self.id,
                from: self.state,
                to: next,
            });
        }
        debug!("Result {} state: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        if next == ResultState::FilesUploaded || next == ResultState::Aborted {
            self.ready_to_report = true;
        }
        Ok(())
    }

    pub fn abort(&mut self) -> Result<()> {
        self.set_state(ResultState::Aborted)
    }

    pub fn is_runnable(&self) -> bool {
        !self.ready_to_report
            && matches!(
                self.state,
                ResultState::FilesDownloaded | ResultState::Computing
            )
    }

    pub fn past_deadline(&self, now: Time) -> bool {
        self.report_deadline > 0. && now > self.report_deadline
    }

    pub fn append_error_report(&mut self, report: &ErrorReport) {
        self.stderr_out.push_str(&report.render());
        self.stderr_txt.clear();
        self.exit_status = report.exit_status;
        self.ready_to_report = true;
    }

    /// Renders the captured stderr of a result that succeeded.
    pub fn flush_stderr(&mut self) {
        if self.stderr_txt.is_empty() {
            return;
        }
        let stderr_txt = std::mem::take(&mut self.stderr_txt);
        let _ = write!(self.stderr_out, "<stderr_txt>\n{}\n</stderr_txt>\n", stderr_txt);
    }

    pub fn output_file_ids(&self) -> impl Iterator<Item = FileId> + '_ {
        self.output_files.iter().filter_map(|r| r.file_id)
    }

    /// True once every output file that has to be uploaded has been.
    pub fn is_upload_done(&self, files: &FxHashMap<FileId, FileInfo>) -> bool {
        self.output_file_ids()
            .filter_map(|id| files.get(&id))
            .filter(|f| f.upload_when_present)
            .all(|f| f.uploaded)
    }

    /// Forgets produced output so the result can be computed again.
    pub fn reset_files(&self, files: &mut FxHashMap<FileId, FileInfo>) {
        for id in self.output_file_ids() {
            if let Some(file) = files.get_mut(&id) {
                file.reset();
            }
        }
    }
}
