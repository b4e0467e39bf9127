//! Per-file transfer bookkeeping and mirror failover.
//!
//! The transport itself lives outside this crate. It asks for the URL to use,
//! reports progress and completion, and is told whether to retry on another
//! mirror or give up.

use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::common::FileId;
use crate::error::{ClientError, Result};
use crate::state::file_info::FileInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn is_upload(self) -> bool {
        self == Direction::Upload
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTransfer {
    pub file_id: FileId,
    pub direction: Direction,
    pub url: String,
    // bytes moved so far; a retry on another mirror resumes from here
    pub bytes_done: f64,
    pub nattempts: u32,
}

/// What the transport should do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailoverStep {
    Retry { url: String },
    Exhausted,
}

/// At most one active transfer per file.
#[derive(Debug, Default)]
pub struct TransferTable {
    active: FxHashMap<FileId, ActiveTransfer>,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, file_id: FileId) -> bool {
        self.active.contains_key(&file_id)
    }

    pub fn get(&self, file_id: FileId) -> Option<&ActiveTransfer> {
        self.active.get(&file_id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn start(&mut self, file: &mut FileInfo, direction: Direction) -> Result<&ActiveTransfer> {
        if self.active.contains_key(&file.id) {
            return Err(ClientError::TransferInProgress(file.name.clone()));
        }
        let url = file.init_url(direction.is_upload())?.to_string();
        debug!("{} of {} started at {}", direction_name(direction), file.name, url);
        let bytes_done = if direction.is_upload() {
            file.upload_offset
        } else {
            file.download_offset
        };
        let transfer = ActiveTransfer {
            file_id: file.id,
            direction,
            url,
            bytes_done,
            nattempts: 1,
        };
        Ok(self.active.entry(file.id).or_insert(transfer))
    }

    pub fn on_progress(&mut self, file: &mut FileInfo, bytes: f64) -> Result<()> {
        let transfer = self
            .active
            .get_mut(&file.id)
            .ok_or_else(|| ClientError::NoActiveTransfer(file.name.clone()))?;
        if bytes > transfer.bytes_done {
            transfer.bytes_done = bytes;
        }
        if transfer.direction.is_upload() {
            file.upload_offset = transfer.bytes_done;
        } else {
            file.download_offset = transfer.bytes_done;
        }
        Ok(())
    }

    /// Moves to the next mirror, or drops the transfer once every mirror of
    /// its direction failed. In the latter case the file carries the error.
    pub fn on_failure(&mut self, file: &mut FileInfo, error_code: i32) -> Result<FailoverStep> {
        let transfer = self
            .active
            .get_mut(&file.id)
            .ok_or_else(|| ClientError::NoActiveTransfer(file.name.clone()))?;
        let for_upload = transfer.direction.is_upload();
        let msg = format!("error {} from {}", error_code, transfer.url);
        if file.record_failure(for_upload, error_code, &msg) {
            self.active.remove(&file.id);
            return Ok(FailoverStep::Exhausted);
        }
        let url = file.advance_url(for_upload)?.to_string();
        debug!("{}: {}, trying {}", file.name, msg, url);
        transfer.url = url.clone();
        transfer.nattempts += 1;
        Ok(FailoverStep::Retry { url })
    }

    /// Finishes the transfer; the next attempt for this file starts at the
    /// mirror that just worked.
    pub fn on_success(&mut self, file: &mut FileInfo) -> Result<ActiveTransfer> {
        let transfer = self
            .active
            .remove(&file.id)
            .ok_or_else(|| ClientError::NoActiveTransfer(file.name.clone()))?;
        file.start_url = file.current_url;
        file.last_error = None;
        if transfer.direction.is_upload() {
            file.uploaded = true;
            file.upload_offset = file.nbytes;
        } else {
            file.download_offset = file.nbytes;
        }
        Ok(transfer)
    }

    pub fn cancel(&mut self, file_id: FileId) -> Option<ActiveTransfer> {
        self.active.remove(&file_id)
    }
}

fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::Download => "download",
        Direction::Upload => "upload",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::file_info::FileUrl;

    fn file_with_mirrors() -> FileInfo {
        let mut file = FileInfo::new("in.dat");
        file.id = 7;
        file.urls = vec![
            FileUrl::download("http://m0/in.dat"),
            FileUrl::download("http://m1/in.dat"),
            FileUrl::download("http://m2/in.dat"),
            FileUrl::upload("http://m3/file_upload_handler"),
        ];
        file.current_url = Some(0);
        file
    }

    #[test]
    fn failover_tries_each_download_mirror_then_gives_up() {
        let mut table = TransferTable::new();
        let mut file = file_with_mirrors();

        let mut tried = vec![table.start(&mut file, Direction::Download).unwrap().url.clone()];
        loop {
            match table.on_failure(&mut file, -184).unwrap() {
                FailoverStep::Retry { url } => tried.push(url),
                FailoverStep::Exhausted => break,
            }
        }
        assert_eq!(
            tried,
            vec!["http://m0/in.dat", "http://m1/in.dat", "http://m2/in.dat"]
        );
        assert!(!table.is_active(file.id));
        assert_eq!(file.had_failure(), Some(-184));
    }

    #[test]
    fn second_start_is_rejected() {
        let mut table = TransferTable::new();
        let mut file = file_with_mirrors();
        table.start(&mut file, Direction::Download).unwrap();
        assert!(matches!(
            table.start(&mut file, Direction::Download),
            Err(ClientError::TransferInProgress(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn next_attempt_starts_at_last_good_mirror() {
        let mut table = TransferTable::new();
        let mut file = file_with_mirrors();
        table.start(&mut file, Direction::Download).unwrap();
        table.on_failure(&mut file, -184).unwrap();
        table.on_success(&mut file).unwrap();
        assert_eq!(file.start_url, Some(1));

        file.reset();
        let transfer = table.start(&mut file, Direction::Download).unwrap();
        assert_eq!(transfer.url, "http://m1/in.dat");
    }

    #[test]
    fn upload_progress_is_resumable() {
        let mut table = TransferTable::new();
        let mut file = file_with_mirrors();
        file.generated_locally = true;
        file.nbytes = 1000.;
        table.start(&mut file, Direction::Upload).unwrap();
        table.on_progress(&mut file, 400.).unwrap();
        assert_eq!(file.upload_offset, 400.);
        // stale progress never moves the offset back
        table.on_progress(&mut file, 100.).unwrap();
        assert_eq!(file.upload_offset, 400.);

        // single upload mirror: one failure exhausts it
        assert_eq!(table.on_failure(&mut file, -1).unwrap(), FailoverStep::Exhausted);
        assert_eq!(file.upload_offset, 400.);
    }

    #[test]
    fn download_resumes_after_cancel() {
        let mut table = TransferTable::new();
        let mut file = file_with_mirrors();
        file.nbytes = 1000.;
        table.start(&mut file, Direction::Download).unwrap();
        table.on_progress(&mut file, 250.).unwrap();
        assert_eq!(file.download_offset, 250.);
        table.cancel(file.id);

        let transfer = table.start(&mut file, Direction::Download).unwrap();
        assert_eq!(transfer.bytes_done, 250.);
        assert_eq!(file.upload_offset, 0.);

        // a refetch starts from scratch
        table.cancel(file.id);
        file.reset();
        let transfer = table.start(&mut file, Direction::Download).unwrap();
        assert_eq!(transfer.bytes_done, 0.);
    }

    #[test]
    fn upload_success_marks_uploaded() {
        let mut table = TransferTable::new();
        let mut file = file_with_mirrors();
        file.nbytes = 10.;
        table.start(&mut file, Direction::Upload).unwrap();
        table.on_success(&mut file).unwrap();
        assert!(file.uploaded);
        assert_eq!(file.upload_offset, 10.);
    }

    #[test]
    fn events_without_transfer_are_errors() {
        let mut table = TransferTable::new();
        let mut file = file_with_mirrors();
        assert!(table.on_progress(&mut file, 1.).is_err());
        assert!(table.on_failure(&mut file, -1).is_err());
        assert!(table.on_success(&mut file).is_err());
    }
}
