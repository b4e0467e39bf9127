use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::common::{FileId, ProjectId, ResultId};
use crate::error::{ClientError, Result};

// Marker that identifies upload servers in URLs that carry no explicit direction
const UPLOAD_HANDLER_MARKER: &str = "file_upload_handler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    #[default]
    NotPresent,
    Present,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUrl {
    pub url: String,
    // None when the server did not say; see `is_upload`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<bool>,
}

impl FileUrl {
    pub fn download(url: &str) -> Self {
        Self {
            url: url.to_string(),
            upload: Some(false),
        }
    }

    pub fn upload(url: &str) -> Self {
        Self {
            url: url.to_string(),
            upload: Some(true),
        }
    }

    pub fn is_upload(&self) -> bool {
        self.upload
            .unwrap_or_else(|| self.url.contains(UPLOAD_HANDLER_MARKER))
    }

    pub fn matches(&self, for_upload: bool) -> bool {
        self.is_upload() == for_upload
    }
}

/// Outcome of checking the locally stored bytes of a file.
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Ok { nbytes: f64, md5: String },
    Missing,
    SizeMismatch { expected: f64, actual: f64 },
    TooBig { max: f64, actual: f64 },
    ChecksumMismatch { expected: String, actual: String },
}

impl Verification {
    pub fn is_ok(&self) -> bool {
        matches!(self, Verification::Ok { .. })
    }

    fn describe(&self) -> String {
        match self {
            Verification::Ok { .. } => "ok".to_string(),
            Verification::Missing => "file is missing".to_string(),
            Verification::SizeMismatch { expected, actual } => {
                format!("expected {} bytes, found {}", expected, actual)
            }
            Verification::TooBig { max, actual } => {
                format!("{} bytes exceeds limit of {}", actual, max)
            }
            Verification::ChecksumMismatch { expected, actual } => {
                format!("md5 {} does not match {}", actual, expected)
            }
        }
    }
}

/// A named blob that is downloaded from or uploaded to one of several mirrors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileInfo {
    #[serde(skip)]
    pub id: FileId,
    #[serde(skip)]
    pub project_id: ProjectId,
    pub name: String,
    pub md5_cksum: String,
    pub max_nbytes: f64,
    // 0 means the size is not known yet
    pub nbytes: f64,
    pub upload_offset: f64,
    // bytes of a partial download kept on disk
    pub download_offset: f64,
    pub generated_locally: bool,
    pub status: FileStatus,
    pub executable: bool,
    pub uploaded: bool,
    pub upload_when_present: bool,
    pub sticky: bool,
    pub report_on_rpc: bool,
    pub signature_required: bool,
    pub is_user_file: bool,
    pub urls: Vec<FileUrl>,
    pub start_url: Option<usize>,
    pub current_url: Option<usize>,
    pub signed_xml: String,
    pub xml_signature: String,
    pub file_signature: String,
    // permanent transfer error, if any
    pub error_code: Option<i32>,
    pub error_msg: String,
    #[serde(skip)]
    pub last_error: Option<i32>,
    #[serde(skip)]
    pub ref_cnt: u32,
    // owning result of an output file
    #[serde(skip)]
    pub result_id: Option<ResultId>,
}

impl FileInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Forgets everything about the previous transfer. Never touches storage.
    pub fn reset(&mut self) {
        self.status = FileStatus::NotPresent;
        self.upload_offset = 0.;
        self.download_offset = 0.;
        self.uploaded = false;
        self.error_code = None;
        self.error_msg.clear();
        self.last_error = None;
        self.start_url = None;
    }

    pub fn is_present(&self) -> bool {
        self.status == FileStatus::Present
    }

    pub fn had_failure(&self) -> Option<i32> {
        self.error_code
    }

    pub fn has_urls(&self, for_upload: bool) -> bool {
        self.urls.iter().any(|u| u.matches(for_upload))
    }

    // first index at or after `from` (wrapping) holding a URL of the wanted direction
    fn find_from(&self, from: usize, for_upload: bool) -> Option<usize> {
        let n = self.urls.len();
        (0..n)
            .map(|i| (from + i) % n)
            .find(|&i| self.urls[i].matches(for_upload))
    }

    /// URL in use now, skipping entries of the other direction.
    pub fn current_url(&self, for_upload: bool) -> Option<&str> {
        if self.urls.is_empty() {
            return None;
        }
        let from = self.current_url.unwrap_or(0) % self.urls.len();
        self.find_from(from, for_upload)
            .map(|i| self.urls[i].url.as_str())
    }

    /// Starts a new attempt at the current cursor and remembers where it started.
    pub fn init_url(&mut self, for_upload: bool) -> Result<&str> {
        if self.urls.is_empty() {
            return Err(ClientError::NoMoreUrls(self.name.clone()));
        }
        let from = self.current_url.unwrap_or(0) % self.urls.len();
        let idx = self
            .find_from(from, for_upload)
            .ok_or_else(|| ClientError::NoMoreUrls(self.name.clone()))?;
        self.start_url = Some(idx);
        self.current_url = Some(idx);
        Ok(&self.urls[idx].url)
    }

    fn next_index(&self, for_upload: bool) -> Option<usize> {
        let n = self.urls.len();
        let current = self.current_url?;
        let start = self.start_url.unwrap_or(current);
        let next = self.find_from((current + 1) % n, for_upload)?;
        if next == start {
            None
        } else {
            Some(next)
        }
    }

    /// Moves to the next mirror of the wanted direction, wrapping around.
    /// Fails once every such mirror has been tried since `start_url`.
    pub fn advance_url(&mut self, for_upload: bool) -> Result<&str> {
        if self.current_url.is_none() {
            return self.init_url(for_upload);
        }
        if self.start_url.is_none() {
            self.start_url = self.current_url;
        }
        let next = self
            .next_index(for_upload)
            .ok_or_else(|| ClientError::NoMoreUrls(self.name.clone()))?;
        self.current_url = Some(next);
        Ok(&self.urls[next].url)
    }

    pub fn is_last_url(&self, for_upload: bool) -> bool {
        self.urls.is_empty() || self.next_index(for_upload).is_none()
    }

    /// Records a failed attempt on the current mirror. Returns true when that
    /// was the last mirror, in which case the file is marked as failed.
    pub fn record_failure(&mut self, for_upload: bool, code: i32, msg: &str) -> bool {
        self.last_error = Some(code);
        if self.is_last_url(for_upload) {
            self.error_code = Some(code);
            self.error_msg = format!("all mirrors exhausted: {}", msg);
            true
        } else {
            false
        }
    }

    /// Recomputes size and md5 of the stored bytes and compares them with
    /// what the project announced. A mismatch is reported, not raised.
    pub fn verify_existing(&self, path: &Path) -> Result<Verification> {
        let (md5, nbytes) = match md5_file(path) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Verification::Missing),
            Err(e) => return Err(e.into()),
        };
        let actual = nbytes as f64;
        if self.nbytes != 0. && actual != self.nbytes {
            return Ok(Verification::SizeMismatch {
                expected: self.nbytes,
                actual,
            });
        }
        if self.max_nbytes > 0. && actual > self.max_nbytes {
            return Ok(Verification::TooBig {
                max: self.max_nbytes,
                actual,
            });
        }
        if !self.md5_cksum.is_empty() && !self.md5_cksum.eq_ignore_ascii_case(&md5) {
            return Ok(Verification::ChecksumMismatch {
                expected: self.md5_cksum.clone(),
                actual: md5,
            });
        }
        Ok(Verification::Ok {
            nbytes: actual,
            md5,
        })
    }

    /// Marks the file present once its bytes verify. Unknown size or checksum
    /// is filled in from the stored bytes.
    pub fn mark_present(&mut self, path: &Path) -> Result<()> {
        match self.verify_existing(path)? {
            Verification::Ok { nbytes, md5 } => {
                if self.nbytes == 0. {
                    self.nbytes = nbytes;
                }
                if self.md5_cksum.is_empty() {
                    self.md5_cksum = md5;
                }
                self.status = FileStatus::Present;
                Ok(())
            }
            other => Err(ClientError::Verification {
                name: self.name.clone(),
                reason: other.describe(),
            }),
        }
    }

    /// Folds a re-sent description of the same file into this one without
    /// touching local transfer state.
    pub fn merge_info(&mut self, new_info: &FileInfo) {
        self.max_nbytes = new_info.max_nbytes;
        for url in &new_info.urls {
            if !self.urls.iter().any(|u| u.url == url.url) {
                self.urls.push(url.clone());
            }
        }
        if !new_info.signed_xml.is_empty() {
            self.signed_xml = new_info.signed_xml.clone();
            self.xml_signature = new_info.xml_signature.clone();
        }
    }
}

pub fn md5_file(path: &Path) -> io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}
