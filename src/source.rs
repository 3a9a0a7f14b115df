//! Video sources.
//!
//! A [`VideoSource`] is either a local file or a URL. Remote sources go
//! through a [`RemoteFetcher`] that validates availability, reports the
//! host's stable video id, and downloads the file into a scratch directory.
//! [`YtDlpFetcher`] implements this with an oEmbed availability check and
//! the `yt-dlp` executable.

use std::{
    ffi::OsStr,
    fmt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use serde::Deserialize;

use crate::error::CrowdscanError;

/// Message for sources that fail the embeddability check.
pub const NOT_EMBEDDABLE: &str = "Video is not embeddable or unavailable.";
/// Message for sources whose metadata could not be fetched at all.
pub const UNAVAILABLE: &str = "Video unavailable.";
/// Message for sources whose metadata came back without an id.
pub const RESTRICTED: &str = "Video unavailable, private, or restricted.";
/// Message for live sources.
pub const LIVE_NOT_SUPPORTED: &str = "Live streams are not supported.";

/// Where a video comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    /// A file on the local filesystem.
    Local(PathBuf),
    /// A URL handled by a [`RemoteFetcher`].
    Remote(String),
}

impl VideoSource {
    /// Classify a command-line argument: `http://` and `https://` URLs are
    /// remote, anything else is a path.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            VideoSource::Remote(trimmed.to_string())
        } else {
            VideoSource::Local(PathBuf::from(input))
        }
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoSource::Local(path) => write!(f, "{}", path.display()),
            VideoSource::Remote(url) => f.write_str(url),
        }
    }
}

/// What a remote host reports about a video before download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVideo {
    /// Stable id assigned by the host.
    pub id: String,
    /// Whether the video is a live stream.
    pub is_live: bool,
    /// Title, if reported.
    pub title: Option<String>,
}

/// Validation and download of remote videos.
pub trait RemoteFetcher: Send + Sync {
    /// Check that `url` can be analysed and return its metadata.
    ///
    /// Rejections are [`CrowdscanError::SourceRejected`] carrying a
    /// user-facing message.
    fn probe(&self, url: &str) -> Result<RemoteVideo, CrowdscanError>;

    /// Download `url` into `directory` and return the file path.
    fn download(&self, url: &str, directory: &Path) -> Result<PathBuf, CrowdscanError>;
}

/// Subset of `yt-dlp --dump-single-json` output.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    title: Option<String>,
}

/// [`RemoteFetcher`] backed by an oEmbed endpoint and `yt-dlp`.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    agent: ureq::Agent,
    program: PathBuf,
    format: String,
}

impl Default for YtDlpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpFetcher {
    /// Default oEmbed endpoint.
    pub const DEFAULT_OEMBED_ENDPOINT: &'static str = "https://www.youtube.com/oembed";

    /// Default `yt-dlp` format selector.
    pub const DEFAULT_FORMAT: &'static str = "best[ext=mp4]/best";

    /// Create a fetcher using `yt-dlp` from `PATH`.
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(15))
                .build(),
            program: PathBuf::from("yt-dlp"),
            format: Self::DEFAULT_FORMAT.to_string(),
        }
    }

    /// Use a specific `yt-dlp` executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn check_embeddable(&self, url: &str) -> Result<(), CrowdscanError> {
        match self
            .agent
            .get(Self::DEFAULT_OEMBED_ENDPOINT)
            .query("url", url)
            .query("format", "json")
            .call()
        {
            Ok(response) if response.status() == 200 => Ok(()),
            Ok(response) => {
                log::info!("oEmbed returned HTTP {} for {url}", response.status());
                Err(CrowdscanError::SourceRejected(NOT_EMBEDDABLE.to_string()))
            }
            Err(ureq::Error::Status(code, _)) => {
                log::info!("oEmbed returned HTTP {code} for {url}");
                Err(CrowdscanError::SourceRejected(NOT_EMBEDDABLE.to_string()))
            }
            Err(ureq::Error::Transport(transport)) => {
                log::warn!("oEmbed request for {url} failed: {transport}");
                Err(CrowdscanError::SourceRejected(UNAVAILABLE.to_string()))
            }
        }
    }

    fn resolve_program(&self) -> Result<PathBuf, CrowdscanError> {
        which::which(&self.program).map_err(|_| CrowdscanError::YtDlpNotFound)
    }

    fn run<I, S>(&self, args: I) -> Result<Vec<u8>, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = self.resolve_program().map_err(|error| error.to_string())?;
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|error| error.to_string())?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::debug!("yt-dlp stderr: {stderr}");
            Err(stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("yt-dlp exited with an error")
                .to_string())
        }
    }
}

impl RemoteFetcher for YtDlpFetcher {
    fn probe(&self, url: &str) -> Result<RemoteVideo, CrowdscanError> {
        self.check_embeddable(url)?;
        self.resolve_program()?;

        let stdout = self
            .run(["--dump-single-json", "--no-warnings", "--skip-download", url])
            .map_err(|message| {
                log::warn!("yt-dlp metadata for {url} failed: {message}");
                CrowdscanError::SourceRejected(UNAVAILABLE.to_string())
            })?;

        let info: YtDlpInfo = serde_json::from_slice(&stdout).map_err(|error| {
            log::warn!("Unparseable yt-dlp metadata for {url}: {error}");
            CrowdscanError::SourceRejected(UNAVAILABLE.to_string())
        })?;

        let id = info
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| CrowdscanError::SourceRejected(RESTRICTED.to_string()))?;

        Ok(RemoteVideo {
            id,
            is_live: info.is_live.unwrap_or(false),
            title: info.title,
        })
    }

    fn download(&self, url: &str, directory: &Path) -> Result<PathBuf, CrowdscanError> {
        self.resolve_program()?;
        let template = directory.join("%(id)s.%(ext)s");
        log::info!("Downloading {url} into {}", directory.display());

        let stdout = self
            .run([
                OsStr::new("--quiet"),
                OsStr::new("--no-warnings"),
                OsStr::new("--no-progress"),
                OsStr::new("-f"),
                OsStr::new(&self.format),
                OsStr::new("-o"),
                template.as_os_str(),
                OsStr::new("--print"),
                OsStr::new("after_move:filepath"),
                OsStr::new(url),
            ])
            .map_err(CrowdscanError::Download)?;

        let printed = String::from_utf8_lossy(&stdout);
        let path = printed
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
            .filter(|path| path.is_file())
            .or_else(|| first_file_in(directory))
            .ok_or_else(|| {
                CrowdscanError::Download("yt-dlp finished without producing a file".to_string())
            })?;

        log::debug!("Downloaded {}", path.display());
        Ok(path)
    }
}

fn first_file_in(directory: &Path) -> Option<PathBuf> {
    std::fs::read_dir(directory)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_remote_and_paths_are_local() {
        assert_eq!(
            VideoSource::parse("https://www.youtube.com/watch?v=abc"),
            VideoSource::Remote("https://www.youtube.com/watch?v=abc".to_string())
        );
        assert_eq!(
            VideoSource::parse("HTTP://example.com/v.mp4"),
            VideoSource::Remote("HTTP://example.com/v.mp4".to_string())
        );
        assert_eq!(
            VideoSource::parse("clips/crowd.mp4"),
            VideoSource::Local(PathBuf::from("clips/crowd.mp4"))
        );
    }

    #[test]
    fn yt_dlp_info_tolerates_missing_fields() {
        let info: YtDlpInfo = serde_json::from_str(r#"{"id":"abc","extra":1}"#).unwrap();
        assert_eq!(info.id.as_deref(), Some("abc"));
        assert_eq!(info.is_live, None);

        let info: YtDlpInfo = serde_json::from_str(r#"{"is_live":true}"#).unwrap();
        assert!(info.id.is_none());
        assert_eq!(info.is_live, Some(true));
    }

    #[test]
    fn missing_program_is_reported() {
        let fetcher = YtDlpFetcher::new().with_program("/nonexistent/yt-dlp-binary");
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            fetcher.download("https://example.com/v", dir.path()),
            Err(CrowdscanError::YtDlpNotFound)
        ));
    }

    #[test]
    fn first_file_finds_download() {
        let dir = tempfile::tempdir().unwrap();
        assert!(first_file_in(dir.path()).is_none());
        std::fs::write(dir.path().join("abc.mp4"), b"x").unwrap();
        assert_eq!(first_file_in(dir.path()), Some(dir.path().join("abc.mp4")));
    }
}
