//! Result cache keyed by content identity.
//!
//! A completed [`Timeline`] is persisted once and served for every later
//! request with the same [`CacheKey`]. [`FileCache`] stores one CSV file
//! per key; [`MemoryCache`] keeps entries in process.
//!
//! Entries are immutable once written. Bumping the cache version opens a new
//! key namespace; old entries stay on disk untouched.

use std::{
    collections::HashMap,
    fmt,
    fs::{self, File},
    io::{BufReader, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use indexmap::IndexMap;
use tempfile::NamedTempFile;

use crate::error::CrowdscanError;
use crate::timeline::{
    CategoryCounts, FRAME_INDEX_KEY, FrameRecord, RESERVED_KEYS, TIMESTAMP_KEY, TOTAL_FRAMES_KEY,
    TOTAL_KEY, Timeline, is_reserved_key,
};

/// Key of one cache entry: `{version}_{prefix}_{identifier}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    version: String,
    prefix: String,
    identifier: String,
}

impl CacheKey {
    /// Create a key.
    pub fn new(
        version: impl Into<String>,
        prefix: impl Into<String>,
        identifier: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            prefix: prefix.into(),
            identifier: identifier.into(),
        }
    }

    /// Cache-format version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Source prefix (`yt`, `file`).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Content identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// File name of the entry.
    ///
    /// Bytes outside `[A-Za-z0-9.-]` are percent-escaped (`/` becomes
    /// `%2F`). Underscores are kept in the identifier, where they are common
    /// in video ids, and escaped in the version and prefix so the separators
    /// stay unambiguous. Distinct keys always map to distinct names.
    pub fn file_name(&self) -> String {
        let mut stem = String::with_capacity(self.identifier.len() + 16);
        escape_into(&mut stem, &self.version, false);
        stem.push('_');
        escape_into(&mut stem, &self.prefix, false);
        stem.push('_');
        escape_into(&mut stem, &self.identifier, true);
        format!("{stem}.csv")
    }
}

fn escape_into(out: &mut String, part: &str, keep_underscore: bool) {
    for byte in part.bytes() {
        let plain = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'.')
            || (keep_underscore && byte == b'_');
        if plain {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.version, self.prefix, self.identifier)
    }
}

/// Storage for completed timelines.
///
/// `load` returns `Ok(None)` on a miss. Loading the same missing key twice
/// has no side effects.
pub trait ResultCache: Send + Sync {
    /// Fetch a stored timeline.
    fn load(&self, key: &CacheKey) -> Result<Option<Timeline>, CrowdscanError>;

    /// Store a complete timeline.
    fn save(&self, key: &CacheKey, timeline: &Timeline) -> Result<(), CrowdscanError>;
}

/// One CSV file per key under a directory.
///
/// Saves write to a temporary file in the cache directory and rename it
/// into place, so readers see either the old entry, the new entry, or no
/// entry. Writers of the same key are serialised.
#[derive(Debug)]
pub struct FileCache {
    directory: PathBuf,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCache {
    /// Create a cache rooted at `directory`. The directory is created on
    /// first save.
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            directory: directory.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the file backing `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.directory.join(key.file_name())
    }

    fn writer_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut writers = lock(&self.writers);
        Arc::clone(writers.entry(name.to_string()).or_default())
    }

    /// Drop the lock for `name` once no writer holds it.
    fn release_writer(&self, name: &str) {
        let mut writers = lock(&self.writers);
        if writers
            .get(name)
            .is_some_and(|key_lock| Arc::strong_count(key_lock) == 1)
        {
            writers.remove(name);
        }
    }

    fn read_entry(path: &Path) -> Result<Timeline, CrowdscanError> {
        let file = File::open(path)?;
        let mut reader = csv::Reader::from_reader(BufReader::new(file));
        let headers = reader.headers()?.clone();

        let column = |name: &str| headers.iter().position(|header| header == name);
        let timestamp_column = column(TIMESTAMP_KEY).ok_or_else(|| {
            CrowdscanError::Cache(format!("{}: missing timestamp column", path.display()))
        })?;
        let total = column(TOTAL_KEY);
        let frame_index = column(FRAME_INDEX_KEY);
        let total_frames = column(TOTAL_FRAMES_KEY);
        let categories: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(_, name)| !is_reserved_key(name))
            .map(|(index, name)| (index, name.to_string()))
            .collect();

        let mut records = Vec::new();
        for (line, row) in reader.records().enumerate() {
            let row = row?;
            let field = |index: usize| -> Result<&str, CrowdscanError> {
                row.get(index).ok_or_else(|| {
                    CrowdscanError::Cache(format!("{}: row {line} is short", path.display()))
                })
            };
            let integer = |index: Option<usize>| -> Result<Option<u64>, CrowdscanError> {
                match index {
                    Some(index) => parse_count(field(index)?).map(Some).ok_or_else(|| {
                        CrowdscanError::Cache(format!(
                            "{}: row {line} has a non-integer count",
                            path.display()
                        ))
                    }),
                    None => Ok(None),
                }
            };

            let timestamp: f64 = field(timestamp_column)?.trim().parse().map_err(|_| {
                CrowdscanError::Cache(format!("{}: row {line} has a bad timestamp", path.display()))
            })?;

            let mut counts = IndexMap::with_capacity(categories.len());
            for (index, name) in &categories {
                counts.insert(name.clone(), integer(Some(*index))?.unwrap_or(0));
            }
            let counts = match integer(total)? {
                Some(total) => CategoryCounts::new(counts, total),
                None => CategoryCounts::summed(counts),
            };

            records.push(FrameRecord {
                timestamp,
                counts,
                frame_index: integer(frame_index)?.unwrap_or(0),
                total_frames: integer(total_frames)?.unwrap_or(0),
            });
        }

        Ok(Timeline::from_records(records))
    }

    fn write_entry(&self, path: &Path, timeline: &Timeline) -> Result<(), CrowdscanError> {
        let categories = timeline.categories();
        if let Some(name) = categories.iter().find(|name| is_reserved_key(name)) {
            return Err(CrowdscanError::Cache(format!(
                "category `{name}` collides with a column in {RESERVED_KEYS:?}"
            )));
        }

        let staging = NamedTempFile::new_in(&self.directory)?;
        {
            let mut writer = csv::Writer::from_writer(staging.as_file());

            let mut header: Vec<&str> = vec![TIMESTAMP_KEY];
            header.extend(categories.iter().map(String::as_str));
            header.extend([TOTAL_KEY, FRAME_INDEX_KEY, TOTAL_FRAMES_KEY]);
            writer.write_record(&header)?;

            for record in timeline {
                let mut row = Vec::with_capacity(header.len());
                row.push(record.timestamp.to_string());
                for name in &categories {
                    row.push(record.counts.get(name).unwrap_or(0).to_string());
                }
                row.push(record.counts.total().to_string());
                row.push(record.frame_index.to_string());
                row.push(record.total_frames.to_string());
                writer.write_record(&row)?;
            }
            writer.flush()?;
        }
        staging.as_file().sync_all()?;
        staging
            .persist(path)
            .map_err(|error| CrowdscanError::Cache(error.to_string()))?;
        Ok(())
    }
}

impl ResultCache for FileCache {
    fn load(&self, key: &CacheKey) -> Result<Option<Timeline>, CrowdscanError> {
        let path = self.path_for(key);
        let timeline = match Self::read_entry(&path) {
            Ok(timeline) => timeline,
            Err(CrowdscanError::IoError(error)) if error.kind() == ErrorKind::NotFound => {
                log::debug!("Cache miss for {key}");
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        if timeline.is_empty() {
            log::debug!("Ignoring empty cache entry {}", path.display());
            return Ok(None);
        }
        log::info!("Cache hit for {key} ({} records)", timeline.len());
        Ok(Some(timeline))
    }

    fn save(&self, key: &CacheKey, timeline: &Timeline) -> Result<(), CrowdscanError> {
        fs::create_dir_all(&self.directory)?;
        let path = self.path_for(key);

        let name = key.file_name();
        let key_lock = self.writer_lock(&name);
        let written = {
            let _guard = lock(&key_lock);
            self.write_entry(&path, timeline)
        };
        drop(key_lock);
        self.release_writer(&name);
        written?;

        log::info!("Cached {} records under {key}", timeline.len());
        Ok(())
    }
}

/// In-process cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, Timeline>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl ResultCache for MemoryCache {
    fn load(&self, key: &CacheKey) -> Result<Option<Timeline>, CrowdscanError> {
        Ok(lock(&self.entries)
            .get(key)
            .filter(|timeline| !timeline.is_empty())
            .cloned())
    }

    fn save(&self, key: &CacheKey, timeline: &Timeline) -> Result<(), CrowdscanError> {
        lock(&self.entries).insert(key.clone(), timeline.clone());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Integer counts, also accepting whole floats (`3.0`) written by other
/// tools.
fn parse_count(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<u64>() {
        return Some(value);
    }
    let value: f64 = raw.parse().ok()?;
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0).then_some(value as u64)
}
