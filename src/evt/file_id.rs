//! SeaFlow file naming: identity, date partition, and directory listing.
//!
//! Raw files live at `<cruise>/<YYYY_DDD>/<timestamp>[.gz]`; gated output
//! adds `.opp`. Two name styles exist:
//!
//! - new style: `2014-07-04T00-00-02+00-00[.evt][.opp][.gz]`
//! - old style: `100.evt[.opp][.gz]`
//!
//! `file_id` drops compression and type suffixes so a file keeps its
//! identity when recompressed or gated.

use crate::error::{AppResult, OppError};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static NEW_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<stem>(?P<y>\d{4})-(?P<mo>\d{2})-(?P<d>\d{2})T(?P<h>\d{2})-(?P<mi>\d{2})-(?P<s>\d{2})(?P<tzh>[+-]\d{2})-?(?P<tzm>\d{2}))(?P<evt>\.evt)?(?P<opp>\.opp)?(?P<gz>\.gz)?$",
    )
    .expect("Invalid new-style file name regex")
});

#[allow(clippy::expect_used)]
static OLD_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<stem>\d+\.evt)(?P<opp>\.opp)?(?P<gz>\.gz)?$")
        .expect("Invalid old-style file name regex")
});

#[allow(clippy::expect_used)]
static PARTITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}_\d{1,3}$").expect("Invalid date partition regex"));

/// Parsed identity of an EVT or OPP file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeaflowFile {
    path: PathBuf,
    stem: String,
    date_partition: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    is_opp: bool,
    is_gz: bool,
}

impl SeaflowFile {
    /// Parse a path following the SeaFlow naming convention.
    pub fn parse(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| OppError::FileName(path.display().to_string()))?;

        let (stem, timestamp, is_opp, is_gz) = if let Some(caps) = NEW_STYLE.captures(name) {
            let rfc3339 = format!(
                "{}-{}-{}T{}:{}:{}{}:{}",
                &caps["y"], &caps["mo"], &caps["d"], &caps["h"], &caps["mi"], &caps["s"],
                &caps["tzh"], &caps["tzm"]
            );
            let ts = DateTime::parse_from_rfc3339(&rfc3339)
                .map_err(|e| OppError::FileName(format!("{}: {}", path.display(), e)))?
                .with_timezone(&Utc);
            (
                caps["stem"].to_string(),
                Some(ts),
                caps.name("opp").is_some(),
                caps.name("gz").is_some(),
            )
        } else if let Some(caps) = OLD_STYLE.captures(name) {
            (
                caps["stem"].to_string(),
                None,
                caps.name("opp").is_some(),
                caps.name("gz").is_some(),
            )
        } else {
            return Err(OppError::FileName(path.display().to_string()));
        };

        let parent_partition = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .filter(|n| PARTITION.is_match(n))
            .map(str::to_string);
        let date_partition =
            parent_partition.or_else(|| timestamp.map(|t| t.format("%Y_%j").to_string()));

        Ok(Self {
            path: path.to_path_buf(),
            stem,
            date_partition,
            timestamp,
            is_opp,
            is_gz,
        })
    }

    /// Whether a path has a valid EVT or OPP file name.
    pub fn is_valid_name(path: impl AsRef<Path>) -> bool {
        Self::parse(path).is_ok()
    }

    /// Identity used as the `file` key in the database.
    pub fn file_id(&self) -> String {
        match &self.date_partition {
            Some(part) => format!("{}/{}", part, self.stem),
            None => self.stem.clone(),
        }
    }

    /// Base name without type or compression suffixes.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// `YYYY_DDD` day-of-year directory, when known.
    pub fn date_partition(&self) -> Option<&str> {
        self.date_partition.as_deref()
    }

    /// Acquisition start time encoded in a new-style name.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Path this identity was parsed from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the name carries the `.opp` suffix.
    pub fn is_opp(&self) -> bool {
        self.is_opp
    }

    /// Whether the name carries the `.gz` suffix.
    pub fn is_gz(&self) -> bool {
        self.is_gz
    }

    /// Gated output location: `<root>/<date_partition>/<stem>.opp.gz`.
    pub fn opp_output_path(&self, root: &Path) -> PathBuf {
        let dir = match &self.date_partition {
            Some(part) => root.join(part),
            None => root.to_path_buf(),
        };
        dir.join(format!("{}.opp.gz", self.stem))
    }
}

/// Recursively list EVT (or OPP, when `opp` is set) files under `dir`, sorted.
pub fn find_evt_files(dir: &Path, opp: bool) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if SeaflowFile::parse(&path).is_ok_and(|f| f.is_opp() == opp) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Expand a mix of file and directory paths into file paths.
///
/// Plain files are kept in the order given; each directory contributes its
/// EVT files followed by its OPP files.
pub fn expand_file_list(inputs: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = inputs.iter().filter(|p| p.is_file()).cloned().collect();
    for dir in inputs.iter().filter(|p| p.is_dir()) {
        files.extend(find_evt_files(dir, false)?);
        files.extend(find_evt_files(dir, true)?);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validity() {
        let cases = [
            ("testcruise/2014_185/2014-07-04T00-00-02+00-00", true),
            ("testcruise/2014_185/2014-07-04T00-03-02+00-00.gz", true),
            ("testcruise/2014_185/100.evt", true),
            ("testcruise/2014_185/100.evt.opp", true),
            ("testcruise/2014_185/100.evt.opp.gz", true),
            ("testcruise/2014_185/200.evt.gz", true),
            ("2014_185/2014-07-04T00-00-02+00-00", true),
            ("2014-07-04T00-00-02+00-00", true),
            ("2014-07-04T00-00-02+00-00.opp", true),
            ("2014-07-04T00-00-02+00-00.evt", true),
            ("not_evt_file", false),
            ("x.evt", false),
            ("testcruise/2014_185/100_1.evt", false),
            ("2014-07-0400-00-02+00-00", false),
            ("2014-07-04T00-00-02+00-00.op", false),
            ("2014-07-04T00-00-02+00-00.ev", false),
        ];
        for (name, valid) in cases {
            assert_eq!(SeaflowFile::is_valid_name(name), valid, "{name}");
        }
    }

    #[test]
    fn test_file_id_independent_of_compression() {
        let plain = SeaflowFile::parse("testcruise/2014_185/2014-07-04T00-00-02+00-00").unwrap();
        let gz = SeaflowFile::parse("testcruise/2014_185/2014-07-04T00-00-02+00-00.gz").unwrap();
        let opp = SeaflowFile::parse("out/2014_185/2014-07-04T00-00-02+00-00.opp.gz").unwrap();
        assert_eq!(plain.file_id(), "2014_185/2014-07-04T00-00-02+00-00");
        assert_eq!(plain.file_id(), gz.file_id());
        assert_eq!(plain.file_id(), opp.file_id());
        assert!(gz.is_gz());
        assert!(!gz.is_opp());
        assert!(opp.is_opp());
    }

    #[test]
    fn test_partition_from_timestamp() {
        let f = SeaflowFile::parse("2014-07-04T00-00-02+00-00").unwrap();
        assert_eq!(f.date_partition(), Some("2014_185"));
        let old = SeaflowFile::parse("loose/100.evt").unwrap();
        assert_eq!(old.date_partition(), None);
        assert_eq!(old.file_id(), "100.evt");
    }

    #[test]
    fn test_opp_output_path() {
        let f = SeaflowFile::parse("testcruise/2014_185/2014-07-04T00-03-02+00-00.gz").unwrap();
        assert_eq!(
            f.opp_output_path(Path::new("/tmp/oppdir")),
            PathBuf::from("/tmp/oppdir/2014_185/2014-07-04T00-03-02+00-00.opp.gz")
        );
    }

    #[test]
    fn test_find_and_expand() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("2014_185");
        std::fs::create_dir_all(&day).unwrap();
        for name in [
            "2014-07-04T00-03-02+00-00.gz",
            "2014-07-04T00-00-02+00-00",
            "2014-07-04T00-00-02+00-00.opp.gz",
            "notes.txt",
        ] {
            std::fs::write(day.join(name), b"").unwrap();
        }

        let evt = find_evt_files(dir.path(), false).unwrap();
        assert_eq!(
            evt,
            vec![
                day.join("2014-07-04T00-00-02+00-00"),
                day.join("2014-07-04T00-03-02+00-00.gz"),
            ]
        );
        let all = expand_file_list(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2], day.join("2014-07-04T00-00-02+00-00.opp.gz"));
    }
}
