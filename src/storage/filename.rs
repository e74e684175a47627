//! File naming for the data directory
//!
//! Every file except `CURRENT` and `LOCK` carries a number drawn from one
//! shared, monotonically increasing counter.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// Kind of file found in a data directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Journal,
    Table,
    Manifest,
    Current,
    Lock,
    Temp,
}

pub fn journal_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.log", number))
}

pub fn table_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", number))
}

pub fn manifest_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{:06}", number))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub fn temp_file_name(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.dbtmp", number))
}

/// Classify a file name
///
/// "000042.sst" → Some((Table, 42)), "CURRENT" → Some((Current, 0))
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    match name {
        "CURRENT" => return Some((FileType::Current, 0)),
        "LOCK" => return Some((FileType::Lock, 0)),
        _ => {}
    }

    if let Some(number) = name.strip_prefix("MANIFEST-") {
        return parse_number(number).map(|n| (FileType::Manifest, n));
    }

    let (stem, ext) = name.split_once('.')?;
    let number = parse_number(stem)?;
    let kind = match ext {
        "log" => FileType::Journal,
        "sst" => FileType::Table,
        "dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((kind, number))
}

fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Point `CURRENT` at `MANIFEST-{number}`
///
/// Written to a temp file, synced, then renamed over `CURRENT`.
pub fn set_current_file(dir: &Path, manifest_number: u64) -> Result<()> {
    let manifest = manifest_file_name(dir, manifest_number);
    let name = manifest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StrataError::InvalidArgument(format!("bad manifest path {:?}", manifest)))?;

    let tmp = temp_file_name(dir, manifest_number);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(name.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, current_file_name(dir)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read the manifest file name recorded in `CURRENT`
///
/// Returns `Ok(None)` when `CURRENT` does not exist.
pub fn read_current_file(dir: &Path) -> Result<Option<PathBuf>> {
    let contents = match fs::read_to_string(current_file_name(dir)) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let name = contents.trim_end_matches('\n');
    match parse_file_name(name) {
        Some((FileType::Manifest, _)) => Ok(Some(dir.join(name))),
        _ => Err(StrataError::Corruption(format!(
            "CURRENT names an invalid manifest: {:?}",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(parse_file_name("000042.sst"), Some((FileType::Table, 42)));
        assert_eq!(parse_file_name("000007.log"), Some((FileType::Journal, 7)));
        assert_eq!(
            parse_file_name("MANIFEST-000003"),
            Some((FileType::Manifest, 3))
        );
        assert_eq!(parse_file_name("CURRENT"), Some((FileType::Current, 0)));
        assert_eq!(parse_file_name("LOCK"), Some((FileType::Lock, 0)));
        assert_eq!(parse_file_name("000009.dbtmp"), Some((FileType::Temp, 9)));
    }

    #[test]
    fn test_rejects_foreign_names() {
        assert_eq!(parse_file_name("notes.txt"), None);
        assert_eq!(parse_file_name("abc.sst"), None);
        assert_eq!(parse_file_name("000001.sst.bad"), None);
        assert_eq!(parse_file_name("MANIFEST-"), None);
    }

    #[test]
    fn test_current_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_current_file(dir.path()).unwrap(), None);

        set_current_file(dir.path(), 12).unwrap();
        assert_eq!(
            read_current_file(dir.path()).unwrap(),
            Some(manifest_file_name(dir.path(), 12))
        );
    }
}
