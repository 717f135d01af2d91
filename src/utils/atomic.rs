//! Atomic file operations
//!
//! Persisted streams and the registration table are rewritten as a whole,
//! so every save goes through the temp-file pattern:
//!
//! 1. Write to a temporary file (.tmp)
//! 2. Call sync_all() to flush to disk
//! 3. Rename temp file to final path (atomic on most filesystems)
//!
//! The final file is therefore either the old version or the new one,
//! never a partial write.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::HistorianResult;

/// Atomically write content using a writer function
///
/// # Example
///
/// ```ignore
/// atomic_write_with("data/registrations.jsonl", |file| {
///     writeln!(file, "line1")?;
///     Ok(())
/// })?;
/// ```
pub fn atomic_write_with<P, F>(path: P, write_fn: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let path = path.as_ref();
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = File::create(&temp_path)?;
    write_fn(&mut file)?;
    file.sync_all()?;

    fs::rename(&temp_path, path)?;

    Ok(())
}

/// Atomically replace `path` with one JSON line per record
pub fn write_jsonl<P, T>(path: P, records: &[T]) -> HistorianResult<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let mut lines = Vec::with_capacity(records.len());
    for record in records {
        lines.push(serde_json::to_string(record)?);
    }

    atomic_write_with(path, |file| {
        for line in &lines {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    })?;

    Ok(())
}

/// Read a JSONL file, skipping blank lines
///
/// A missing file reads as empty. Lines that fail to parse are logged and
/// skipped so one bad record doesn't take down the whole load.
pub fn read_jsonl<P, T>(path: P) -> HistorianResult<Vec<T>>
where
    P: AsRef<Path>,
    T: DeserializeOwned,
{
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = line_num + 1,
                error = %e,
                "Skipping unreadable record"
            ),
        }
    }

    Ok(records)
}

/// Clean up leftover temp files from interrupted saves
///
/// Called on startup for every persistence directory.
pub fn cleanup_temp_files<P: AsRef<Path>>(dir: P) -> io::Result<usize> {
    let dir = dir.as_ref();
    let mut cleaned = 0;

    if !dir.exists() {
        return Ok(0);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.extension().map(|e| e == "tmp").unwrap_or(false) {
            fs::remove_file(&path)?;
            cleaned += 1;
        }
    }

    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
    }

    #[test]
    fn test_atomic_write_with() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.txt");

        atomic_write_with(&path, |file| {
            writeln!(file, "Line 1")?;
            writeln!(file, "Line 2")?;
            Ok(())
        })
        .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "Line 1\nLine 2\n");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_jsonl_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("rows.jsonl");

        write_jsonl(&path, &[Row { id: 1 }, Row { id: 2 }]).unwrap();
        let rows: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { id: 1 }, Row { id: 2 }]);
    }

    #[test]
    fn test_read_jsonl_skips_bad_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rows.jsonl");
        fs::write(&path, "{\"id\":1}\nnot json\n\n{\"id\":3}\n").unwrap();

        let rows: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { id: 1 }, Row { id: 3 }]);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let temp_dir = TempDir::new().unwrap();
        let rows: Vec<Row> = read_jsonl(temp_dir.path().join("absent.jsonl")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_cleanup_temp_files() {
        let temp_dir = TempDir::new().unwrap();

        fs::write(temp_dir.path().join("file1.tmp"), "temp1").unwrap();
        fs::write(temp_dir.path().join("file2.tmp"), "temp2").unwrap();
        fs::write(temp_dir.path().join("keep.jsonl"), "keep").unwrap();

        let cleaned = cleanup_temp_files(temp_dir.path()).unwrap();
        assert_eq!(cleaned, 2);
        assert!(temp_dir.path().join("keep.jsonl").exists());
    }
}
