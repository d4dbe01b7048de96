//! Durable election meta: current term, votes, root credential
//!
//! `term.data` and `vote.data` are append-only line files where the last
//! line wins; appending keeps every historical value so a torn write can
//! never lose the previous one. `root.data` is a single
//! `<username>\t<passwd>` record read once at startup.

use crate::common::Result;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const TERM_FILE_NAME: &str = "term.data";
const VOTE_FILE_NAME: &str = "vote.data";
const ROOT_FILE_NAME: &str = "root.data";

pub struct Meta {
    data_dir: PathBuf,
    term_file: File,
    vote_file: File,
}

impl Meta {
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Meta> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let term_file = append_handle(&data_dir.join(TERM_FILE_NAME))?;
        let vote_file = append_handle(&data_dir.join(VOTE_FILE_NAME))?;
        Ok(Meta {
            data_dir,
            term_file,
            vote_file,
        })
    }

    /// Latest persisted term; 0 when none was ever written
    pub fn read_current_term(&self) -> Result<i64> {
        let mut current = 0;
        for line in read_lines(&self.data_dir.join(TERM_FILE_NAME))? {
            if let Ok(term) = line.trim().parse::<i64>() {
                current = term;
            }
        }
        Ok(current)
    }

    /// Latest persisted vote, as `term -> candidate`
    pub fn read_voted_for(&self) -> Result<HashMap<i64, String>> {
        let mut last: Option<(i64, String)> = None;
        for line in read_lines(&self.data_dir.join(VOTE_FILE_NAME))? {
            let mut parts = line.split_whitespace();
            if let (Some(term), Some(candidate)) = (parts.next(), parts.next()) {
                if let Ok(term) = term.parse::<i64>() {
                    last = Some((term, candidate.to_string()));
                }
            }
        }
        let mut voted_for = HashMap::new();
        if let Some((term, candidate)) = last {
            tracing::info!(term, candidate = %candidate, "recovered last vote");
            voted_for.insert(term, candidate);
        }
        Ok(voted_for)
    }

    /// Root credential record, if present
    pub fn read_root(&self) -> Result<Option<(String, String)>> {
        let path = self.data_dir.join(ROOT_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        for line in read_lines(&path)? {
            if let Some((username, passwd)) = line.trim_end().split_once('\t') {
                return Ok(Some((username.to_string(), passwd.to_string())));
            }
        }
        Ok(None)
    }

    /// Persist the current term. Any failure here is fatal to the caller.
    pub fn write_current_term(&mut self, term: i64) -> Result<()> {
        writeln!(self.term_file, "{}", term)?;
        self.term_file.flush()?;
        Ok(())
    }

    /// Persist a vote grant before replying to the candidate
    pub fn write_voted_for(&mut self, term: i64, candidate: &str) -> Result<()> {
        writeln!(self.vote_file, "{} {}", term, candidate)?;
        self.vote_file.flush()?;
        Ok(())
    }
}

fn append_handle(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content.lines().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_latest_term_wins() {
        let dir = tempdir().unwrap();
        let mut meta = Meta::open(dir.path()).unwrap();
        assert_eq!(meta.read_current_term().unwrap(), 0);

        meta.write_current_term(3).unwrap();
        meta.write_current_term(7).unwrap();
        assert_eq!(meta.read_current_term().unwrap(), 7);

        // survives reopen
        drop(meta);
        let meta = Meta::open(dir.path()).unwrap();
        assert_eq!(meta.read_current_term().unwrap(), 7);
    }

    #[test]
    fn test_latest_vote_wins() {
        let dir = tempdir().unwrap();
        let mut meta = Meta::open(dir.path()).unwrap();
        assert!(meta.read_voted_for().unwrap().is_empty());

        meta.write_voted_for(2, "127.0.0.1:8868").unwrap();
        meta.write_voted_for(3, "127.0.0.1:8869").unwrap();
        let voted = meta.read_voted_for().unwrap();
        assert_eq!(voted.len(), 1);
        assert_eq!(voted.get(&3).map(String::as_str), Some("127.0.0.1:8869"));
    }

    #[test]
    fn test_root_record() {
        let dir = tempdir().unwrap();
        let meta = Meta::open(dir.path()).unwrap();
        assert!(meta.read_root().unwrap().is_none());

        std::fs::write(dir.path().join("root.data"), "root\tsecret\n").unwrap();
        let root = meta.read_root().unwrap();
        assert_eq!(root, Some(("root".to_string(), "secret".to_string())));
    }
}
