//! Local filesystem locations for pagestash data and configuration.

use crate::config::Config;
use crate::{Error, Result};
use directories::{BaseDirs, ProjectDirs};
use std::fs;
use std::path::{Path, PathBuf};

/// Dot-directory used when no XDG or platform data directory is available.
const DOT_DIR: &str = ".pagestash";

/// Maximum length of a derived archive file stem.
const MAX_STEM_LEN: usize = 100;

/// Directory provider: where archives are stashed and config lives.
#[derive(Debug, Clone)]
pub struct Directories {
    root_dir: PathBuf,
    stash_dir: PathBuf,
}

impl Directories {
    /// Directories derived from the configured data root.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_root(config.paths.root.clone())
    }

    /// Directories under an explicit root; the stash directory is created.
    pub fn with_root(root_dir: PathBuf) -> Result<Self> {
        let stash_dir = root_dir.join("stash");
        fs::create_dir_all(&stash_dir)?;
        Ok(Self {
            root_dir,
            stash_dir,
        })
    }

    /// Data root directory.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Directory captured archives are written to.
    #[must_use]
    pub fn stash_dir(&self) -> &Path {
        &self.stash_dir
    }

    /// Default data root honoring overrides.
    ///
    /// `PAGESTASH_DATA_DIR` wins, then `XDG_DATA_HOME/pagestash`, then `~/.pagestash`.
    #[must_use]
    pub fn default_data_root() -> PathBuf {
        if let Some(dir) = non_empty_env("PAGESTASH_DATA_DIR") {
            return PathBuf::from(dir);
        }

        if let Some(xdg) = non_empty_env("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("pagestash");
        }

        BaseDirs::new().map_or_else(
            || PathBuf::from(DOT_DIR),
            |base| base.home_dir().join(DOT_DIR),
        )
    }

    /// Determine the default configuration directory honoring overrides.
    pub fn default_config_dir() -> Result<PathBuf> {
        if let Some(dir) = non_empty_env("PAGESTASH_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }

        if let Some(xdg) = non_empty_env("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg).join("pagestash"));
        }

        if let Some(dirs) = ProjectDirs::from("dev", "pagestash", "pagestash") {
            return Ok(dirs.config_dir().to_path_buf());
        }

        Err(Error::Configuration(
            "Failed to determine configuration directory".into(),
        ))
    }

    /// Candidate path number `attempt` for an archive named after `stem`.
    ///
    /// Attempt 0 is `<stem>.<ext>`; later attempts get `-1`, `-2`, ...
    /// suffixes. Whether a candidate is free is only decided when the archive
    /// is moved into place, so concurrent writers cannot claim the same name.
    #[must_use]
    pub fn archive_candidate(dir: &Path, stem: &str, extension: &str, attempt: u32) -> PathBuf {
        let stem = sanitize_file_stem(stem);
        if attempt == 0 {
            dir.join(format!("{stem}.{extension}"))
        } else {
            dir.join(format!("{stem}-{attempt}.{extension}"))
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Reduce a title or URL to a safe file stem.
///
/// Only `[A-Za-z0-9._-]` survive; everything else becomes `_`. `..` sequences
/// are collapsed so the result can never climb out of its directory.
#[must_use]
pub fn sanitize_file_stem(name: &str) -> String {
    let mut sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect();

    while sanitized.contains("..") {
        sanitized = sanitized.replace("..", "_");
    }

    let sanitized = sanitized.trim_matches('.').to_string();
    if sanitized.is_empty() {
        "capture".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(
            sanitize_file_stem("UK unveils new fighter jet - BBC News"),
            "UK_unveils_new_fighter_jet_-_BBC_News"
        );
        assert_eq!(sanitize_file_stem("../../etc/passwd"), "____etc_passwd");
        assert_eq!(sanitize_file_stem("   "), "capture");
        assert_eq!(sanitize_file_stem(&"x".repeat(300)).len(), MAX_STEM_LEN);
    }

    #[test]
    fn test_with_root_creates_stash_dir() {
        let temp = TempDir::new().unwrap();
        let dirs = Directories::with_root(temp.path().join("data")).unwrap();
        assert!(dirs.stash_dir().is_dir());
        assert_eq!(dirs.root_dir(), temp.path().join("data"));
    }

    #[test]
    fn test_archive_candidates_are_suffixed() {
        let dir = Path::new("/stash");
        assert_eq!(
            Directories::archive_candidate(dir, "Example Page", "pgz", 0),
            dir.join("Example_Page.pgz")
        );
        assert_eq!(
            Directories::archive_candidate(dir, "Example Page", "pgz", 2),
            dir.join("Example_Page-2.pgz")
        );
    }
}
