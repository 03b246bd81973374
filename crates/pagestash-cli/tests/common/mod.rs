#![allow(clippy::expect_used, clippy::unwrap_used)]

use assert_cmd::Command;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a `pagestash` command isolated from the user's configuration and data.
pub fn pagestash_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("pagestash"));
    cmd.timeout(CMD_TIMEOUT);
    cmd.env("PAGESTASH_CONFIG_DIR", home.join("config"));
    cmd.env("PAGESTASH_DATA_DIR", home.join("data"));
    cmd.env_remove("PAGESTASH_CONFIG");
    cmd.env("NO_COLOR", "1");
    cmd
}

/// Write a config file with a short quiet period rooted at `home`.
#[allow(dead_code)]
pub fn write_fast_config(home: &Path) -> PathBuf {
    let path = home.join("fast.toml");
    let body = format!(
        "[capture]\nquiet_period_ms = 50\ncapture_timeout_secs = 20\n\n[paths]\nroot = {:?}\n",
        home.join("data").display().to_string()
    );
    std::fs::write(&path, body).expect("failed to write test config");
    path
}
