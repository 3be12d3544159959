use assert_cmd::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::{fs, io};

const CREDENTIALS: &[&str] = &[
    "OS_USERNAME",
    "OS_PASSWORD",
    "OS_TENANT_ID",
    "OS_TENANT_NAME",
    "OS_AUTH_URL",
];

pub fn deploy_env_cmd() -> Result<Command, assert_cmd::cargo::CargoError> {
    Command::cargo_bin("deploy-env")
}

pub fn without_credentials(mut cmd: Command) -> Command {
    for var in CREDENTIALS {
        cmd.env_remove(var);
    }
    cmd
}

/// Credentials pointing nowhere, for commands that must fail before
/// authenticating.
pub fn with_credentials(mut cmd: Command) -> Command {
    cmd.env("OS_USERNAME", "qe")
        .env("OS_PASSWORD", "secret")
        .env("OS_TENANT_NAME", "qe")
        .env("OS_AUTH_URL", "http://127.0.0.1:9/v2.0");
    cmd
}

/// Writes `contents` to `name` inside `dir`.
pub fn write(dir: &Path, name: &str, contents: &str) -> io::Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, contents)?;
    Ok(path)
}
