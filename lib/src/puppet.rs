//! Puppet on a remote host: modules, external facts and `puppet apply`.

use std::path::Path;

use log::{debug, info};
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::remote::{run_checked, run_ok, shell_quote, Host, Remote};

pub const MODULES: &[&str] = &[
    "puppetlabs-stdlib",
    "puppetlabs-mongodb",
    "dprince-qpid",
    "jcline-pulp",
];

pub const FACTS_PATH: &str = "/etc/facter/facts.d/facts.json";
pub const MANIFEST_PATH: &str = "/tmp/manifest.pp";

/// `--detailed-exitcodes` reports 2 when changes were applied.
const APPLY_OK: &[i32] = &[0, 2];

pub fn install_puppet<R: Remote + ?Sized>(remote: &R, host: &Host) -> Result<()> {
    run_ok(remote, host, "sudo yum -y install puppet")?;
    Ok(())
}

pub fn install_modules<R: Remote + ?Sized>(remote: &R, host: &Host, modules: &[&str]) -> Result<()> {
    for module in modules {
        run_ok(
            remote,
            host,
            &format!("sudo puppet module install --force {}", module),
        )?;
    }
    Ok(())
}

/// Write `facts` as an external facts file. Null values are left out so
/// the manifest sees them as undefined.
pub fn add_external_facts<R: Remote + ?Sized>(
    remote: &R,
    host: &Host,
    facts: &Map<String, Value>,
) -> Result<()> {
    let name = Regex::new(r"^[a-z0-9_]+$")?;
    let mut external = Map::new();
    for (key, value) in facts {
        if !name.is_match(key) {
            return Err(Error::InvalidFact(key.clone()));
        }
        if value.is_null() {
            debug!("[{}] skipping unset fact {}", host, key);
            continue;
        }
        external.insert(key.clone(), value.clone());
    }

    let staged = format!("{}/facts.json", host.home());
    remote.write(host, &staged, &serde_json::to_vec_pretty(&external)?)?;
    run_ok(remote, host, "sudo mkdir -p /etc/facter/facts.d")?;
    run_ok(remote, host, &format!("sudo mv {} {}", shell_quote(&staged), FACTS_PATH))?;
    Ok(())
}

pub fn apply_manifest<R: Remote + ?Sized>(remote: &R, host: &Host, manifest: &Path) -> Result<()> {
    info!("[{}] applying {}", host, manifest.display());
    remote.upload(host, manifest, MANIFEST_PATH)?;
    run_checked(
        remote,
        host,
        &format!("sudo puppet apply --verbose --detailed-exitcodes {}", MANIFEST_PATH),
        APPLY_OK,
    )?;
    Ok(())
}
