//! Topology description loading.
//!
//! A topology file names a tree of instances rooted at a server. Per-node
//! settings fall back to the topology-wide defaults, and the resolved tree is
//! validated before anything talks to the cloud.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use regex::Regex;
use serde::Deserialize;
use shellexpand::tilde;

use crate::error::{Error, Result};

pub const DEFAULT_FLAVOR: &str = "m1.medium";
pub const DEFAULT_SECURITY_GROUP: &str = "pulp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Consumer,
    Tester,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Consumer => write!(f, "consumer"),
            Role::Tester => write!(f, "tester"),
        }
    }
}

/// Polling and retry limits, all in seconds except `ssh_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub build: u64,
    pub poll: u64,
    pub ssh_attempts: usize,
    pub ssh_interval: u64,
    pub snapshot: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            build: 600,
            poll: 10,
            ssh_attempts: 30,
            ssh_interval: 10,
            snapshot: 1800,
        }
    }
}

impl Timeouts {
    pub fn build_ceiling(&self) -> Duration {
        Duration::from_secs(self.build)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll)
    }

    pub fn ssh_interval(&self) -> Duration {
        Duration::from_secs(self.ssh_interval)
    }

    pub fn snapshot_ceiling(&self) -> Duration {
        Duration::from_secs(self.snapshot)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTopology {
    keypair: Option<String>,
    private_key: String,
    repository: String,
    distribution: Option<String>,
    flavor: Option<String>,
    security_group: Option<String>,
    network: Option<String>,
    #[serde(default)]
    timeouts: Timeouts,
    structure: RawNode,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNode {
    #[serde(default)]
    instance_name: String,
    role: Role,
    hostname: Option<String>,
    distribution: Option<String>,
    security_group: Option<String>,
    flavor: Option<String>,
    keypair: Option<String>,
    cloud_config: Option<String>,
    puppet_manifest: Option<String>,
    #[serde(default)]
    children: Vec<RawNode>,
}

/// One fully resolved instance request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub role: Role,
    pub instance_name: String,
    pub hostname: String,
    pub distribution: String,
    pub security_group: String,
    pub flavor: String,
    pub keypair: String,
    pub cloud_config: Option<PathBuf>,
    pub puppet_manifest: Option<PathBuf>,
    pub children: Vec<NodeSpec>,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub private_key: PathBuf,
    pub repository: String,
    pub network: Option<String>,
    pub timeouts: Timeouts,
    pub structure: NodeSpec,
}

impl Topology {
    /// Read, validate and check every local file the topology refers to.
    /// Relative paths are taken relative to the topology file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading topology from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let mut topology: Topology = contents.parse()?;
        if let Some(dir) = path.parent() {
            topology.rebase(dir);
        }
        topology.check_files()?;
        Ok(topology)
    }

    pub fn check_files(&self) -> Result<()> {
        let mut files = vec![&self.private_key];
        for node in self.nodes() {
            files.extend(node.puppet_manifest.iter());
            files.extend(node.cloud_config.iter());
        }

        for file in files {
            if !file.is_file() {
                return Err(Error::MissingFile(file.display().to_string()));
            }
        }
        Ok(())
    }

    /// Check the rules every resolved tree follows before anything is built.
    /// Errors name the node, or its position when it has no name.
    pub fn validate(&self) -> Result<()> {
        let root = &self.structure;
        if root.role != Role::Server {
            return Err(invalid(
                label(&root.instance_name, "structure"),
                format!("the root node must be a server, not a {}", root.role),
            ));
        }
        let mut seen = HashSet::new();
        validate_node(root, "structure", &mut seen)
    }

    pub fn override_repository(&mut self, repository: String) {
        self.repository = repository;
    }

    /// Pre-order walk over the resolved nodes.
    pub fn nodes(&self) -> Nodes<'_> {
        self.structure.iter()
    }

    fn rebase(&mut self, dir: &Path) {
        rebase_path(&mut self.private_key, dir);
        rebase_node(&mut self.structure, dir);
    }
}

// Dot-separated RFC 1123 labels.
const HOSTNAME: &str =
    r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$";

fn validate_node(node: &NodeSpec, position: &str, seen: &mut HashSet<String>) -> Result<()> {
    let name = label(&node.instance_name, position);
    if node.instance_name.trim().is_empty() {
        return Err(invalid(name, "instance_name is required"));
    }
    if !seen.insert(node.instance_name.clone()) {
        return Err(invalid(name, "instance_name is used more than once"));
    }

    let required = [
        ("distribution", &node.distribution),
        ("keypair", &node.keypair),
        ("flavor", &node.flavor),
        ("security_group", &node.security_group),
    ];
    for (field, value) in required.iter() {
        if value.trim().is_empty() {
            return Err(invalid(name, format!("{} is empty", field)));
        }
    }

    let hostname = Regex::new(HOSTNAME)?;
    if node.hostname.len() > 253 || !hostname.is_match(&node.hostname) {
        return Err(invalid(
            name,
            format!("{:?} is not a valid hostname", node.hostname),
        ));
    }

    match node.role {
        Role::Server | Role::Consumer if node.puppet_manifest.is_none() => {
            return Err(invalid(name, format!("a {} needs a puppet_manifest", node.role)));
        }
        Role::Tester if !node.children.is_empty() => {
            return Err(invalid(name, "a tester cannot have children"));
        }
        _ => {}
    }

    for (index, child) in node.children.iter().enumerate() {
        let position = format!("{}/children[{}]", name, index);
        validate_node(child, &position, seen)?;
    }
    Ok(())
}

fn rebase_node(node: &mut NodeSpec, dir: &Path) {
    if let Some(manifest) = node.puppet_manifest.as_mut() {
        rebase_path(manifest, dir);
    }
    if let Some(cloud_config) = node.cloud_config.as_mut() {
        rebase_path(cloud_config, dir);
    }
    for child in node.children.iter_mut() {
        rebase_node(child, dir);
    }
}

fn rebase_path(path: &mut PathBuf, dir: &Path) {
    if path.is_relative() {
        *path = dir.join(&path);
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(tilde(path).to_string())
}

impl FromStr for Topology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw: RawTopology = serde_yaml::from_str(s)?;
        let topology = raw.resolve()?;
        topology.validate()?;
        Ok(topology)
    }
}

struct Defaults<'a> {
    keypair: Option<&'a str>,
    distribution: Option<&'a str>,
    flavor: &'a str,
    security_group: &'a str,
}

impl RawTopology {
    fn resolve(self) -> Result<Topology> {
        let defaults = Defaults {
            keypair: self.keypair.as_deref(),
            distribution: self.distribution.as_deref(),
            flavor: self.flavor.as_deref().unwrap_or(DEFAULT_FLAVOR),
            security_group: self
                .security_group
                .as_deref()
                .unwrap_or(DEFAULT_SECURITY_GROUP),
        };
        let structure = self.structure.resolve("structure", &defaults)?;

        Ok(Topology {
            private_key: expand(&self.private_key),
            repository: self.repository,
            network: self.network,
            timeouts: self.timeouts,
            structure,
        })
    }
}

impl RawNode {
    fn resolve(self, position: &str, defaults: &Defaults) -> Result<NodeSpec> {
        let RawNode {
            instance_name,
            role,
            hostname,
            distribution,
            security_group,
            flavor,
            keypair,
            cloud_config,
            puppet_manifest,
            children,
        } = self;
        let name = label(&instance_name, position);

        let distribution = distribution
            .or_else(|| defaults.distribution.map(String::from))
            .ok_or_else(|| invalid(name.clone(), "no distribution given"))?;
        let keypair = keypair
            .or_else(|| defaults.keypair.map(String::from))
            .ok_or_else(|| invalid(name.clone(), "no keypair given"))?;

        let mut resolved = Vec::with_capacity(children.len());
        for (index, child) in children.into_iter().enumerate() {
            let position = format!("{}/children[{}]", name, index);
            resolved.push(child.resolve(&position, defaults)?);
        }

        Ok(NodeSpec {
            role,
            hostname: hostname.unwrap_or_else(|| instance_name.clone()),
            instance_name,
            distribution,
            security_group: security_group.unwrap_or_else(|| defaults.security_group.to_string()),
            flavor: flavor.unwrap_or_else(|| defaults.flavor.to_string()),
            keypair,
            cloud_config: cloud_config.as_deref().map(expand),
            puppet_manifest: puppet_manifest.as_deref().map(expand),
            children: resolved,
        })
    }
}

fn label(name: &str, position: &str) -> String {
    if name.trim().is_empty() {
        position.to_string()
    } else {
        name.to_string()
    }
}

fn invalid<R: Into<String>>(node: String, reason: R) -> Error {
    Error::InvalidTopology {
        node,
        reason: reason.into(),
    }
}

impl NodeSpec {
    pub fn iter(&self) -> Nodes<'_> {
        Nodes { stack: vec![self] }
    }
}

pub struct Nodes<'a> {
    stack: Vec<&'a NodeSpec>,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a NodeSpec;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TOPOLOGY: &str = r#"
keypair: qe-key
private_key: /keys/qe.pem
repository: http://repos.example.com/pulp/2.4/
distribution: fc20
structure:
  instance_name: pulp-server
  role: server
  puppet_manifest: server.pp
  children:
    - instance_name: pulp-consumer
      role: consumer
      distribution: el6
      flavor: m1.small
      puppet_manifest: consumer.pp
      children:
        - instance_name: pulp-tester
          role: tester
          hostname: tester
    - instance_name: pulp-node
      role: server
      puppet_manifest: node.pp
"#;

    fn expect_invalid(yaml: &str) -> (String, String) {
        match yaml.parse::<Topology>() {
            Err(Error::InvalidTopology { node, reason }) => (node, reason),
            other => panic!("expected an invalid topology, got {:?}", other),
        }
    }

    #[test]
    fn nodes_inherit_topology_defaults() {
        let topology: Topology = TOPOLOGY.parse().unwrap();
        let server = &topology.structure;

        assert_eq!(server.distribution, "fc20");
        assert_eq!(server.flavor, DEFAULT_FLAVOR);
        assert_eq!(server.security_group, DEFAULT_SECURITY_GROUP);
        assert_eq!(server.keypair, "qe-key");
        assert_eq!(server.hostname, "pulp-server");

        let consumer = &server.children[0];
        assert_eq!(consumer.distribution, "el6");
        assert_eq!(consumer.flavor, "m1.small");
        assert_eq!(consumer.children[0].hostname, "tester");
        assert_eq!(topology.timeouts, Timeouts::default());
    }

    #[test]
    fn nodes_walk_in_pre_order() {
        let topology: Topology = TOPOLOGY.parse().unwrap();
        let names: Vec<&str> = topology
            .nodes()
            .map(|node| node.instance_name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["pulp-server", "pulp-consumer", "pulp-tester", "pulp-node"]
        );
    }

    #[test]
    fn root_must_be_a_server() {
        let (node, reason) = expect_invalid(
            r#"
keypair: k
private_key: k.pem
repository: r
distribution: fc20
structure:
  instance_name: lonely
  role: consumer
  puppet_manifest: c.pp
"#,
        );
        assert_eq!(node, "lonely");
        assert!(reason.contains("root node must be a server"));
    }

    #[test]
    fn instance_names_are_unique() {
        let (node, reason) = expect_invalid(
            r#"
keypair: k
private_key: k.pem
repository: r
distribution: fc20
structure:
  instance_name: twin
  role: server
  puppet_manifest: s.pp
  children:
    - instance_name: twin
      role: tester
"#,
        );
        assert_eq!(node, "twin");
        assert!(reason.contains("more than once"));
    }

    #[test]
    fn consumers_need_a_manifest() {
        let (node, reason) = expect_invalid(
            r#"
keypair: k
private_key: k.pem
repository: r
distribution: fc20
structure:
  instance_name: s
  role: server
  puppet_manifest: s.pp
  children:
    - instance_name: c
      role: consumer
"#,
        );
        assert_eq!(node, "c");
        assert_eq!(reason, "a consumer needs a puppet_manifest");
    }

    #[test]
    fn unnamed_nodes_are_reported_by_position() {
        let (node, reason) = expect_invalid(
            r#"
keypair: k
private_key: k.pem
repository: r
distribution: fc20
structure:
  instance_name: s
  role: server
  puppet_manifest: s.pp
  children:
    - role: tester
"#,
        );
        assert_eq!(node, "s/children[0]");
        assert_eq!(reason, "instance_name is required");
    }

    #[test]
    fn distribution_is_required_somewhere() {
        let (node, reason) = expect_invalid(
            r#"
keypair: k
private_key: k.pem
repository: r
structure:
  instance_name: s
  role: server
  puppet_manifest: s.pp
"#,
        );
        assert_eq!(node, "s");
        assert_eq!(reason, "no distribution given");
    }

    #[test]
    fn testers_are_leaves() {
        let (node, _) = expect_invalid(
            r#"
keypair: k
private_key: k.pem
repository: r
distribution: fc20
structure:
  instance_name: s
  role: server
  puppet_manifest: s.pp
  children:
    - instance_name: t
      role: tester
      children:
        - instance_name: t2
          role: tester
"#,
        );
        assert_eq!(node, "t");
    }

    #[test]
    fn edited_topologies_are_validated_again() {
        let mut topology: Topology = TOPOLOGY.parse().unwrap();
        assert!(topology.validate().is_ok());

        topology.structure.children[0].flavor = " ".into();
        match topology.validate() {
            Err(Error::InvalidTopology { node, reason }) => {
                assert_eq!(node, "pulp-consumer");
                assert_eq!(reason, "flavor is empty");
            }
            other => panic!("expected an invalid topology, got {:?}", other),
        }
    }

    #[test]
    fn hostnames_must_be_plain_labels() {
        for hostname in &["pulp server", "pulp;reboot", "-pulp", "pulp.", "$(id)"] {
            let (node, reason) = expect_invalid(&format!(
                r#"
keypair: k
private_key: k.pem
repository: r
distribution: fc20
structure:
  instance_name: pulp-server
  hostname: "{}"
  role: server
  puppet_manifest: s.pp
"#,
                hostname
            ));
            assert_eq!(node, "pulp-server");
            assert!(reason.contains("is not a valid hostname"), "{}", reason);
        }
    }

    #[test]
    fn instance_names_double_as_hostnames() {
        let (_, reason) = expect_invalid(
            r#"
keypair: k
private_key: k.pem
repository: r
distribution: fc20
structure:
  instance_name: pulp_server
  role: server
  puppet_manifest: s.pp
"#,
        );
        assert_eq!(reason, r#""pulp_server" is not a valid hostname"#);

        let topology: Topology = TOPOLOGY
            .replace("hostname: tester", "hostname: tester.qe.example.com")
            .parse()
            .unwrap();
        assert_eq!(
            topology.structure.children[0].children[0].hostname,
            "tester.qe.example.com"
        );
    }

    #[test]
    fn unknown_roles_are_rejected() {
        let result = r#"
keypair: k
private_key: k.pem
repository: r
distribution: fc20
structure:
  instance_name: s
  role: database
"#
        .parse::<Topology>();
        assert!(matches!(result, Err(Error::Yaml(_))));
    }

    #[test]
    fn missing_files_are_reported() {
        let topology: Topology = TOPOLOGY.parse().unwrap();
        match topology.check_files() {
            Err(Error::MissingFile(file)) => assert_eq!(file, "/keys/qe.pem"),
            other => panic!("expected a missing file, got {:?}", other),
        }
    }

    #[test]
    fn relative_paths_follow_the_topology_file() {
        let mut topology: Topology = TOPOLOGY.parse().unwrap();
        topology.rebase(Path::new("/etc/deploy"));
        assert_eq!(topology.private_key, PathBuf::from("/keys/qe.pem"));
        assert_eq!(
            topology.structure.puppet_manifest,
            Some(PathBuf::from("/etc/deploy/server.pp"))
        );
    }
}
