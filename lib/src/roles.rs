//! What each role does to its instance once it is up.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value;
use serde_yaml::{Mapping, Value as Yaml};

use crate::config::{Role, Topology};
use crate::error::{Error, Result};
use crate::puppet;
use crate::remote::{run_ok, shell_quote, wait_for_ssh, Host, Remote};
use crate::topology::{fact, Configurator, Facts, Node};

pub const SERVER_CA_CERT_LOCATION: &str = "/etc/pki/pulp/ca.crt";

pub const TEST_SUITE_DEPENDENCIES: &[&str] = &[
    "gcc",
    "git",
    "m2crypto",
    "python-devel",
    "python-pip",
    "python-qpid",
];

// Fedora's gevent is too old, and setup.py has to run twice.
const INSTALL_TEST_SUITE: &str = "git clone https://github.com/RedHatQE/pulp-automation.git \
    && sudo pip install -U greenlet gevent requests \
    && cd pulp-automation && sudo python ./setup.py install && sudo python ./setup.py install";

const AUTHORIZE_ROOT_SSH: &str = "sudo cp ~/.ssh/authorized_keys /root/.ssh/authorized_keys";

const RUN_TESTS: &str = "cd pulp-automation && nosetests -vs --with-xunit";
const TEST_REPORT: &str = "pulp-automation/nosetests.xml";

pub mod key {
    pub const SERVER_HOSTNAME: &str = "server_hostname";
    pub const SERVER_IP: &str = "server_ip";
    pub const SERVER_CA_CERT: &str = "server_ca_cert";
    pub const CONSUMER_HOSTNAME: &str = "consumer_hostname";
    pub const CONSUMER_IP: &str = "consumer_ip";
    pub const TESTER_HOST_STRING: &str = "tester_host_string";
    pub const INVENTORY_PATH: &str = "inventory_path";

    pub const PULP_REPO: &str = "pulp_repo";
    pub const PULP_SERVER_CA_CERT: &str = "pulp_server_ca_cert";
    pub const EXTERNAL_PULP_SERVER: &str = "external_pulp_server";
}

fn hosts_entry(ip: &str, hostname: &str) -> String {
    format!(
        "echo '{ip}    {host} {host}.novalocal' | sudo tee -a /etc/hosts",
        ip = ip,
        host = hostname
    )
}

/// Configures nodes over a `Remote` according to their role.
pub struct RoleConfigurator<R> {
    remote: R,
    repository: String,
    private_key: PathBuf,
    ssh_attempts: usize,
    ssh_interval: Duration,
    report_dir: PathBuf,
}

impl<R: Remote> RoleConfigurator<R> {
    pub fn new(remote: R, topology: &Topology) -> Self {
        RoleConfigurator {
            remote,
            repository: topology.repository.clone(),
            private_key: topology.private_key.clone(),
            ssh_attempts: topology.timeouts.ssh_attempts,
            ssh_interval: topology.timeouts.ssh_interval(),
            report_dir: PathBuf::from("."),
        }
    }

    /// Where the xunit report is saved after a test run.
    pub fn report_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.report_dir = dir.into();
        self
    }

    async fn reachable<'a>(&self, node: &'a Node) -> Result<&'a Host> {
        let host = node.host()?;
        wait_for_ssh(&self.remote, host, self.ssh_attempts, self.ssh_interval).await?;
        Ok(host)
    }

    fn run(&self, host: &Host, command: &str) -> Result<()> {
        run_ok(&self.remote, host, command)?;
        Ok(())
    }

    async fn server(&self, node: &Node) -> Result<Facts> {
        let host = self.reachable(node).await?;
        self.run(host, &format!("sudo hostname {}", node.spec.hostname))?;
        puppet::install_modules(&self.remote, host, puppet::MODULES)?;

        // A server under another server is a child node and trusts its CA.
        let parent_ca = node
            .ancestor(Role::Server)
            .and_then(|server| server.get(key::SERVER_CA_CERT))
            .cloned()
            .unwrap_or(Value::Null);
        let mut facts = Facts::new();
        facts.insert(key::PULP_REPO.into(), self.repository.clone().into());
        facts.insert(key::PULP_SERVER_CA_CERT.into(), parent_ca);
        puppet::add_external_facts(&self.remote, host, &facts)?;
        puppet::apply_manifest(&self.remote, host, node.manifest()?)?;

        let copy = format!("{}/ca.crt", host.home());
        self.run(
            host,
            &format!(
                "sudo cp {ca} {copy} && sudo chmod 0644 {copy}",
                ca = SERVER_CA_CERT_LOCATION,
                copy = shell_quote(&copy)
            ),
        )?;
        let ca = self.remote.read(host, &copy)?;

        let mut result = Facts::new();
        result.insert(key::SERVER_HOSTNAME.into(), node.spec.hostname.clone().into());
        result.insert(key::SERVER_IP.into(), host.address.clone().into());
        result.insert(
            key::SERVER_CA_CERT.into(),
            String::from_utf8_lossy(&ca).to_string().into(),
        );
        Ok(result)
    }

    async fn consumer(&self, node: &Node) -> Result<Facts> {
        let server = server_of(node)?;
        let host = self.reachable(node).await?;

        // The test suite logs in as root.
        self.run(host, AUTHORIZE_ROOT_SSH)?;
        self.run(host, &format!("sudo hostname {}", node.spec.hostname))?;
        puppet::install_modules(&self.remote, host, puppet::MODULES)?;

        let mut facts = Facts::new();
        facts.insert(
            key::EXTERNAL_PULP_SERVER.into(),
            server.hostname.clone().into(),
        );
        facts.insert(key::PULP_REPO.into(), self.repository.clone().into());
        facts.insert(
            key::PULP_SERVER_CA_CERT.into(),
            server.ca_cert.clone().into(),
        );
        puppet::add_external_facts(&self.remote, host, &facts)?;
        puppet::apply_manifest(&self.remote, host, node.manifest()?)?;
        self.run(host, &hosts_entry(&server.ip, &server.hostname))?;

        let mut result = Facts::new();
        result.insert(key::CONSUMER_HOSTNAME.into(), node.spec.hostname.clone().into());
        result.insert(key::CONSUMER_IP.into(), host.address.clone().into());
        Ok(result)
    }

    async fn tester(&self, node: &Node) -> Result<Facts> {
        let server = server_of(node)?;
        let consumer = node.ancestor(Role::Consumer);
        let host = self.reachable(node).await?;

        for dependency in TEST_SUITE_DEPENDENCIES {
            self.run(host, &format!("sudo yum -y install {}", dependency))?;
        }
        self.run(host, INSTALL_TEST_SUITE)?;
        if let Some(manifest) = node.spec.puppet_manifest.as_deref() {
            puppet::install_puppet(&self.remote, host)?;
            puppet::apply_manifest(&self.remote, host, manifest)?;
        }

        self.run(host, &hosts_entry(&server.ip, &server.hostname))?;
        let consumer_entry = match consumer {
            Some(consumer) => {
                let hostname = fact_str(node, consumer, key::CONSUMER_HOSTNAME)?;
                let ip = fact_str(node, consumer, key::CONSUMER_IP)?;
                self.run(host, &hosts_entry(ip, hostname))?;
                Some((hostname, consumer))
            }
            None => {
                warn!("{} has no consumer ancestor", node.name());
                None
            }
        };

        let key_path = format!("{}/.ssh/id_rsa", host.home());
        self.remote.upload(host, &self.private_key, &key_path)?;
        self.run(host, &format!("chmod 600 {}", shell_quote(&key_path)))?;

        let template = self.remote.read(
            host,
            &format!("{}/pulp-automation/tests/inventory.yml", host.home()),
        )?;
        let consumer = consumer_entry.map(|(hostname, facts)| ConsumerInventory {
            hostname: hostname.to_string(),
            ssh_key: key_path.clone(),
            // The consumer's OS is what the suite tests against.
            os_name: os_fact(facts, node, fact::OS_NAME),
            os_version: os_fact(facts, node, fact::OS_VERSION),
        });
        let inventory = render_inventory(
            &String::from_utf8_lossy(&template),
            &server.hostname,
            consumer.as_ref(),
        )?;
        let inventory_path = format!("{}/pulp-automation/inventory.yml", host.home());
        self.remote
            .write(host, &inventory_path, inventory.as_bytes())?;

        let mut result = Facts::new();
        result.insert(key::TESTER_HOST_STRING.into(), host.to_string().into());
        result.insert(key::INVENTORY_PATH.into(), inventory_path.into());
        Ok(result)
    }
}

#[async_trait]
impl<R: Remote> Configurator for RoleConfigurator<R> {
    async fn configure(&self, node: &Node) -> Result<Facts> {
        match node.role() {
            Role::Server => self.server(node).await,
            Role::Consumer => self.consumer(node).await,
            Role::Tester => self.tester(node).await,
        }
    }

    async fn run_tests(&self, tester: &Node) -> Result<i32> {
        let host = tester.host()?;
        // A failing suite is still a finished run; its code is the result.
        let code = self.remote.run(host, RUN_TESTS)?.code.unwrap_or(1);

        match self.remote.read(host, TEST_REPORT) {
            Ok(report) => {
                let path = self.report_dir.join("nosetests.xml");
                tokio::fs::write(&path, report).await?;
                info!("saved test report to {}", path.display());
            }
            Err(e) => warn!("could not fetch the test report: {}", e),
        }
        Ok(code)
    }
}

struct ServerFacts {
    hostname: String,
    ip: String,
    ca_cert: Option<String>,
}

fn server_of(node: &Node) -> Result<ServerFacts> {
    let server = node.ancestor(Role::Server).ok_or_else(|| Error::InvalidTopology {
        node: node.name().to_string(),
        reason: format!("a {} needs a server ancestor", node.role()),
    })?;
    Ok(ServerFacts {
        hostname: fact_str(node, server, key::SERVER_HOSTNAME)?.to_string(),
        ip: fact_str(node, server, key::SERVER_IP)?.to_string(),
        ca_cert: server
            .get(key::SERVER_CA_CERT)
            .and_then(Value::as_str)
            .map(String::from),
    })
}

fn fact_str<'a>(node: &Node, facts: &'a Facts, key: &str) -> Result<&'a str> {
    facts
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidTopology {
            node: node.name().to_string(),
            reason: format!("parent configuration has no {}", key),
        })
}

fn os_fact(consumer: &Facts, node: &Node, key: &str) -> String {
    consumer
        .get(key)
        .and_then(Value::as_str)
        .or_else(|| node.fact(key))
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInventory {
    pub hostname: String,
    pub ssh_key: String,
    pub os_name: String,
    pub os_version: String,
}

/// Fill the test suite's inventory template. Keys already in the template
/// survive unless one of the generated values replaces them.
pub fn render_inventory(
    template: &str,
    server_hostname: &str,
    consumer: Option<&ConsumerInventory>,
) -> Result<String> {
    let mut inventory: Yaml = serde_yaml::from_str(template)?;
    let root = inventory
        .as_mapping_mut()
        .ok_or_else(|| not_a_mapping("the inventory"))?;
    let roles = section(root, "ROLES")?;

    let pulp = section(roles, "pulp")?;
    pulp.insert("url".into(), format!("https://{}/", server_hostname).into());
    pulp.insert("hostname".into(), server_hostname.into());
    let pulp = Yaml::Mapping(pulp.clone());

    let mut qpid = Mapping::new();
    qpid.insert("url".into(), server_hostname.into());
    roles.insert("qpid".into(), Yaml::Mapping(qpid));

    if let Some(consumer) = consumer {
        let key = Yaml::from("consumers");
        if !roles.contains_key(&key) {
            roles.insert(key.clone(), Yaml::Sequence(Vec::new()));
        }
        let consumers = roles
            .get_mut(&key)
            .and_then(Yaml::as_sequence_mut)
            .ok_or_else(|| not_a_mapping("ROLES.consumers"))?;
        if consumers.is_empty() {
            consumers.push(Yaml::Mapping(Mapping::new()));
        }
        let first = consumers[0]
            .as_mapping_mut()
            .ok_or_else(|| not_a_mapping("ROLES.consumers[0]"))?;

        let mut os = Mapping::new();
        os.insert("name".into(), consumer.os_name.clone().into());
        os.insert("version".into(), consumer.os_version.clone().into());

        first.insert("hostname".into(), consumer.hostname.clone().into());
        first.insert("ssh_key".into(), consumer.ssh_key.clone().into());
        first.insert("os".into(), Yaml::Mapping(os));
        first.insert("pulp".into(), pulp);
    }

    Ok(serde_yaml::to_string(&inventory)?)
}

fn section<'a>(parent: &'a mut Mapping, name: &str) -> Result<&'a mut Mapping> {
    let key = Yaml::from(name);
    if !parent.contains_key(&key) {
        parent.insert(key.clone(), Yaml::Mapping(Mapping::new()));
    }
    parent
        .get_mut(&key)
        .and_then(Yaml::as_mapping_mut)
        .ok_or_else(|| not_a_mapping(name))
}

fn not_a_mapping(what: &str) -> Error {
    Error::InvalidTopology {
        node: "inventory.yml".into(),
        reason: format!("{} has an unexpected shape", what),
    }
}
