//! The instance tree and the orchestrator that builds, configures and tears
//! it down.
//!
//! Every create request is issued before anything waits, so the cloud builds
//! the whole tree at once while a single loop polls. Configuration then walks
//! the tree root first, and each child sees its parent's merged facts under
//! `parent_config`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use tokio::time::{self, Instant};
use uuid::Uuid;

use crate::cloud::{self, Cloud, Flavor, Image, Instance, InstanceRequest, Status, META_OS_NAME, META_OS_VERSION};
use crate::config::{NodeSpec, Role, Topology};
use crate::error::{Error, Result};
use crate::remote::Host;

/// What a node knows about itself, plus what its role function returned.
pub type Facts = Map<String, Value>;

pub const PARENT_CONFIG: &str = "parent_config";

pub mod fact {
    pub const ROLE: &str = "role";
    pub const INSTANCE_NAME: &str = "instance_name";
    pub const HOSTNAME: &str = "hostname";
    pub const DISTRIBUTION: &str = "distribution";
    pub const INSTANCE_ID: &str = "instance_id";
    pub const IP: &str = "ip";
    pub const HOST_STRING: &str = "host_string";
    pub const LOGIN_USER: &str = "login_user";
    pub const OS_NAME: &str = "os_name";
    pub const OS_VERSION: &str = "os_version";
}

const DEFAULT_LOGIN_USER: &str = "root";

#[derive(Debug)]
pub struct Node {
    pub spec: NodeSpec,
    pub instance: Option<Instance>,
    pub host: Option<Host>,
    pub facts: Facts,
    pub children: Vec<Node>,
}

impl From<NodeSpec> for Node {
    fn from(mut spec: NodeSpec) -> Self {
        let children = std::mem::take(&mut spec.children)
            .into_iter()
            .map(Node::from)
            .collect();

        let mut facts = Facts::new();
        facts.insert(fact::ROLE.into(), spec.role.to_string().into());
        facts.insert(fact::INSTANCE_NAME.into(), spec.instance_name.clone().into());
        facts.insert(fact::HOSTNAME.into(), spec.hostname.clone().into());
        facts.insert(fact::DISTRIBUTION.into(), spec.distribution.clone().into());

        Node {
            spec,
            instance: None,
            host: None,
            facts,
            children,
        }
    }
}

impl Node {
    pub fn name(&self) -> &str {
        &self.spec.instance_name
    }

    pub fn role(&self) -> Role {
        self.spec.role
    }

    pub fn host(&self) -> Result<&Host> {
        self.host
            .as_ref()
            .ok_or_else(|| Error::NotBuilt(self.name().to_string()))
    }

    pub fn manifest(&self) -> Result<&Path> {
        self.spec
            .puppet_manifest
            .as_deref()
            .ok_or_else(|| Error::InvalidTopology {
                node: self.name().to_string(),
                reason: format!("a {} needs a puppet_manifest", self.role()),
            })
    }

    pub fn fact(&self, key: &str) -> Option<&str> {
        self.facts.get(key).and_then(Value::as_str)
    }

    /// The nearest ancestor with `role`, found through `parent_config`.
    pub fn ancestor(&self, role: Role) -> Option<&Facts> {
        ancestor(&self.facts, role)
    }

    pub fn iter(&self) -> Nodes<'_> {
        Nodes { stack: vec![self] }
    }

    fn visit_mut<F: FnMut(&mut Node)>(&mut self, f: &mut F) {
        f(self);
        for child in self.children.iter_mut() {
            child.visit_mut(f);
        }
    }
}

pub fn ancestor(facts: &Facts, role: Role) -> Option<&Facts> {
    let role = role.to_string();
    let mut current = facts.get(PARENT_CONFIG)?.as_object()?;
    loop {
        if current.get(fact::ROLE).and_then(Value::as_str) == Some(role.as_str()) {
            return Some(current);
        }
        current = current.get(PARENT_CONFIG)?.as_object()?;
    }
}

pub struct Nodes<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Role configuration and the test run that follows it.
#[async_trait]
pub trait Configurator: Send + Sync {
    /// Configure one built node. The returned facts are merged into the node.
    async fn configure(&self, node: &Node) -> Result<Facts>;

    /// Run the integration suite on the tester and return its exit code.
    async fn run_tests(&self, tester: &Node) -> Result<i32>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployOptions {
    pub run_tests: bool,
    pub no_teardown: bool,
    pub setup_only: bool,
}

#[derive(Debug, Default)]
pub struct Teardown {
    pub deleted: usize,
    pub failures: Vec<(String, Error)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub instance_name: String,
    pub role: Role,
    pub ip: Option<String>,
    pub host_string: Option<String>,
}

#[derive(Debug)]
pub struct Outcome {
    pub test_code: Option<i32>,
    pub nodes: Vec<NodeSummary>,
    pub teardown: Option<Teardown>,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        self.test_code.unwrap_or(0)
    }
}

pub struct Orchestrator<C, K> {
    cloud: C,
    configurator: K,
}

impl<C: Cloud, K: Configurator> Orchestrator<C, K> {
    pub fn new(cloud: C, configurator: K) -> Self {
        Orchestrator {
            cloud,
            configurator,
        }
    }

    pub fn cloud(&self) -> &C {
        &self.cloud
    }

    /// Build, configure and optionally test `topology`. Teardown runs whatever
    /// happens unless the options keep the instances around.
    pub async fn deploy(&self, topology: &Topology, options: &DeployOptions) -> Result<Outcome> {
        let mut root = Node::from(topology.structure.clone());
        let result = self.setup_and_test(topology, &mut root, options).await;

        let keep = options.no_teardown || (options.setup_only && result.is_ok());
        let teardown = if keep {
            for node in root.iter().filter(|node| node.instance.is_some()) {
                warn!(
                    "leaving {} running at {}",
                    node.name(),
                    node.fact(fact::HOST_STRING).unwrap_or("an unknown address")
                );
            }
            None
        } else {
            Some(self.teardown(&mut root).await)
        };

        let test_code = result?;
        Ok(Outcome {
            test_code,
            nodes: summarize(&root),
            teardown,
        })
    }

    async fn setup_and_test(
        &self,
        topology: &Topology,
        root: &mut Node,
        options: &DeployOptions,
    ) -> Result<Option<i32>> {
        self.build(topology, root).await?;
        self.configure(root).await?;

        if options.run_tests && !options.setup_only {
            let code = self.run_tests(root).await?;
            Ok(Some(code))
        } else {
            Ok(None)
        }
    }

    pub async fn build(&self, topology: &Topology, root: &mut Node) -> Result<()> {
        let images = self.resolve_images(root).await?;
        let flavors = self.resolve_flavors(root).await?;

        let mut requests = Vec::new();
        for node in root.iter() {
            requests.push(request(node, &images, &flavors).await?);
        }

        let mut created = HashMap::new();
        let issued = self.issue(&requests, &mut created).await;
        root.visit_mut(&mut |node| {
            if let Some(instance) = created.remove(node.name()) {
                node.instance = Some(instance);
            }
        });
        issued?;

        self.wait_for_build(root, topology).await?;

        root.visit_mut(&mut |node| {
            if let Some(image) = images.get(&node.spec.distribution) {
                record_build(node, image, topology);
            }
        });
        for node in root.iter() {
            if node.host.is_none() {
                return Err(Error::NoAddress(node.name().to_string()));
            }
        }
        Ok(())
    }

    async fn resolve_images(&self, root: &Node) -> Result<HashMap<String, Image>> {
        let available = self.cloud.list_images().await?;
        let mut images = HashMap::new();
        for node in root.iter() {
            let distribution = &node.spec.distribution;
            if images.contains_key(distribution) {
                continue;
            }
            let image = cloud::newest(&available, distribution)
                .ok_or_else(|| Error::NoImage(distribution.clone()))?;
            debug!("distribution {} is image {} ({})", distribution, image.name, image.id);
            images.insert(distribution.clone(), image.clone());
        }
        Ok(images)
    }

    async fn resolve_flavors(&self, root: &Node) -> Result<HashMap<String, Flavor>> {
        let mut flavors = HashMap::new();
        for node in root.iter() {
            if !flavors.contains_key(&node.spec.flavor) {
                let flavor = self.cloud.find_flavor(&node.spec.flavor).await?;
                flavors.insert(node.spec.flavor.clone(), flavor);
            }
        }
        Ok(flavors)
    }

    async fn issue(
        &self,
        requests: &[InstanceRequest],
        created: &mut HashMap<String, Instance>,
    ) -> Result<()> {
        for request in requests {
            info!("creating instance {}", request.name);
            let instance = self.cloud.create_instance(request).await?;
            created.insert(request.name.clone(), instance);
        }
        Ok(())
    }

    async fn wait_for_build(&self, root: &mut Node, topology: &Topology) -> Result<()> {
        let timeouts = &topology.timeouts;
        let started = Instant::now();

        loop {
            for node in root.iter() {
                if let Some(instance) = &node.instance {
                    match &instance.status {
                        Status::Build | Status::Active => {}
                        status => {
                            return Err(Error::BuildFailed {
                                instance: node.name().to_string(),
                                status: status.to_string(),
                            })
                        }
                    }
                }
            }

            let pending: Vec<(String, Uuid)> = root
                .iter()
                .filter_map(|node| {
                    node.instance
                        .as_ref()
                        .filter(|instance| instance.status == Status::Build)
                        .map(|instance| (node.name().to_string(), instance.id))
                })
                .collect();
            if pending.is_empty() {
                info!("all instances are active");
                return Ok(());
            }
            if started.elapsed() >= timeouts.build_ceiling() {
                return Err(Error::BuildTimeout {
                    pending: pending.into_iter().map(|(name, _)| name).collect(),
                    secs: timeouts.build,
                });
            }

            debug!("{} instance(s) still building", pending.len());
            time::sleep(timeouts.poll_interval()).await;

            let mut refreshed = HashMap::new();
            for (_, id) in pending {
                let instance = self.cloud.get_instance(id).await?;
                refreshed.insert(id, instance);
            }
            root.visit_mut(&mut |node| {
                if let Some(instance) = node.instance.as_mut() {
                    if let Some(fresh) = refreshed.remove(&instance.id) {
                        *instance = fresh;
                    }
                }
            });
        }
    }

    /// Pre-order: a child is configured only after its parent's facts are in.
    pub async fn configure(&self, root: &mut Node) -> Result<()> {
        self.configure_node(root, None).await
    }

    fn configure_node<'a>(
        &'a self,
        node: &'a mut Node,
        parent: Option<&'a Facts>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if let Some(parent) = parent {
                node.facts
                    .insert(PARENT_CONFIG.into(), Value::Object(parent.clone()));
            }

            info!("configuring {} as a {}", node.name(), node.role());
            let result = self
                .configurator
                .configure(node)
                .await
                .map_err(|e| Error::Configure {
                    node: node.name().to_string(),
                    source: Box::new(e),
                })?;
            node.facts.extend(result);

            let facts = &node.facts;
            for child in node.children.iter_mut() {
                self.configure_node(child, Some(facts)).await?;
            }
            Ok(())
        }
        .boxed()
    }

    pub async fn run_tests(&self, root: &Node) -> Result<i32> {
        let tester = root
            .iter()
            .find(|node| node.role() == Role::Tester)
            .ok_or(Error::NoTester)?;
        info!("running tests on {}", tester.name());
        let code = self.configurator.run_tests(tester).await?;
        info!("tests exited with {}", code);
        Ok(code)
    }

    /// Delete every instance that was created. Failures are collected, not
    /// raised, so one bad delete does not leak the rest.
    pub async fn teardown(&self, root: &mut Node) -> Teardown {
        let mut handles = Vec::new();
        root.visit_mut(&mut |node| {
            if let Some(instance) = node.instance.take() {
                handles.push((node.name().to_string(), instance.id));
            }
        });

        let mut teardown = Teardown::default();
        for (name, id) in handles {
            info!("deleting instance {} ({})", name, id);
            match self.cloud.delete_instance(id).await {
                Ok(()) => teardown.deleted += 1,
                Err(e) => {
                    error!("failed to delete {}: {}", name, e);
                    teardown.failures.push((name, e));
                }
            }
        }
        teardown
    }
}

async fn request(
    node: &Node,
    images: &HashMap<String, Image>,
    flavors: &HashMap<String, Flavor>,
) -> Result<InstanceRequest> {
    let spec = &node.spec;
    let image = images
        .get(&spec.distribution)
        .ok_or_else(|| Error::NoImage(spec.distribution.clone()))?;
    let flavor = flavors
        .get(&spec.flavor)
        .ok_or_else(|| Error::NoFlavor(spec.flavor.clone()))?;
    let user_data = match &spec.cloud_config {
        Some(path) => Some(tokio::fs::read(path).await?),
        None => None,
    };

    let mut metadata = HashMap::new();
    metadata.insert(fact::ROLE.to_string(), spec.role.to_string());

    Ok(InstanceRequest {
        name: spec.instance_name.clone(),
        image: image.id,
        flavor: flavor.id.clone(),
        security_groups: vec![spec.security_group.clone()],
        keypair: spec.keypair.clone(),
        user_data,
        metadata,
    })
}

fn record_build(node: &mut Node, image: &Image, topology: &Topology) {
    let instance = match &node.instance {
        Some(instance) => instance,
        None => return,
    };
    let ip = match instance.ip(topology.network.as_deref()) {
        Some(ip) => ip.to_string(),
        None => return,
    };
    let user = image.user().unwrap_or_else(|| {
        warn!(
            "image {} has no {} metadata, logging in as {}",
            image.name,
            crate::cloud::META_USER,
            DEFAULT_LOGIN_USER
        );
        DEFAULT_LOGIN_USER
    });
    let host = Host::new(user, ip.clone(), topology.private_key.clone());

    let facts = &mut node.facts;
    facts.insert(fact::INSTANCE_ID.into(), instance.id.to_string().into());
    facts.insert(fact::IP.into(), ip.into());
    facts.insert(fact::HOST_STRING.into(), host.to_string().into());
    facts.insert(fact::LOGIN_USER.into(), user.into());
    facts.insert(
        fact::OS_NAME.into(),
        image.metadata.get(META_OS_NAME).cloned().into(),
    );
    facts.insert(
        fact::OS_VERSION.into(),
        image.metadata.get(META_OS_VERSION).cloned().into(),
    );
    node.host = Some(host);
}

fn summarize(root: &Node) -> Vec<NodeSummary> {
    root.iter()
        .map(|node| NodeSummary {
            instance_name: node.name().to_string(),
            role: node.role(),
            ip: node.fact(fact::IP).map(String::from),
            host_string: node.fact(fact::HOST_STRING).map(String::from),
        })
        .collect()
}
