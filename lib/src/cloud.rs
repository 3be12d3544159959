//! The cloud collaborator: just enough of a compute/image API to build,
//! watch, snapshot and delete instances.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Image metadata keys written by `add-image` and read when building.
pub const META_USER: &str = "user";
pub const META_DISTRIBUTION: &str = "distribution";
pub const META_OS_NAME: &str = "os_name";
pub const META_OS_VERSION: &str = "os_version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Active,
    Build,
    Error,
    Other(String),
}

impl From<&str> for Status {
    fn from(status: &str) -> Self {
        match status {
            "ACTIVE" => Status::Active,
            "BUILD" => Status::Build,
            "ERROR" => Status::Error,
            other => Status::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Status::Active => write!(f, "ACTIVE"),
            Status::Build => write!(f, "BUILD"),
            Status::Error => write!(f, "ERROR"),
            Status::Other(status) => write!(f, "{}", status),
        }
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let status = String::deserialize(deserializer)?;
        Ok(Status::from(status.to_uppercase().as_str()))
    }
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub addr: String,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub addresses: HashMap<String, Vec<Address>>,
}

impl Instance {
    /// The address to reach the instance on. A named network wins,
    /// then the first one; within it a floating address wins, then the last.
    pub fn ip(&self, network: Option<&str>) -> Option<&str> {
        let addresses = match network {
            Some(network) => self.addresses.get(network),
            None => {
                let mut names: Vec<&String> = self.addresses.keys().collect();
                names.sort();
                names.first().and_then(|name| self.addresses.get(*name))
            }
        }?;

        addresses
            .iter()
            .find(|address| address.kind.as_deref() == Some("floating"))
            .or_else(|| addresses.last())
            .map(|address| address.addr.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// ISO 8601, so later images sort after earlier ones.
    #[serde(default)]
    pub created: Option<String>,
}

impl Image {
    pub fn distribution(&self) -> Option<&str> {
        self.metadata.get(META_DISTRIBUTION).map(String::as_str)
    }

    pub fn user(&self) -> Option<&str> {
        self.metadata.get(META_USER).map(String::as_str)
    }
}

/// The most recently created image for `distribution`. Ties go to the
/// greater name, then id, so the choice never depends on listing order.
pub fn newest<'a>(images: &'a [Image], distribution: &str) -> Option<&'a Image> {
    images
        .iter()
        .filter(|image| image.distribution() == Some(distribution))
        .max_by(|a, b| {
            (&a.created, &a.name, a.id).cmp(&(&b.created, &b.name, b.id))
        })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRequest {
    pub name: String,
    pub image: Uuid,
    pub flavor: String,
    pub security_groups: Vec<String>,
    pub keypair: String,
    pub user_data: Option<Vec<u8>>,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Cloud: Send + Sync {
    async fn list_images(&self) -> Result<Vec<Image>>;
    async fn get_image(&self, id: Uuid) -> Result<Image>;
    async fn find_flavor(&self, name: &str) -> Result<Flavor>;
    /// Issue the build request. The instance is usually still in `BUILD`.
    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance>;
    async fn get_instance(&self, id: Uuid) -> Result<Instance>;
    async fn delete_instance(&self, id: Uuid) -> Result<()>;
    async fn reboot_instance(&self, id: Uuid) -> Result<()>;
    async fn upload_image(&self, name: &str, file: &Path) -> Result<Image>;
    async fn delete_image(&self, id: Uuid) -> Result<()>;
    async fn snapshot_instance(&self, id: Uuid, name: &str) -> Result<Uuid>;
    async fn set_image_metadata(&self, id: Uuid, metadata: &HashMap<String, String>)
        -> Result<()>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;

    /// In-memory cloud. Instances report `BUILD` for `building_polls` reads,
    /// then whatever `final_status` says for their name (default `ACTIVE`).
    #[derive(Default)]
    pub struct FakeCloud {
        pub images: Mutex<Vec<Image>>,
        pub instances: Mutex<Vec<Instance>>,
        pub requests: Mutex<Vec<InstanceRequest>>,
        pub polls: Mutex<HashMap<Uuid, usize>>,
        pub deleted: Mutex<Vec<Uuid>>,
        pub reboots: Mutex<Vec<Uuid>>,
        pub snapshots: Mutex<Vec<(Uuid, String)>>,
        pub metadata: Mutex<HashMap<Uuid, HashMap<String, String>>>,
        pub deleted_images: Mutex<Vec<Uuid>>,
        pub building_polls: usize,
        pub final_status: HashMap<String, Status>,
        pub fail_create: Option<String>,
        pub fail_delete: Option<String>,
        /// Status every new snapshot reports, `ACTIVE` when unset.
        pub snapshot_status: Option<Status>,
    }

    impl FakeCloud {
        pub fn with_image(self, name: &str, distribution: &str, user: &str) -> Self {
            let mut metadata = HashMap::new();
            metadata.insert(META_DISTRIBUTION.to_string(), distribution.to_string());
            metadata.insert(META_USER.to_string(), user.to_string());
            metadata.insert(META_OS_NAME.to_string(), "Fedora".to_string());
            metadata.insert(META_OS_VERSION.to_string(), "20".to_string());
            let image = Image {
                metadata,
                ..self.image(name, Status::Active)
            };
            self.images.lock().unwrap().push(image);
            self
        }

        /// A fresh image whose `created` sorts after every earlier one.
        pub fn image(&self, name: &str, status: Status) -> Image {
            let count = self.images.lock().unwrap().len();
            Image {
                id: Uuid::new_v4(),
                name: name.to_string(),
                status,
                metadata: HashMap::new(),
                created: Some(format!("2014-06-01T00:00:{:02}Z", count)),
            }
        }

        pub fn created(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|request| request.name.clone())
                .collect()
        }

        pub fn deleted_names(&self) -> Vec<String> {
            let instances = self.instances.lock().unwrap();
            self.deleted
                .lock()
                .unwrap()
                .iter()
                .filter_map(|id| instances.iter().find(|i| i.id == *id))
                .map(|instance| instance.name.clone())
                .collect()
        }

        fn instance(&self, id: Uuid) -> Result<Instance> {
            self.instances
                .lock()
                .unwrap()
                .iter()
                .find(|instance| instance.id == id)
                .cloned()
                .ok_or_else(|| not_found(id))
        }
    }

    fn not_found(id: Uuid) -> Error {
        Error::Api {
            method: "GET",
            url: format!("fake://{}", id),
            status: 404,
            body: "not found".into(),
        }
    }

    #[async_trait]
    impl Cloud for FakeCloud {
        async fn list_images(&self) -> Result<Vec<Image>> {
            Ok(self.images.lock().unwrap().clone())
        }

        async fn get_image(&self, id: Uuid) -> Result<Image> {
            self.images
                .lock()
                .unwrap()
                .iter()
                .find(|image| image.id == id)
                .cloned()
                .ok_or_else(|| not_found(id))
        }

        async fn find_flavor(&self, name: &str) -> Result<Flavor> {
            if name == "missing" {
                return Err(Error::NoFlavor(name.to_string()));
            }
            Ok(Flavor {
                id: format!("flavor-{}", name),
                name: name.to_string(),
            })
        }

        async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance> {
            if self.fail_create.as_deref() == Some(request.name.as_str()) {
                return Err(Error::Api {
                    method: "POST",
                    url: "fake://servers".into(),
                    status: 413,
                    body: "quota exceeded".into(),
                });
            }
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());

            let mut addresses = HashMap::new();
            addresses.insert(
                "private".to_string(),
                vec![Address {
                    addr: format!("10.0.0.{}", requests.len()),
                    kind: None,
                }],
            );
            let instance = Instance {
                id: Uuid::new_v4(),
                name: request.name.clone(),
                status: Status::Build,
                addresses,
            };
            self.instances.lock().unwrap().push(instance.clone());
            Ok(Instance {
                addresses: HashMap::new(),
                ..instance
            })
        }

        async fn get_instance(&self, id: Uuid) -> Result<Instance> {
            let mut instance = self.instance(id)?;
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(id).or_insert(0);
            *count += 1;
            instance.status = if *count <= self.building_polls {
                Status::Build
            } else {
                self.final_status
                    .get(&instance.name)
                    .cloned()
                    .unwrap_or(Status::Active)
            };
            Ok(instance)
        }

        async fn delete_instance(&self, id: Uuid) -> Result<()> {
            let instance = self.instance(id)?;
            self.deleted.lock().unwrap().push(id);
            if self.fail_delete.as_deref() == Some(instance.name.as_str()) {
                return Err(Error::Api {
                    method: "DELETE",
                    url: format!("fake://servers/{}", id),
                    status: 500,
                    body: "internal error".into(),
                });
            }
            Ok(())
        }

        async fn reboot_instance(&self, id: Uuid) -> Result<()> {
            self.reboots.lock().unwrap().push(id);
            Ok(())
        }

        async fn upload_image(&self, name: &str, _file: &Path) -> Result<Image> {
            let image = self.image(name, Status::Active);
            self.images.lock().unwrap().push(image.clone());
            Ok(image)
        }

        async fn delete_image(&self, id: Uuid) -> Result<()> {
            let mut images = self.images.lock().unwrap();
            let before = images.len();
            images.retain(|image| image.id != id);
            if images.len() == before {
                return Err(not_found(id));
            }
            self.deleted_images.lock().unwrap().push(id);
            Ok(())
        }

        async fn snapshot_instance(&self, id: Uuid, name: &str) -> Result<Uuid> {
            self.instance(id)?;
            self.snapshots.lock().unwrap().push((id, name.to_string()));
            let status = self.snapshot_status.clone().unwrap_or(Status::Active);
            let image = self.image(name, status);
            let snapshot = image.id;
            self.images.lock().unwrap().push(image);
            Ok(snapshot)
        }

        async fn set_image_metadata(
            &self,
            id: Uuid,
            metadata: &HashMap<String, String>,
        ) -> Result<()> {
            if let Some(image) = self
                .images
                .lock()
                .unwrap()
                .iter_mut()
                .find(|image| image.id == id)
            {
                image.metadata = metadata.clone();
            }
            self.metadata.lock().unwrap().insert(id, metadata.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(addresses: &str) -> Instance {
        serde_json::from_str(&format!(
            r#"{{"id": "{}", "name": "i", "status": "ACTIVE", "addresses": {}}}"#,
            Uuid::new_v4(),
            addresses
        ))
        .unwrap()
    }

    #[test]
    fn floating_address_is_preferred() {
        let instance = instance(
            r#"{"os1-internal": [
                {"addr": "10.0.0.4", "OS-EXT-IPS:type": "fixed"},
                {"addr": "172.16.1.9", "OS-EXT-IPS:type": "floating"},
                {"addr": "10.0.0.5"}
            ]}"#,
        );
        assert_eq!(instance.ip(None), Some("172.16.1.9"));
    }

    #[test]
    fn last_address_without_floating() {
        let instance = instance(
            r#"{"private": [{"addr": "10.0.0.4"}, {"addr": "10.0.0.5"}]}"#,
        );
        assert_eq!(instance.ip(None), Some("10.0.0.5"));
    }

    #[test]
    fn named_network_wins() {
        let instance = instance(
            r#"{"a": [{"addr": "10.0.0.1"}], "b": [{"addr": "10.1.0.1"}]}"#,
        );
        assert_eq!(instance.ip(Some("b")), Some("10.1.0.1"));
        assert_eq!(instance.ip(None), Some("10.0.0.1"));
        assert_eq!(instance.ip(Some("c")), None);
    }

    fn image(name: &str, distribution: &str, created: &str) -> Image {
        let mut metadata = HashMap::new();
        metadata.insert(META_DISTRIBUTION.to_string(), distribution.to_string());
        Image {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: Status::Active,
            metadata,
            created: Some(created.to_string()),
        }
    }

    #[test]
    fn newest_image_wins_whatever_the_order() {
        let images = vec![
            image("pulp-fc20", "fc20", "2014-06-02T10:00:00Z"),
            image("pulp-fc20", "fc20", "2014-06-09T10:00:00Z"),
            image("pulp-el6", "el6", "2014-06-30T10:00:00Z"),
        ];
        let mut reversed = images.clone();
        reversed.reverse();

        assert_eq!(newest(&images, "fc20").unwrap().id, images[1].id);
        assert_eq!(newest(&reversed, "fc20").unwrap().id, images[1].id);
        assert!(newest(&images, "rhel7").is_none());
    }

    #[test]
    fn statuses_are_case_insensitive() {
        let status: Status = serde_json::from_str(r#""active""#).unwrap();
        assert_eq!(status, Status::Active);
        let status: Status = serde_json::from_str(r#""SHUTOFF""#).unwrap();
        assert_eq!(status, Status::Other("SHUTOFF".into()));
    }
}
