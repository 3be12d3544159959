//! Image maintenance: listing the images topologies can use, baking a new one
//! from a local file, and refreshing the existing ones in place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{error, info};
use serde::Serialize;
use tokio::time;
use uuid::Uuid;

use crate::cloud::{
    Cloud, Image, Instance, InstanceRequest, Status, META_DISTRIBUTION, META_OS_NAME,
    META_OS_VERSION, META_USER,
};
use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::puppet;
use crate::remote::{run_ok, wait_for_ssh, Host, Remote};

pub const UPLOAD_PREFIX: &str = "automated-";
pub const DEFAULT_SNAPSHOT_PREFIX: &str = "pre-pulp-";

const REBOOT_CEILING: Duration = Duration::from_secs(120);

/// One row of `images`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub name: String,
    pub id: Uuid,
    pub distribution: String,
    pub user: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
}

impl From<&Image> for ImageSummary {
    fn from(image: &Image) -> Self {
        ImageSummary {
            name: image.name.clone(),
            id: image.id,
            distribution: image.distribution().unwrap_or_default().to_string(),
            user: image.user().map(String::from),
            os_name: image.metadata.get(META_OS_NAME).cloned(),
            os_version: image.metadata.get(META_OS_VERSION).cloned(),
        }
    }
}

/// Images that carry distribution metadata, sorted by name.
pub async fn list<C: Cloud + ?Sized>(cloud: &C) -> Result<Vec<ImageSummary>> {
    let mut images: Vec<ImageSummary> = cloud
        .list_images()
        .await?
        .iter()
        .filter(|image| image.distribution().is_some())
        .map(ImageSummary::from)
        .collect();
    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(images)
}

/// Where and how throwaway build instances are booted.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub flavor: String,
    pub security_group: String,
    pub keypair: String,
    pub private_key: PathBuf,
    pub network: Option<String>,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone)]
pub struct AddImage {
    pub file: PathBuf,
    pub distribution: String,
    pub user: String,
    pub os_name: String,
    pub os_version: String,
    pub manifest: PathBuf,
    pub cloud_config: Option<PathBuf>,
    pub prefix: String,
}

#[derive(Debug, Clone)]
pub struct UpdateImages {
    pub manifest: Option<PathBuf>,
}

/// The instance used to bake an image, and how to reach it.
struct Builder {
    instance: Instance,
    host: Host,
}

pub struct ImageManager<'a, C: ?Sized, R: ?Sized> {
    cloud: &'a C,
    remote: &'a R,
    settings: BuildSettings,
}

impl<'a, C: Cloud + ?Sized, R: Remote + ?Sized> ImageManager<'a, C, R> {
    pub fn new(cloud: &'a C, remote: &'a R, settings: BuildSettings) -> Self {
        ImageManager {
            cloud,
            remote,
            settings,
        }
    }

    /// Upload `file`, provision it with puppet, and snapshot the result with
    /// the metadata topologies look images up by.
    pub async fn add_image(&self, add: &AddImage) -> Result<Uuid> {
        if !add.file.is_file() {
            return Err(Error::MissingFile(add.file.display().to_string()));
        }
        let basename = file_name(&add.file);

        info!("uploading {}", add.file.display());
        let vanilla = self
            .cloud
            .upload_image(&format!("{}{}", UPLOAD_PREFIX, basename), &add.file)
            .await?;
        self.wait_for_image(vanilla.id, &vanilla.name).await?;

        let user_data = match &add.cloud_config {
            Some(path) => Some(tokio::fs::read(path).await?),
            None => None,
        };
        let mut metadata = HashMap::new();
        metadata.insert(META_USER.to_string(), add.user.clone());
        metadata.insert(META_DISTRIBUTION.to_string(), add.distribution.clone());
        metadata.insert(META_OS_NAME.to_string(), add.os_name.clone());
        metadata.insert(META_OS_VERSION.to_string(), add.os_version.clone());

        let snapshot_name = format!("{}{}", add.prefix, basename);
        let name = format!("{}-build", snapshot_name);
        self.with_builder(&name, vanilla.id, &add.user, user_data, |builder| async move {
            self.provision(&builder.host, Some(&add.manifest))?;
            self.reboot(&builder).await?;
            self.snapshot(&builder, &snapshot_name, &metadata).await
        })
        .await
    }

    /// Refresh every image that carries distribution metadata. Each refreshed
    /// snapshot replaces the image it was built from. An image that fails to
    /// update is logged and the rest still run.
    pub async fn update_images(&self, update: &UpdateImages) -> Result<Vec<Uuid>> {
        let images: Vec<Image> = self
            .cloud
            .list_images()
            .await?
            .into_iter()
            .filter(|image| image.distribution().is_some())
            .collect();

        let mut updated = Vec::new();
        let mut failed = Vec::new();
        for image in images {
            info!("updating {} ({})", image.name, image.id);
            match self.update_image(&image, update).await {
                Ok(id) => updated.push(id),
                Err(e) => {
                    error!("failed to update {}: {}", image.name, e);
                    failed.push(image.name);
                }
            }
        }

        if failed.is_empty() {
            Ok(updated)
        } else {
            Err(Error::UpdateFailed(failed))
        }
    }

    async fn update_image(&self, image: &Image, update: &UpdateImages) -> Result<Uuid> {
        let user = image
            .user()
            .ok_or_else(|| Error::MissingMetadata {
                image: image.name.clone(),
                key: META_USER,
            })?;
        let name = format!("{}-update", image.name);
        let snapshot = self
            .with_builder(&name, image.id, user, None, |builder| async move {
                self.provision(&builder.host, update.manifest.as_deref())?;
                self.reboot(&builder).await?;
                self.snapshot(&builder, &image.name, &image.metadata).await
            })
            .await?;

        info!("removing superseded image {} ({})", image.name, image.id);
        self.cloud.delete_image(image.id).await?;
        Ok(snapshot)
    }

    /// Boot `image` as `name`, run `work` against it, and delete the instance
    /// whatever `work` returned.
    async fn with_builder<F, Fut, T>(
        &self,
        name: &str,
        image: Uuid,
        user: &str,
        user_data: Option<Vec<u8>>,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(Builder) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let flavor = self.cloud.find_flavor(&self.settings.flavor).await?;
        let request = InstanceRequest {
            name: name.to_string(),
            image,
            flavor: flavor.id,
            security_groups: vec![self.settings.security_group.clone()],
            keypair: self.settings.keypair.clone(),
            user_data,
            metadata: HashMap::new(),
        };
        info!("booting {}", name);
        let instance = self.cloud.create_instance(&request).await?;
        let id = instance.id;

        let result = match self.boot(instance, user).await {
            Ok(builder) => work(builder).await,
            Err(e) => Err(e),
        };

        info!("deleting {}", name);
        if let Err(e) = self.cloud.delete_instance(id).await {
            error!("failed to delete {} ({}): {}", name, id, e);
        }
        result
    }

    async fn boot(&self, instance: Instance, user: &str) -> Result<Builder> {
        let ceiling = self.settings.timeouts.build_ceiling();
        let instance = self
            .wait_for_active(instance.id, &instance.name, ceiling)
            .await?;
        let ip = instance
            .ip(self.settings.network.as_deref())
            .ok_or_else(|| Error::NoAddress(instance.name.clone()))?
            .to_string();
        let host = Host::new(user, ip, self.settings.private_key.clone());
        self.wait_for_ssh(&host).await?;
        Ok(Builder { instance, host })
    }

    fn provision(&self, host: &Host, manifest: Option<&Path>) -> Result<()> {
        run_ok(self.remote, host, "sudo yum -y update")?;
        puppet::install_puppet(self.remote, host)?;
        puppet::install_modules(self.remote, host, puppet::MODULES)?;
        if let Some(manifest) = manifest {
            puppet::apply_manifest(self.remote, host, manifest)?;
        }
        Ok(())
    }

    async fn wait_for_ssh(&self, host: &Host) -> Result<()> {
        let timeouts = &self.settings.timeouts;
        wait_for_ssh(self.remote, host, timeouts.ssh_attempts, timeouts.ssh_interval()).await
    }

    /// Soft reboot, then wait for `ACTIVE` and for SSH to come back.
    async fn reboot(&self, builder: &Builder) -> Result<()> {
        info!("rebooting {}", builder.instance.name);
        self.cloud.reboot_instance(builder.instance.id).await?;
        self.wait_for_active(builder.instance.id, &builder.instance.name, REBOOT_CEILING)
            .await?;
        self.wait_for_ssh(&builder.host).await
    }

    async fn wait_for_active(&self, id: Uuid, name: &str, ceiling: Duration) -> Result<Instance> {
        let poll = self.settings.timeouts.poll_interval();
        let wait = async {
            loop {
                let instance = self.cloud.get_instance(id).await?;
                match &instance.status {
                    Status::Active => return Ok(instance),
                    Status::Error => {
                        return Err(Error::BuildFailed {
                            instance: name.to_string(),
                            status: instance.status.to_string(),
                        })
                    }
                    _ => time::sleep(poll).await,
                }
            }
        };
        time::timeout(ceiling, wait).await?
    }

    async fn wait_for_image(&self, id: Uuid, name: &str) -> Result<Image> {
        let timeouts = &self.settings.timeouts;
        let poll = timeouts.poll_interval();
        let wait = async {
            loop {
                let image = self.cloud.get_image(id).await?;
                match &image.status {
                    Status::Active => return Ok(image),
                    Status::Other(status) if is_dead(status) => {
                        return Err(Error::SnapshotFailed {
                            name: name.to_string(),
                            status: status.clone(),
                        })
                    }
                    Status::Error => {
                        return Err(Error::SnapshotFailed {
                            name: name.to_string(),
                            status: image.status.to_string(),
                        })
                    }
                    _ => time::sleep(poll).await,
                }
            }
        };
        time::timeout(timeouts.snapshot_ceiling(), wait).await?
    }

    async fn snapshot(
        &self,
        builder: &Builder,
        name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Uuid> {
        info!("snapshotting {} as {}", builder.instance.name, name);
        let id = self.cloud.snapshot_instance(builder.instance.id, name).await?;
        self.wait_for_image(id, name).await?;
        self.cloud.set_image_metadata(id, metadata).await?;
        info!("snapshot {} is {}", name, id);
        Ok(id)
    }
}

fn is_dead(status: &str) -> bool {
    matches!(status, "KILLED" | "DELETED")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}
