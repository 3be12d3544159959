use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use deploy_env_lib::config::{Timeouts, DEFAULT_FLAVOR, DEFAULT_SECURITY_GROUP};
use deploy_env_lib::images::{BuildSettings, DEFAULT_SNAPSHOT_PREFIX};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum SubCommands {
    Deploy(Deploy),
    Images(Images),
    AddImage(AddImage),
    UpdateImages(UpdateImages),
    Completions(Completions),
}

#[derive(Parser)]
#[clap(about = "Build, configure and optionally test the topology described in a YAML file")]
pub struct Deploy {
    #[clap(help = "path to the topology file", value_name = "TOPOLOGY")]
    pub topology: PathBuf,
    #[clap(long, short, help = "repository to install Pulp from", value_name = "URL")]
    pub repository: Option<String>,
    #[clap(long, help = "run the integration tests on the tester once configured")]
    pub run_tests: bool,
    #[clap(long, help = "leave every instance running, even after a failure")]
    pub no_teardown: bool,
    #[clap(
        long,
        help = "build and configure only; instances are kept unless setup fails"
    )]
    pub setup_only: bool,
}

#[derive(Parser)]
#[clap(about = "List the images that carry distribution metadata")]
pub struct Images {
    #[clap(short, long, help = "output as JSON")]
    pub json: bool,
}

/// How throwaway instances used to bake images are booted.
#[derive(Args)]
pub struct BuildArgs {
    #[clap(long, help = "name of the OpenStack key pair", env = "OS_KEYPAIR", value_name = "NAME")]
    pub keypair: String,
    #[clap(
        long,
        help = "private key of the key pair",
        env = "OS_PRIVATE_KEY",
        value_name = "FILE"
    )]
    pub private_key: PathBuf,
    #[clap(long, default_value = DEFAULT_FLAVOR, value_name = "NAME")]
    pub flavor: String,
    #[clap(long, default_value = DEFAULT_SECURITY_GROUP, value_name = "NAME")]
    pub security_group: String,
    #[clap(long, help = "network to reach instances on", value_name = "NAME")]
    pub network: Option<String>,
    #[clap(
        long,
        help = "seconds to wait for the build instance to become active",
        default_value_t = Timeouts::default().build,
        value_name = "SECONDS"
    )]
    pub build_timeout: u64,
    #[clap(
        long,
        help = "seconds between instance and image status polls",
        default_value_t = Timeouts::default().poll,
        value_name = "SECONDS"
    )]
    pub poll_interval: u64,
    #[clap(
        long,
        help = "times to try SSH before giving up",
        default_value_t = Timeouts::default().ssh_attempts,
        value_name = "COUNT"
    )]
    pub ssh_attempts: usize,
    #[clap(
        long,
        help = "seconds between SSH attempts",
        default_value_t = Timeouts::default().ssh_interval,
        value_name = "SECONDS"
    )]
    pub ssh_interval: u64,
    #[clap(
        long,
        help = "seconds to wait for uploads and snapshots to become active",
        default_value_t = Timeouts::default().snapshot,
        value_name = "SECONDS"
    )]
    pub snapshot_timeout: u64,
}

impl BuildArgs {
    pub fn settings(&self) -> BuildSettings {
        BuildSettings {
            flavor: self.flavor.clone(),
            security_group: self.security_group.clone(),
            keypair: self.keypair.clone(),
            private_key: self.private_key.clone(),
            network: self.network.clone(),
            timeouts: Timeouts {
                build: self.build_timeout,
                poll: self.poll_interval,
                ssh_attempts: self.ssh_attempts,
                ssh_interval: self.ssh_interval,
                snapshot: self.snapshot_timeout,
            },
        }
    }
}

#[derive(Parser)]
#[clap(about = "Upload a qcow2 image, provision it with puppet and snapshot it for topologies")]
pub struct AddImage {
    #[clap(long, help = "the qcow2 file to upload", value_name = "FILE")]
    pub image: PathBuf,
    #[clap(long, help = "distribution name topologies refer to, e.g. fc20", value_name = "NAME")]
    pub distribution: String,
    #[clap(long, help = "user to log in as, e.g. fedora or cloud-user", value_name = "USER")]
    pub user: String,
    #[clap(long, help = "OS name written to the test inventory", value_name = "NAME")]
    pub os_name: String,
    #[clap(long, help = "OS version written to the test inventory", value_name = "VERSION")]
    pub os_version: String,
    #[clap(long, help = "puppet manifest to apply before the snapshot", value_name = "FILE")]
    pub puppet_manifest: PathBuf,
    #[clap(long, help = "cloud-init user data for the first boot", value_name = "FILE")]
    pub cloud_config: Option<PathBuf>,
    #[clap(long, default_value = DEFAULT_SNAPSHOT_PREFIX, value_name = "PREFIX")]
    pub prefix: String,
    #[clap(flatten)]
    pub build: BuildArgs,
}

#[derive(Parser)]
#[clap(about = "Update every image that carries distribution metadata")]
pub struct UpdateImages {
    #[clap(long, help = "puppet manifest to apply before each snapshot", value_name = "FILE")]
    pub puppet_manifest: Option<PathBuf>,
    #[clap(flatten)]
    pub build: BuildArgs,
}

#[derive(Parser)]
#[clap(about = "Generate shell completion files")]
pub struct Completions {
    #[clap(arg_enum, help = "bash, elvish, fish, powershell, or zsh")]
    pub shell: Shell,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::opts::Opts;

    fn update_images(extra: &[&str]) -> BuildSettings {
        let mut args = vec![
            "deploy-env",
            "update-images",
            "--keypair",
            "qe-key",
            "--private-key",
            "qe.pem",
        ];
        args.extend_from_slice(extra);
        match Opts::try_parse_from(args).unwrap().commands {
            SubCommands::UpdateImages(update) => update.build.settings(),
            _ => panic!("expected update-images"),
        }
    }

    #[test]
    fn build_timeouts_default_to_the_topology_defaults() {
        assert_eq!(update_images(&[]).timeouts, Timeouts::default());
    }

    #[test]
    fn build_timeouts_can_be_raised_for_slow_clouds() {
        let settings = update_images(&[
            "--build-timeout",
            "1200",
            "--poll-interval",
            "5",
            "--ssh-attempts",
            "60",
            "--ssh-interval",
            "3",
            "--snapshot-timeout",
            "3600",
        ]);
        assert_eq!(
            settings.timeouts,
            Timeouts {
                build: 1200,
                poll: 5,
                ssh_attempts: 60,
                ssh_interval: 3,
                snapshot: 3600,
            }
        );
        assert_eq!(settings.keypair, "qe-key");
    }
}
