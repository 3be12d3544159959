pub mod opts;
pub mod subs;

use anyhow::{Context, Result};
use clap::IntoApp;
use colored::*;
use deploy_env_lib::{
    images::{self, ImageManager},
    openstack::OpenStack,
    remote::Ssh,
    roles::RoleConfigurator,
    topology::Outcome,
    DeployOptions, Orchestrator, Topology,
};
use log::*;
use prettytable::{cell, row, Table};
use std::io;

use opts::{CloudArgs, Opts};
use subs::{AddImage, Completions, Deploy, Images, UpdateImages};

async fn authenticate(cloud: &CloudArgs) -> Result<OpenStack> {
    let credentials = cloud.credentials()?;
    debug!("authenticating as {} at {}", credentials.username, credentials.auth_url);
    OpenStack::authenticate(&credentials)
        .await
        .with_context(|| format!("failed to authenticate with {}", credentials.auth_url))
}

pub(crate) async fn deploy(sub: Deploy, cloud: CloudArgs) -> Result<()> {
    let mut topology = Topology::from_path(&sub.topology)
        .with_context(|| format!("failed to load {}", sub.topology.display()))?;
    if let Some(repository) = sub.repository {
        topology.override_repository(repository);
    }

    let openstack = authenticate(&cloud).await?;
    let configurator = RoleConfigurator::new(Ssh::default(), &topology);
    let orchestrator = Orchestrator::new(openstack, configurator);
    let options = DeployOptions {
        run_tests: sub.run_tests,
        no_teardown: sub.no_teardown,
        setup_only: sub.setup_only,
    };

    let outcome = orchestrator.deploy(&topology, &options).await?;
    print_outcome(&outcome);

    // The test runner's exit status is ours.
    let code = outcome.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn print_outcome(outcome: &Outcome) {
    let mut table = Table::new();
    table.add_row(row!["Name", "Role", "IP", "Login"]);
    for node in outcome.nodes.iter() {
        table.add_row(row![
            node.instance_name,
            node.role,
            node.ip.clone().unwrap_or_default(),
            node.host_string.clone().unwrap_or_default()
        ]);
    }
    table.printstd();

    match &outcome.teardown {
        Some(teardown) if teardown.failures.is_empty() => {
            println!("{}", format!("deleted {} instances", teardown.deleted).green());
        }
        Some(teardown) => {
            for (name, e) in teardown.failures.iter() {
                println!("{}", format!("failed to delete {}: {}", name, e).red());
            }
        }
        None => println!("{}", "instances were left running".yellow()),
    }

    match outcome.test_code {
        Some(0) => println!("{}", "tests passed".green()),
        Some(code) => println!("{}", format!("tests failed with exit code {}", code).red()),
        None => {}
    }
}

pub(crate) async fn images(sub: Images, cloud: CloudArgs) -> Result<()> {
    let openstack = authenticate(&cloud).await?;
    let images = images::list(&openstack).await?;

    if sub.json {
        let stdout = io::stdout();
        let handle = stdout.lock();
        serde_json::to_writer_pretty(handle, &images)?;
    } else {
        let mut table = Table::new();
        table.add_row(row![
            "Name",
            "Id",
            "Distribution",
            "User",
            "OS",
            "Version"
        ]);
        for image in images.into_iter() {
            table.add_row(row![
                image.name,
                image.id,
                image.distribution,
                image.user.unwrap_or_default(),
                image.os_name.unwrap_or_default(),
                image.os_version.unwrap_or_default()
            ]);
        }
        table.printstd();
    }
    Ok(())
}

pub(crate) async fn add_image(sub: AddImage, cloud: CloudArgs) -> Result<()> {
    let openstack = authenticate(&cloud).await?;
    let ssh = Ssh::default();
    let manager = ImageManager::new(&openstack, &ssh, sub.build.settings());
    let add = images::AddImage {
        file: sub.image,
        distribution: sub.distribution,
        user: sub.user,
        os_name: sub.os_name,
        os_version: sub.os_version,
        manifest: sub.puppet_manifest,
        cloud_config: sub.cloud_config,
        prefix: sub.prefix,
    };

    let id = manager
        .add_image(&add)
        .await
        .with_context(|| format!("failed to add {}", add.file.display()))?;
    println!("{}", format!("snapshot id: {}", id).green());
    Ok(())
}

pub(crate) async fn update_images(sub: UpdateImages, cloud: CloudArgs) -> Result<()> {
    let openstack = authenticate(&cloud).await?;
    let ssh = Ssh::default();
    let manager = ImageManager::new(&openstack, &ssh, sub.build.settings());
    let update = images::UpdateImages {
        manifest: sub.puppet_manifest,
    };

    let updated = manager.update_images(&update).await?;
    println!("{}", format!("updated {} images", updated.len()).green());
    Ok(())
}

pub(crate) fn completions(sub: Completions) -> Result<()> {
    let mut app = Opts::into_app();
    clap_complete::generate(sub.shell, &mut app, "deploy-env", &mut io::stdout());
    Ok(())
}
