use super::subs::SubCommands;
use anyhow::Result;
use clap::{Args, Parser};
use deploy_env_lib::openstack::Credentials;

#[derive(Parser)]
#[clap(
    name = "deploy-env",
    version,
    about = "Deploy, configure and test Pulp topologies on OpenStack"
)]
pub struct Opts {
    #[clap(flatten)]
    pub cloud: CloudArgs,
    #[clap(subcommand)]
    pub commands: SubCommands,
}

/// Keystone credentials. Each one falls back to the variable the
/// OpenStack clients use.
#[derive(Args)]
pub struct CloudArgs {
    #[clap(
        long,
        global = true,
        help = "OpenStack username",
        env = "OS_USERNAME",
        value_name = "NAME"
    )]
    os_username: Option<String>,
    #[clap(
        long,
        global = true,
        help = "OpenStack password",
        env = "OS_PASSWORD",
        hide_env_values = true,
        value_name = "PASSWORD"
    )]
    os_password: Option<String>,
    #[clap(
        long,
        global = true,
        help = "OpenStack tenant id",
        env = "OS_TENANT_ID",
        value_name = "ID"
    )]
    os_tenant_id: Option<String>,
    #[clap(
        long,
        global = true,
        help = "OpenStack tenant name",
        env = "OS_TENANT_NAME",
        value_name = "NAME"
    )]
    os_tenant_name: Option<String>,
    #[clap(
        long,
        global = true,
        help = "Keystone v2 endpoint, e.g. https://keystone.example.com:5000/v2.0",
        env = "OS_AUTH_URL",
        value_name = "URL"
    )]
    os_auth_url: Option<String>,
}

impl CloudArgs {
    pub fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials::new(
            self.os_username.clone(),
            self.os_password.clone(),
            self.os_tenant_id.clone(),
            self.os_tenant_name.clone(),
            self.os_auth_url.clone(),
        )?)
    }
}
