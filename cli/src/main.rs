mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{opts::Opts, subs::SubCommands};

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let opts = Opts::parse();
    let cloud = opts.cloud;

    match opts.commands {
        SubCommands::Deploy(sub) => cli::deploy(sub, cloud).await,
        SubCommands::Images(sub) => cli::images(sub, cloud).await,
        SubCommands::AddImage(sub) => cli::add_image(sub, cloud).await,
        SubCommands::UpdateImages(sub) => cli::update_images(sub, cloud).await,
        SubCommands::Completions(sub) => cli::completions(sub),
    }?;
    Ok(())
}
