use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;

use airgap::{
    config::EnvVars,
    export::{export_from_development, DatasetScope, ExportOptions, DEFAULT_SERVING_ID},
    helpers::{register_run, EXPORT_RUN_PROJECT},
};
use clearml::RestPlatform;

/// Export a serving service's models, their tasks and datasets for transfer to a standalone
/// platform.
#[derive(Parser, Debug)]
#[command(name = "airgap-export", version, about, long_about = None)]
struct Args {
    /// Serving service whose endpoints name the models to export
    #[arg(long, default_value = DEFAULT_SERVING_ID)]
    serving_service_id: String,

    /// Recorded in deploy.json as the person who ran the export
    #[arg(long, default_value = "")]
    developer: String,

    /// Export the datasets of every task instead of only the first one
    #[arg(long)]
    all_tasks: bool,

    /// Do not register this run as a task on the platform
    #[arg(long)]
    skip_run_task: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let args = Args::parse();
    let env = EnvVars::from_env()?;
    log::info!("Environment: {:?}", &env);

    let platform = RestPlatform::connect(&env.settings()).await?;
    if !args.skip_run_task {
        register_run(&platform, EXPORT_RUN_PROJECT).await?;
    }

    let options = ExportOptions {
        serving_id: args.serving_service_id,
        developer: args.developer,
        scope: if args.all_tasks {
            DatasetScope::AllTasks
        } else {
            DatasetScope::FirstTask
        },
        root: PathBuf::from("."),
    };
    let deploy = export_from_development(&platform, &options).await?;

    log::info!(
        "Exported {} models, {} tasks and {} datasets",
        deploy.models.len(),
        deploy.tasks.len(),
        deploy.datasets.len()
    );
    Ok(())
}
