use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;

use airgap::{
    config::EnvVars,
    helpers::{register_run, IMPORT_RUN_PROJECT},
    import::{import_to_standalone, DatasetRecording, ImportOptions},
    layout::{Layout, DEPLOY_MANIFEST, IMPORT_MANIFEST},
};
use clearml::RestPlatform;

/// Import an exported folder into a standalone platform.
#[derive(Parser, Debug)]
#[command(name = "airgap-import", version, about, long_about = None)]
struct Args {
    /// Base URL model weights are uploaded to. Defaults to the configured files host
    #[arg(long)]
    output_uri: Option<String>,

    #[arg(long, default_value = DEPLOY_MANIFEST)]
    deploy_info: PathBuf,

    #[arg(long, default_value = "tasks")]
    tasks_folder: PathBuf,

    #[arg(long, default_value = "models")]
    models_folder: PathBuf,

    #[arg(long, default_value = "datasets")]
    datasets_folder: PathBuf,

    /// Recorded in import.json as the person who ran the import
    #[arg(long, default_value = "")]
    importer: String,

    /// Record every re-created dataset in import.json, not only the last one of each task
    #[arg(long)]
    record_all_datasets: bool,

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

    let settings = env.settings();
    let platform = RestPlatform::connect(&settings).await?;
    if !args.skip_run_task {
        register_run(&platform, IMPORT_RUN_PROJECT).await?;
    }

    let options = ImportOptions {
        deploy_info: args.deploy_info,
        layout: Layout {
            tasks: args.tasks_folder,
            models: args.models_folder,
            datasets: args.datasets_folder,
        },
        output_uri: args.output_uri.unwrap_or(settings.files_host),
        importer: args.importer,
        recording: if args.record_all_datasets {
            DatasetRecording::All
        } else {
            DatasetRecording::LastOnly
        },
        import_info: PathBuf::from(IMPORT_MANIFEST),
    };
    let imported = import_to_standalone(&platform, &options).await?;

    log::info!(
        "Imported {} tasks, {} models and {} datasets",
        imported.imported_task.len(),
        imported.imported_model.len(),
        imported.imported_dataset.len()
    );
    Ok(())
}
