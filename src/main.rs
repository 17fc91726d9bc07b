use anyhow::Context;
use bm_runner::{
    clap_args::{self, Commands},
    settings::{self, Toggles},
    summary, Campaign, CampaignConfig, CampaignOptions,
};
use std::{path::Path, process::ExitCode, time::Duration};
use tracing::{error, info, subscriber::set_global_default};

const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    if let Err(e) = set_global_default(settings::subscriber(args.verbose)) {
        eprintln!("Unable to install the log subscriber: {}", e);
    }

    let res = match args.command {
        Commands::Plan { config } => plan(&config),
        Commands::Run {
            config,
            home,
            name,
            no_monitors,
            overwrite,
        } => run(&config, home.as_deref(), name, no_monitors, overwrite).await,
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[FATAL] {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn plan(config_path: &Path) -> anyhow::Result<()> {
    let config = CampaignConfig::try_from_path(config_path)?;
    let plan = bm_runner::sweep::SweepPlan::new(
        &config.applications,
        &config.benchmark,
        &config.containers,
    )?;
    println!("{}", summary::render_plan(&plan));
    Ok(())
}

async fn run(
    config_path: &Path,
    home: Option<&Path>,
    name: Option<String>,
    no_monitors: bool,
    overwrite: bool,
) -> anyhow::Result<()> {
    let config_path = std::path::absolute(config_path)?;
    let config = CampaignConfig::try_from_path(&config_path)?;
    let home = match home {
        Some(home) => std::path::absolute(home)?,
        None => config.resolve_home()?,
    };
    std::env::set_current_dir(&home)
        .with_context(|| format!("Unable to enter {}", home.display()))?;
    info!("Campaign home: {}", home.display());

    let toggles = Toggles::from_env();
    let mut options = CampaignOptions::new(&home);
    options.name = name;
    options.overwrite = overwrite;
    options.config_path = Some(config_path);
    options.monitors = toggles.monitor_settings(no_monitors, MONITOR_STOP_TIMEOUT);

    let mut campaign = Campaign::new(config, options)?;
    let cancel = campaign.cancel_token();
    ctrlc::set_handler(move || {
        cancel.cancel();
    })?;

    let report = campaign.run().await?;
    println!("{}", summary::render_report(&report));
    Ok(())
}
