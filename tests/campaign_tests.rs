use bm_runner::{
    campaign::{RunStatus, METRICS_FILE, RESULTS_FILE},
    execution_unit::FAILED_MARKER,
    config::{ApplicationConfig, ExecKind, Hook, PluginConfig},
    execution_unit::{ContainerSettings, ExecutionUnit},
    metrics::MetricLine,
    monitor::{Monitor, RedisStats},
    resources::ResourceAssignment,
    sweep::RunDescriptor,
    value_domain::AxisSpec,
    Campaign, CampaignConfig, CampaignError, CampaignOptions,
};
use std::{fs, path::Path, path::PathBuf, time::Duration};

fn options(home: &Path) -> CampaignOptions {
    let mut options = CampaignOptions::new(home);
    options.name = Some("it".to_string());
    options.monitors.enabled = false;
    options.stop_grace = Duration::from_secs(2);
    options
}

fn fixture_config() -> anyhow::Result<CampaignConfig> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures/campaign.toml");
    Ok(CampaignConfig::try_from_path(&path)?)
}

fn cleanup_counter(log: &Path) -> PluginConfig {
    PluginConfig {
        name: "sh".to_string(),
        hook: Hook::Cleanup,
        path: None,
        args: vec![
            "-c".to_string(),
            format!("echo {{threads}} >> {}", log.display()),
        ],
        force_stop: false,
    }
}

#[test]
fn process_and_container_commands_only_differ_by_home() -> anyhow::Result<()> {
    let home = tempfile::tempdir()?;
    let run = RunDescriptor {
        index: 0,
        app_index: 0,
        application: "ls".to_string(),
        exec_kind: ExecKind::Process,
        unit_count: 1,
        threads: 1,
        duration: 3,
        initial_size: 0,
        noise: 0,
        repeat_index: 0,
    };
    let assignment = ResourceAssignment {
        unit_index: 0,
        cores: vec![0],
        nic: None,
        port: None,
    };
    // a plugin-injected sub-command, the application itself has no arguments
    let mut app = ApplicationConfig::new("ls", "");
    app.wrappers = vec!["strace -o {res_dir}/test-container{index}.log".to_string()];

    let mut process = ExecutionUnit::new(
        ExecKind::Process,
        assignment.clone(),
        home.path(),
        PathBuf::from("results"),
        &ContainerSettings::default(),
    );
    let mut container = ExecutionUnit::new(
        ExecKind::Container,
        assignment,
        home.path(),
        PathBuf::from("results"),
        &ContainerSettings::default(),
    );

    assert_eq!(
        process.build_command(&run, &app)?,
        format!(
            "strace -o {}/results/test-container0.log ls",
            home.path().display()
        )
    );
    assert_eq!(
        container.build_command(&run, &app)?,
        "strace -o /home/results/test-container0.log ls"
    );
    Ok(())
}

#[tokio::test]
async fn campaign_writes_one_line_per_run() -> anyhow::Result<()> {
    let home = tempfile::tempdir()?;
    let mut config = fixture_config()?;
    config.benchmark.duration = 1;
    config.benchmark.repeat = 1;
    config.benchmark.initial_size = AxisSpec::Values(vec![0]);

    let mut campaign = Campaign::new(config, options(home.path()))?;
    let runs = campaign.plan().len();
    let report = campaign.run().await?;

    assert_eq!(report.outcomes.len(), runs);
    assert_eq!(report.failed_runs(), 0);

    let results = fs::read_to_string(report.root.join(RESULTS_FILE))?;
    let lines = results.lines().map(MetricLine::parse).collect::<Vec<_>>();
    assert_eq!(lines.len(), runs);
    for (line, outcome) in lines.iter().zip(report.outcomes.iter()) {
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(line.get("threads"), line.get("throughput"));
        assert_eq!(line.get("execution_unit"), Some("native"));
        assert_eq!(line.get("application"), Some("echo-bench"));
        assert_eq!(line.get("index"), Some("0"));
    }

    let unit_metrics = report.root.join("echo-bench/0/0").join(METRICS_FILE);
    assert_eq!(fs::read_to_string(unit_metrics)?.lines().count(), 1);
    assert!(report.root.join("campaign.json").exists());
    Ok(())
}

#[tokio::test]
async fn cleanup_runs_once_per_run() -> anyhow::Result<()> {
    let home = tempfile::tempdir()?;
    let counter = home.path().join("cleanups.txt");

    let mut config = fixture_config()?;
    config.benchmark.duration = 1;
    config.benchmark.repeat = 1;
    config.benchmark.initial_size = AxisSpec::Values(vec![0]);
    config.plugins = vec![cleanup_counter(&counter)];

    let mut campaign = Campaign::new(config, options(home.path()))?;
    let runs = campaign.plan().len();
    campaign.run().await?;

    assert_eq!(fs::read_to_string(&counter)?.lines().count(), runs);
    Ok(())
}

#[tokio::test]
async fn aborted_campaign_still_cleans_up() -> anyhow::Result<()> {
    let home = tempfile::tempdir()?;
    let counter = home.path().join("cleanups.txt");

    let mut config = fixture_config()?;
    config.benchmark.duration = 30;
    config.benchmark.repeat = 1;
    config.applications = vec![ApplicationConfig::new("sleep", "60")];
    config.plugins = vec![cleanup_counter(&counter)];

    let mut campaign = Campaign::new(config, options(home.path()))?;
    let cancel = campaign.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
    });

    let root = campaign.root();
    let res = tokio::time::timeout(Duration::from_secs(20), campaign.run()).await?;
    assert!(matches!(res, Err(CampaignError::Aborted)));
    assert_eq!(fs::read_to_string(&counter)?.lines().count(), 1);

    let run_dir = root.join("sleep/0");
    assert!(fs::read_to_string(run_dir.join(FAILED_MARKER))?.contains("aborted"));
    assert!(run_dir.join("0").join(FAILED_MARKER).exists());
    assert!(!root.join(RESULTS_FILE).exists());
    Ok(())
}

#[tokio::test]
async fn failing_pre_hook_ends_the_campaign() -> anyhow::Result<()> {
    let home = tempfile::tempdir()?;
    let counter = home.path().join("cleanups.txt");

    let mut config = fixture_config()?;
    config.plugins = vec![
        PluginConfig {
            name: "sh".to_string(),
            hook: Hook::Pre,
            path: None,
            args: vec!["-c".to_string(), "exit 2".to_string()],
            force_stop: false,
        },
        cleanup_counter(&counter),
    ];

    let mut campaign = Campaign::new(config, options(home.path()))?;
    let res = campaign.run().await;
    assert!(matches!(res, Err(CampaignError::PreHook(_))));
    assert_eq!(fs::read_to_string(&counter)?.lines().count(), 1);

    let run_dir = campaign.root().join("echo-bench/0");
    assert!(fs::read_to_string(run_dir.join(FAILED_MARKER))?.contains("pre-hook"));
    assert!(run_dir.join("0").join(FAILED_MARKER).exists());
    Ok(())
}

#[tokio::test]
async fn failed_runs_are_cleaned_up_once() -> anyhow::Result<()> {
    let home = tempfile::tempdir()?;
    let counter = home.path().join("cleanups.txt");

    let mut config = fixture_config()?;
    config.benchmark.duration = 1;
    config.benchmark.repeat = 1;
    config.benchmark.initial_size = AxisSpec::Values(vec![0]);
    // the output is gone by the time it is collected
    let mut app = ApplicationConfig::new("sh", "-c 'echo ops=1; rm {res_dir}/stdout.log'");
    app.name = Some("vanishing".to_string());
    config.applications = vec![app];
    config.plugins = vec![cleanup_counter(&counter)];

    let mut campaign = Campaign::new(config, options(home.path()))?;
    let runs = campaign.plan().len();
    let report = campaign.run().await?;

    assert_eq!(report.failed_runs(), runs);
    assert_eq!(fs::read_to_string(&counter)?.lines().count(), runs);
    for outcome in report.outcomes.iter() {
        let run_dir = report.root.join("vanishing").join(outcome.run.index.to_string());
        assert!(run_dir.join(FAILED_MARKER).exists());
        assert!(run_dir.join("0").join(FAILED_MARKER).exists());
    }
    assert!(!report.root.join(RESULTS_FILE).exists());
    Ok(())
}

#[tokio::test]
async fn monitor_collected_before_start_is_empty() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(
        dir.path().join("redis.csv"),
        "\"test\",\"rps\"\n\"SET\",\"100\"\n",
    )?;
    let mut monitor = RedisStats::new(dir.path(), &["redis.csv".to_string()])?;
    assert!(monitor.collect_results().is_empty());

    monitor.start().await?;
    monitor.stop().await?;
    assert_eq!(monitor.collect_results().get("rps"), Some("100.0"));
    Ok(())
}
