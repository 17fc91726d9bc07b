use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a benchmark campaign
    Run {
        /// Campaign file (.toml or .json)
        config: PathBuf,

        /// Campaign home, overrides `home_dir` of the campaign file
        #[arg(long)]
        home: Option<PathBuf>,

        /// Name of the results directory of this campaign (default: a timestamp)
        #[arg(short, long)]
        name: Option<String>,

        /// Do not run any monitor
        #[arg(long)]
        no_monitors: bool,

        /// Replace the results of a previous campaign with the same name
        #[arg(long)]
        overwrite: bool,
    },

    /// Print the runs of a campaign without executing them
    Plan {
        /// Campaign file (.toml or .json)
        config: PathBuf,
    },
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_with_options() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "bm-runner",
            "run",
            "campaign.toml",
            "--name",
            "nightly",
            "--no-monitors",
            "-v",
        ])?;
        assert!(args.verbose);
        match args.command {
            Commands::Run {
                config,
                home,
                name,
                no_monitors,
                overwrite,
            } => {
                assert_eq!(config, PathBuf::from("campaign.toml"));
                assert_eq!(home, None);
                assert_eq!(name.as_deref(), Some("nightly"));
                assert!(no_monitors);
                assert!(!overwrite);
            }
            other => panic!("unexpected command {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn overwrite_is_opt_in() -> anyhow::Result<()> {
        let args =
            Args::try_parse_from(["bm-runner", "run", "c.toml", "-n", "x", "--overwrite"])?;
        assert!(matches!(args.command, Commands::Run { overwrite: true, .. }));
        Ok(())
    }

    #[test]
    fn config_is_required() {
        assert!(Args::try_parse_from(["bm-runner", "plan"]).is_err());
    }
}
