use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Command, FromArgMatches as _};

use crate::config::load_model;
use crate::error::StageflowError;
use crate::log::{set_log_level, warn, LevelFilter};
use crate::model::Model;
use crate::report::{write_results, write_results_to};

/// Default cli arguments for the stageflow runner
#[derive(Args, Debug)]
pub struct BaseArgs {
    /// Path to the JSON model file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Optional path for the CSV results. Results are printed to stdout when omitted
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Enable logging at the given level (error, warn, info, debug, trace)
    #[arg(short, long)]
    pub log_level: Option<String>,
}

fn create_stageflow_cli() -> Command {
    let cli = Command::new("stageflow");
    BaseArgs::augment_args(cli)
}

/// Runs a simulation described by the command line arguments
///
/// # Errors
/// Returns an error if argument parsing, loading the model, the run or writing the results fails
pub fn run_with_args() -> Result<Model, Box<dyn std::error::Error>> {
    let cli = create_stageflow_cli();
    let matches = cli.get_matches();

    let base_args_matches = BaseArgs::from_arg_matches(&matches)?;
    Ok(run_with_args_internal(base_args_matches)?)
}

/// Loads, runs and reports the model named by `args`, returning the finished model.
///
/// # Errors
/// Returns an error if the log level is unknown, or loading the model, the run or writing the
/// results fails
pub fn run_with_args_internal(args: BaseArgs) -> Result<Model, StageflowError> {
    if let Some(level) = &args.log_level {
        let level = LevelFilter::from_str(level).map_err(|_| {
            StageflowError::ConfigError(format!("unknown log level {level}"))
        })?;
        set_log_level(level);
    }

    let mut model = load_model(&args.config)?;
    model.run()?;

    let violations = model.violations().count();
    if violations > 0 {
        warn!("{violations} modeling violations were clamped during the run");
    }

    let results = model.results();
    match &args.output {
        Some(path) => write_results(path, &results)?,
        None => write_results_to(io::stdout().lock(), &results)?,
    }
    Ok(model)
}
