use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "rollout")]
#[command(
    version,
    about = "Deploy the platform phase by phase, with a confirmation before each"
)]
pub struct Cli {
    #[arg(short, long)]
    pub verbose: bool,

    /// Answer every confirmation with its default (unattended/CI runs)
    #[arg(short, long)]
    pub yes: bool,

    /// Run only these phases (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Start at this phase
    #[arg(long)]
    pub from: Option<String>,

    /// Print the phase catalog and exit
    #[arg(long)]
    pub list: bool,

    /// Print every step's command without running anything
    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub project_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let project_dir = cli.project_dir.clone().unwrap_or_else(|| PathBuf::from("."));

    let result = if cli.list {
        cmd::list::print_catalog(&cli, &project_dir)
    } else if cli.dry_run {
        cmd::run::dry_run(&cli, &project_dir)
    } else {
        cmd::run::run_pipeline(&cli, &project_dir).await
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
