use crate::jr::{build_info, config, rexec, worker::Worker};
use clap::{Parser, Subcommand};
use nix::unistd::geteuid;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "jobrunner", version, about = "linux job runner worker")]
pub struct Args {
    /// Path to worker config YAML (defaults apply when omitted)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Start a job, stream its output until it exits (Ctrl-C stops the job)
    Run {
        name: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Re-execute a command attached to its own cgroup (invoked internally as /proc/self/exe rexec)
    Rexec {
        name: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Print local build info
    Version,
}

pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    if matches!(args.cmd, Cmd::Version) {
        println!("{}", build_info::banner());
        return Ok(());
    }
    let cfg = match &args.config {
        Some(path) => config::load(path)?,
        None => config::WorkerConfig::default(),
    };

    match args.cmd {
        Cmd::Rexec { name, args } => {
            let code = rexec::run(&cfg, &name, &args)?;
            std::process::exit(code);
        }
        Cmd::Run { name, args } => {
            // Fail fast: namespace and cgroup setup both need root.
            anyhow::ensure!(
                geteuid().is_root(),
                "jobrunner run must be started as root"
            );
            run_one_job(cfg, &name, &args).await
        }
        Cmd::Version => unreachable!("handled before config load"),
    }
}

async fn run_one_job(
    cfg: config::WorkerConfig,
    name: &str,
    args: &[String],
) -> anyhow::Result<()> {
    let worker = Arc::new(Worker::new(cfg));
    let handle = worker.start(name, args)?;
    eprintln!("job {handle}");

    let token = CancellationToken::new();
    {
        let worker = Arc::clone(&worker);
        let handle = handle.clone();
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if let Err(e) = worker.stop(&handle) {
                    warn!(handle = %handle, "stopping job: {e}");
                }
                token.cancel();
            }
        });
    }

    let mut output = worker.output(token, &handle)?;
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = output.recv().await {
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
    }

    let status = worker.status(&handle)?;
    eprintln!("{}", serde_json::to_string(&status)?);
    Ok(())
}
