//! farmctl - CLI client for farmd
//!
//! Starts EDA jobs on the execution host and polls them.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use client::{Client, ClientError, StartJobRequest};
use farm_core::tool::ToolInvocation;
use farm_core::{JobInfo, JobState};

/// CLI client for the farmd job daemon.
#[derive(Parser)]
#[command(name = "farmctl")]
#[command(about = "Start and poll remote EDA jobs through farmd")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7800)
    #[arg(long, global = true, env = "FARMD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "FARMD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch a job and print its handle
    Start {
        /// Raw shell command to run instead of the flow tool
        #[arg(long, conflicts_with_all = ["input", "top"])]
        command: Option<String>,

        /// Design source on the execution host
        #[arg(long, requires = "top")]
        input: Option<String>,

        /// Top module name
        #[arg(long, requires = "input")]
        top: Option<String>,

        /// Process design kit
        #[arg(long)]
        pdk: Option<String>,

        /// Target clock frequency in MHz
        #[arg(long)]
        freq: Option<f64>,

        /// Clock port name
        #[arg(long)]
        clock: Option<String>,

        /// Produce a layout
        #[arg(long)]
        gds: bool,

        /// Run signoff checks
        #[arg(long)]
        signoff: bool,

        /// Job directory on the execution host (default: under jobs_root)
        #[arg(long)]
        job_dir: Option<String>,

        /// Design name recorded with a raw --command job
        #[arg(long, default_value = "")]
        design: String,

        /// Extra arguments passed to the flow tool
        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// Show a job's status
    Status {
        /// Job directory returned by `start`
        job_dir: String,

        /// Poll until the job finishes
        #[arg(long)]
        wait: bool,

        /// Seconds between polls with --wait
        #[arg(long, default_value = "10")]
        interval: u64,

        /// Give up waiting after this many seconds (0 waits forever)
        #[arg(long, default_value = "0")]
        timeout: u64,
    },

    /// Run one command on the execution host
    Exec {
        /// Command line
        command: String,

        /// Seconds before the command is abandoned
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Copy a local file to the execution host
    Upload {
        /// Local file
        file: PathBuf,

        /// Remote directory
        dir: String,

        /// Remote file name (default: local file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Download an artifact from a job's output directory
    Artifact {
        /// Job directory
        job_dir: String,

        /// File name inside output/
        name: String,

        /// Where to write it (default: ./<name>)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7800".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Start {
            command,
            input,
            top,
            pdk,
            freq,
            clock,
            gds,
            signoff,
            job_dir,
            design,
            extra,
        } => {
            let req = match (command, input, top) {
                (Some(command), _, _) => StartJobRequest {
                    job_dir,
                    command: Some(command),
                    info: Some(JobInfo {
                        tool: "shell".to_string(),
                        design,
                        frequency_mhz: freq,
                        pdk,
                    }),
                    ..Default::default()
                },
                (None, Some(input), Some(top)) => StartJobRequest {
                    job_dir,
                    tool: Some(ToolInvocation {
                        input,
                        top,
                        pdk,
                        frequency_mhz: freq,
                        clock_port: clock,
                        produce_layout: gds,
                        run_signoff: signoff,
                        extra_args: extra,
                    }),
                    ..Default::default()
                },
                _ => {
                    eprintln!("error: pass either --command or --input with --top");
                    std::process::exit(2);
                }
            };
            run_start(&client, &req).await
        }
        Command::Status {
            job_dir,
            wait,
            interval,
            timeout,
        } => run_status(&client, &job_dir, wait, interval, timeout).await,
        Command::Exec { command, timeout } => run_exec(&client, &command, timeout).await,
        Command::Upload { file, dir, name } => run_upload(&client, &file, &dir, name).await,
        Command::Artifact { job_dir, name, out } => {
            run_artifact(&client, &job_dir, &name, out).await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_start(client: &Client, req: &StartJobRequest) -> Result<i32, ClientError> {
    let handle = client.start_job(req).await?;
    render::print_job_started(&handle);
    Ok(0)
}

/// Exit status is 1 for a failed job so scripts can branch on it.
async fn run_status(
    client: &Client,
    job_dir: &str,
    wait: bool,
    interval: u64,
    timeout: u64,
) -> Result<i32, ClientError> {
    let started = Instant::now();
    let interval = Duration::from_secs(interval.max(1));
    loop {
        let status = client.job_status(job_dir).await?;
        if !wait || status.state.is_terminal() {
            render::print_status(&status);
            return Ok(i32::from(status.state == JobState::Failed));
        }
        let waited = started.elapsed().as_secs();
        if timeout > 0 && waited >= timeout {
            render::print_status(&status);
            return Err(ClientError::WaitTimeout {
                job_dir: job_dir.to_string(),
                waited_sec: waited,
            });
        }
        eprintln!(
            "{}: running ({}s elapsed), checking again in {}s",
            job_dir,
            status.elapsed_sec,
            interval.as_secs()
        );
        tokio::time::sleep(interval).await;
    }
}

async fn run_exec(client: &Client, command: &str, timeout: Option<u64>) -> Result<i32, ClientError> {
    let output = client.exec(command, timeout).await?;
    print!("{output}");
    Ok(0)
}

async fn run_upload(
    client: &Client,
    file: &Path,
    dir: &str,
    name: Option<String>,
) -> Result<i32, ClientError> {
    let filename = match name {
        Some(name) => name,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ClientError::IoError(format!("{} has no file name", file.display()))
            })?,
    };
    let content = tokio::fs::read(file).await?;
    let upload = client.upload(dir, &filename, &content).await?;
    render::print_upload(&upload);
    Ok(0)
}

async fn run_artifact(
    client: &Client,
    job_dir: &str,
    name: &str,
    out: Option<PathBuf>,
) -> Result<i32, ClientError> {
    let artifact = client.artifact(job_dir, name).await?;
    let out = out.unwrap_or_else(|| {
        PathBuf::from(name.rsplit('/').next().unwrap_or(name))
    });
    tokio::fs::write(&out, &artifact.content).await?;
    println!(
        "Saved {} ({} bytes) to {}",
        artifact.path,
        artifact.content.len(),
        out.display()
    );
    Ok(0)
}
