use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use subspawn::config::load_request;
use subspawn::{ExitReason, PipeEndpoint, SpawnRequest, StreamRedirection, call_capture, spawn};
use tracing::debug;

#[derive(Parser)]
#[command(name = "subspawn", version, author)]
struct Cli {
    /// Print outcomes as JSON
    #[arg(long, global = true)]
    json: bool,
    /// More log output (-v debug, -vv trace); SUBSPAWN_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct LaunchOpts {
    /// Working directory for the child
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Program to load instead of the first argument
    #[arg(long)]
    executable: Option<String>,
    /// Close every inherited descriptor above stderr
    #[arg(long)]
    close_fds: bool,
    /// Read the child's stdin from this file
    #[arg(long)]
    stdin: Option<PathBuf>,
    /// Write the child's stderr to this file
    #[arg(long)]
    stderr: Option<PathBuf>,
}

impl LaunchOpts {
    fn request(self, args: Vec<String>) -> SpawnRequest<'static> {
        let mut req = SpawnRequest::new(args).close_fds(self.close_fds);
        if let Some(dir) = self.cwd {
            req = req.cwd(dir);
        }
        if let Some(exe) = self.executable {
            req = req.executable(exe);
        }
        if let Some(path) = self.stdin {
            req = req.stdin(StreamRedirection::File(path));
        }
        if let Some(path) = self.stderr {
            req = req.stderr(StreamRedirection::File(path));
        }
        req
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and exit with its status
    Run {
        #[command(flatten)]
        opts: LaunchOpts,
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Run a command and print what it wrote to stdout
    Capture {
        #[command(flatten)]
        opts: LaunchOpts,
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Run the command described by a TOML request file
    Exec {
        #[arg(short, long)]
        request: PathBuf,
    },
    /// Validate a request file and print it normalized
    Check {
        #[arg(short, long)]
        request: PathBuf,
    },
}

/// Shell convention: exit code as is, 128 + n for signal n.
fn exit_status(reason: ExitReason) -> i32 {
    match (reason.signal(), reason.code()) {
        (Some(sig), _) => 128 + sig,
        // Windows codes above i32::MAX keep their bit pattern through exit().
        (None, Some(code)) => code as i32,
        (None, None) => 1,
    }
}

fn report(json: bool, pid: u32, reason: ExitReason) {
    if json {
        println!("{}", json!({ "pid": pid, "exit": reason }));
    } else {
        debug!(pid, %reason, "child finished");
    }
}

fn forward_output(mut from: PipeEndpoint, mut to: impl Write) -> io::Result<()> {
    io::copy(&mut from, &mut to)?;
    to.flush()?;
    from.close()
}

fn exec(path: PathBuf, json: bool) -> Result<i32> {
    let file = load_request(&path)?;
    let request = file.to_spawn_request()?;
    let mut child = spawn(request).with_context(|| format!("spawning {}", file.args[0]))?;

    // Not joined: our own stdin may stay open long after the child is gone.
    if let Some(mut input) = child.stdin.take() {
        thread::spawn(move || {
            if let Err(e) = io::copy(&mut io::stdin().lock(), &mut input).and_then(|_| input.close())
            {
                debug!("stdin forwarding stopped: {e}");
            }
        });
    }

    let (out, err) = (child.stdout.take(), child.stderr.take());
    thread::scope(|s| -> Result<()> {
        let errors = err.map(|end| s.spawn(move || forward_output(end, io::stderr())));
        if let Some(end) = out {
            forward_output(end, io::stdout()).context("forwarding child stdout")?;
        }
        if let Some(h) = errors {
            h.join()
                .map_err(|_| anyhow::anyhow!("stderr forwarder panicked"))?
                .context("forwarding child stderr")?;
        }
        Ok(())
    })?;

    let reason = child.process.wait()?;
    report(json, child.process.id(), reason);
    Ok(exit_status(reason))
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run { opts, args } => {
            let mut child = spawn(opts.request(args))?;
            let reason = child.process.wait()?;
            report(cli.json, child.process.id(), reason);
            Ok(exit_status(reason))
        }
        Commands::Capture { opts, args } => {
            let captured = call_capture(opts.request(args))?;
            if cli.json {
                println!(
                    "{}",
                    json!({ "exit": captured.exit, "stdout": captured.stdout_str() })
                );
            } else {
                io::stdout().write_all(&captured.stdout)?;
            }
            Ok(exit_status(captured.exit))
        }
        Commands::Exec { request } => exec(request, cli.json),
        Commands::Check { request } => {
            let file = load_request(&request)?;
            file.to_spawn_request()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&file)?);
            } else {
                print!("{file}");
            }
            Ok(0)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    subspawn::logging::init(cli.verbose)?;
    let code = run(cli)?;
    std::process::exit(code)
}
