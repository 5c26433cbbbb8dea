//! Server CLI entry point: `<bin> <output_dir> <ntasks> <policy>` or
//! `<bin> help`.

use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;
use taskord::config::Policy;
use taskord::server::Server;

const USAGE: &str = "usage: taskord-server <output_dir> <ntasks> <policy={fcfs,sjf}>\n       taskord-server help";

fn run() -> anyhow::Result<()> {
    taskord::logging::init();
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.len() == 1 && args[0] == "help" {
        println!("{}", USAGE);
        return Ok(());
    }
    if args.len() != 3 {
        anyhow::bail!("{}", USAGE);
    }

    let output_dir = Path::new(&args[0]);
    let ntasks: usize = args[1]
        .parse()
        .map_err(|_| anyhow::anyhow!("ntasks must be a positive integer, got '{}'", args[1]))?;
    if ntasks == 0 {
        anyhow::bail!("ntasks must be > 0");
    }
    let policy = Policy::from_str(&args[2])?;

    if output_dir.exists() && !output_dir.is_dir() {
        anyhow::bail!("{} exists and is not a directory", output_dir.display());
    }
    std::fs::create_dir_all(output_dir)?;

    log::info!(
        "starting taskord-server: output_dir={}, ntasks={}, policy={:?}",
        output_dir.display(),
        ntasks,
        policy
    );

    let server = Server::new(policy, ntasks, output_dir)?;
    let code = server.run();
    if code != 0 {
        anyhow::bail!("server loop terminated with code {}", code);
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("taskord-server: {}", e);
            ExitCode::from(1)
        }
    }
}
