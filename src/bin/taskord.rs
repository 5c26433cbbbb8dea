//! Client CLI entry point:
//!   `<bin> execute <expected_ms> {-u|-p} <command_line>`
//!   `<bin> status`
//!   `<bin> help`
//! Exit 0 on success, 1 on usage/transport failure, 2 on a server-reported
//! error.

use std::process::ExitCode;
use taskord::client::{self, StatusOutcome, SubmitOutcome};

const USAGE: &str = "usage: taskord execute <expected_ms> {-u|-p} <command_line>\n       taskord status\n       taskord help";

enum Outcome {
    Ok,
    ServerError,
}

fn run() -> anyhow::Result<Outcome> {
    taskord::logging::init();
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("help") => {
            println!("{}", USAGE);
            Ok(Outcome::Ok)
        }
        Some("status") => run_status(),
        Some("execute") => run_execute(&args[1..]),
        _ => anyhow::bail!("{}", USAGE),
    }
}

fn run_execute(args: &[String]) -> anyhow::Result<Outcome> {
    if args.len() < 3 {
        anyhow::bail!("{}", USAGE);
    }
    let expected_ms: u32 = args[0]
        .parse()
        .map_err(|_| anyhow::anyhow!("expected_ms must be a non-negative integer, got '{}'", args[0]))?;
    let allow_pipeline = match args[1].as_str() {
        "-u" => false,
        "-p" => true,
        other => anyhow::bail!("unknown submission flag '{}', expected -u or -p", other),
    };
    let command_line = args[2..].join(" ");

    match client::submit(expected_ms, &command_line, allow_pipeline)? {
        SubmitOutcome::Id(id) => {
            println!("TASK_ID={}", id);
            Ok(Outcome::Ok)
        }
        SubmitOutcome::Rejected(text) => {
            eprintln!("{}", text);
            Ok(Outcome::ServerError)
        }
    }
}

fn run_status() -> anyhow::Result<Outcome> {
    match client::status()? {
        StatusOutcome::Lines(lines) => {
            for line in lines {
                println!(
                    "{:?} id={} error={} c2s_fifo_us={} waiting_us={} executing_us={} s2s_fifo_us={} cmd=\"{}\"",
                    line.status,
                    line.id,
                    line.error,
                    client::format_timing_us(line.c2s_fifo_us),
                    client::format_timing_us(line.waiting_us),
                    client::format_timing_us(line.executing_us),
                    client::format_timing_us(line.s2s_fifo_us),
                    line.command_line,
                );
            }
            Ok(Outcome::Ok)
        }
        StatusOutcome::Rejected(text) => {
            eprintln!("{}", text);
            Ok(Outcome::ServerError)
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(Outcome::Ok) => ExitCode::from(0),
        Ok(Outcome::ServerError) => ExitCode::from(2),
        Err(e) => {
            eprintln!("taskord: {}", e);
            ExitCode::from(1)
        }
    }
}
