use std::env;
use std::num::NonZeroUsize;
use std::path::Path;
use std::process;
use std::thread;

use bytesize::ByteSize;
use clap::{Arg, Command};

use recsort::{generate, verify, DistributedSorter, ExternalSorterBuilder, LocalCluster};

fn main() {
    let matches = match build_arg_parser().try_get_matches() {
        Ok(matches) => matches,
        Err(err)
            if err.kind() == clap::ErrorKind::DisplayHelp
                || err.kind() == clap::ErrorKind::DisplayVersion =>
        {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };

    init_logger(matches.get_one::<String>("log_level").expect("value has a default"));

    match matches.subcommand() {
        Some(("sort", sub)) => run_sort(sub),
        Some(("dist-sort", sub)) => run_dist_sort(sub),
        Some(("generate", sub)) => run_generate(sub),
        Some(("verify", sub)) => run_verify(sub),
        _ => unreachable!("a subcommand is required"),
    }
}

fn run_sort(matches: &clap::ArgMatches) {
    let input = matches.get_one::<String>("input").expect("value is required");
    let output = matches.get_one::<String>("output").expect("value is required");
    let threads = parse_or_exit::<usize>(matches, "threads");
    let fan_in = parse_or_exit::<usize>(matches, "fan_in");
    let chunk_size = matches
        .get_one::<String>("chunk_size")
        .expect("value has a default")
        .parse::<ByteSize>()
        .unwrap_or_else(|err| {
            log::error!("chunk size format incorrect: {}", err);
            process::exit(1);
        });

    let sorter = ExternalSorterBuilder::new()
        .with_threads(threads)
        .with_chunk_bytes(chunk_size.as_u64())
        .with_fan_in(fan_in)
        .build()
        .unwrap_or_else(|err| {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        });

    match sorter.sort(Path::new(input), Path::new(output)) {
        Ok(summary) => println!(
            "sorted {} records ({} runs) from {} into {}",
            summary.records, summary.runs, input, output
        ),
        Err(err) => {
            log::error!("sort failed: {}", err);
            process::exit(1);
        }
    }
}

fn run_dist_sort(matches: &clap::ArgMatches) {
    let input = matches.get_one::<String>("input").expect("value is required");
    let output = matches.get_one::<String>("output").expect("value is required");

    let workers = match env::var("RECSORT_WORKERS") {
        Ok(value) => match value.parse::<usize>() {
            Ok(workers) if workers > 0 => workers,
            _ => {
                log::error!("RECSORT_WORKERS must be a positive integer, got {:?}", value);
                process::exit(1);
            }
        },
        Err(_) => thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
    };
    // Fewer sort threads per worker as the worker count grows, to avoid
    // oversubscribing the node.
    let threads = if workers >= 8 {
        2
    } else if workers >= 4 {
        3
    } else {
        4
    };
    log::info!("starting {} workers with {} sort threads each", workers, threads);

    LocalCluster::run(workers, |comm| {
        match DistributedSorter::new(comm, Some(threads), None) {
            Ok(sorter) => sorter.sort(Path::new(input), Path::new(output)),
            Err(err) => {
                log::error!("worker initialization failed: {}", err);
                process::exit(1);
            }
        }
    });
}

fn run_generate(matches: &clap::ArgMatches) {
    let output = matches.get_one::<String>("output").expect("value is required");
    let count = parse_or_exit::<u64>(matches, "count");
    let payload_size = matches
        .get_one::<String>("payload_size")
        .map(|value| match value.parse::<u32>() {
            Ok(size) => size,
            Err(err) => {
                log::error!("invalid payload size {:?}: {}", value, err);
                process::exit(1);
            }
        });

    match generate::generate_input(Path::new(output), count, payload_size) {
        Ok(bytes) => println!("generated {} records ({} bytes) into {}", count, bytes, output),
        Err(err) => {
            log::error!("generation failed: {}", err);
            process::exit(1);
        }
    }
}

fn run_verify(matches: &clap::ArgMatches) {
    let file = matches.get_one::<String>("file").expect("value is required");
    match verify::verify(Path::new(file)) {
        Ok(records) => println!("{}: {} records in ascending key order", file, records),
        Err(err) => {
            log::error!("verification failed: {}", err);
            process::exit(1);
        }
    }
}

fn parse_or_exit<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> T
where
    T::Err: std::fmt::Display,
{
    let value = matches.get_one::<String>(name).expect("value is required");
    value.parse().unwrap_or_else(|err| {
        log::error!("invalid value {:?} for {}: {}", value, name, err);
        process::exit(1);
    })
}

fn build_arg_parser() -> Command<'static> {
    Command::new("recsort")
        .about("out-of-core sorter for keyed binary records")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .global(true)
                .default_value("info")
                .value_parser(["off", "error", "warn", "info", "debug", "trace"]),
        )
        .subcommand(
            Command::new("sort")
                .about("sort a record file on this machine")
                .arg(Arg::new("input").help("file to be sorted").required(true))
                .arg(Arg::new("output").help("result file").required(true))
                .arg(Arg::new("threads").help("number of sort threads").required(true))
                .arg(
                    Arg::new("chunk_size")
                        .short('c')
                        .long("chunk-size")
                        .help("per-chunk byte budget")
                        .takes_value(true)
                        .default_value("1GiB"),
                )
                .arg(
                    Arg::new("fan_in")
                        .short('k')
                        .long("fan-in")
                        .help("runs merged at once")
                        .takes_value(true)
                        .default_value("10"),
                ),
        )
        .subcommand(
            Command::new("dist-sort")
                .about("sort a record file across cooperating workers (RECSORT_WORKERS)")
                .arg(Arg::new("input").help("file to be sorted").required(true))
                .arg(Arg::new("output").help("result file").required(true)),
        )
        .subcommand(
            Command::new("generate")
                .about("write a reproducible synthetic record file")
                .arg(Arg::new("output").help("destination file").required(true))
                .arg(Arg::new("count").help("number of records").required(true))
                .arg(Arg::new("payload_size").help("fixed payload size in bytes; random if omitted")),
        )
        .subcommand(
            Command::new("verify")
                .about("check that a file is a valid, ascending record sequence")
                .arg(Arg::new("file").help("file to verify").required(true)),
        )
}

fn init_logger(level: &str) {
    env_logger::Builder::new()
        .filter_level(match level {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        })
        .format_timestamp_millis()
        .init();
}
