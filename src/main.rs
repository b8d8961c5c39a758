use std::path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use net_sort::{Cluster, LocalSorterBuilder, RetryPolicy, ShuffleConfig, ShuffleNode, RECORD_SIZE};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let server_id: usize = arg_parser.value_of_t_or_exit("server_id");
    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");
    let config = arg_parser.value_of("config").expect("value is required");
    let deadline: u64 = arg_parser.value_of_t_or_exit("deadline");
    let retries: u32 = arg_parser.value_of_t_or_exit("retries");
    let backoff: u64 = arg_parser.value_of_t_or_exit("backoff");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let cluster = match Cluster::from_path(path::Path::new(config)) {
        Ok(cluster) => cluster,
        Err(err) => {
            log::error!("cluster configuration error: {}", err);
            process::exit(1);
        }
    };

    let shuffle_config = ShuffleConfig {
        deadline: (deadline > 0).then(|| Duration::from_secs(deadline)),
        retry: RetryPolicy {
            attempts: retries,
            backoff: Duration::from_millis(backoff),
        },
        ..ShuffleConfig::default()
    };

    let mut sorter_builder = LocalSorterBuilder::new();
    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }
    let sorter = match sorter_builder.build() {
        Ok(sorter) => Arc::new(sorter),
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!("runtime initialization error: {}", err);
            process::exit(1);
        }
    };

    let report = runtime.block_on(async {
        let input_stream = match tokio::fs::File::open(input).await {
            Ok(file) => tokio::io::BufReader::new(file),
            Err(err) => {
                log::error!("input file opening error: {}", err);
                process::exit(1);
            }
        };

        let node = match ShuffleNode::bind(cluster, server_id, shuffle_config).await {
            Ok(node) => node,
            Err(err) => {
                log::error!("node initialization error: {}", err);
                process::exit(1);
            }
        };

        match node.run(input_stream, sorter.clone()).await {
            Ok(report) => report,
            Err(err) => {
                log::error!("shuffle error: {}", err);
                process::exit(1);
            }
        }
    });

    if let Err(err) = sorter.write_to_path(&report.records, path::Path::new(output)) {
        log::error!("data saving error: {}", err);
        process::exit(1);
    }

    log::info!(
        "node {} done: {} records ({})",
        report.node_id,
        report.records.len(),
        ByteSize((report.records.len() * RECORD_SIZE) as u64)
    );
    println!("{}", report.records.len());
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("net-sort")
        .about("distributed sort node")
        .arg(
            clap::Arg::new("server_id")
                .help("id of this node in the cluster configuration")
                .required(true)
                .index(1),
        )
        .arg(
            clap::Arg::new("input")
                .help("file with the records of this node")
                .required(true)
                .index(2),
        )
        .arg(
            clap::Arg::new("output")
                .help("file receiving the sorted records owned by this node")
                .required(true)
                .index(3),
        )
        .arg(
            clap::Arg::new("config")
                .help("cluster configuration file")
                .required(true)
                .index(4),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("deadline")
                .short('d')
                .long("deadline")
                .help("seconds to wait for every peer to finish, 0 waits forever")
                .takes_value(true)
                .default_value("300"),
        )
        .arg(
            clap::Arg::new("retries")
                .short('r')
                .long("retries")
                .help("connection attempts per record")
                .takes_value(true)
                .default_value("10"),
        )
        .arg(
            clap::Arg::new("backoff")
                .short('b')
                .long("backoff-ms")
                .help("milliseconds between two connection attempts")
                .takes_value(true)
                .default_value("50"),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel sorting")
                .takes_value(true),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
