//! Command-line interface of the fair-exchange benchmark.
//!
//! Four subcommands: `run` executes one protocol/strategy combination,
//! `bulk-execute` sweeps a configured protocol/size matrix,
//! `list-protocols` and `list-strategies` print the registry. A hidden
//! fifth subcommand re-executes the binary as an isolated party process.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use fairbench::environments::EnvironmentsConfiguration;
use fairbench::errors::BenchError;
use fairbench::process::{run_party, PartySpec, PARTY_SUBCOMMAND};
use fairbench::protocols::{find_protocol, protocol_specs, ProtocolParams, Role};
use fairbench::simulation::{Simulation, SimulationResultCollector};

const DEFAULT_PRICE: u128 = 1_000_000_000;
const DEFAULT_ENVIRONMENTS_FILE: &str = ".environments.yaml";
const DEFAULT_BULK_CONFIG: &str = "default-bulk-config.yaml";
const DEFAULT_DATA_TEMPLATE: &str = "testdata/fairbench-test-%s.bin";
const DEFAULT_TARGET_ITERATIONS: u32 = 1000;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_usage() {
    eprintln!("Usage: fairbench [-l LEVEL] <run|bulk-execute|list-protocols|list-strategies> ...");
    eprintln!("  -l, --log-level {{DEBUG,INFO,WARNING,ERROR,CRITICAL}} (default WARNING)");
}

fn print_run_help() {
    eprintln!(
        "Usage: fairbench run <protocol> <seller_strategy> <buyer_strategy> <file> [flags]"
    );
    eprintln!("  --price N                    price to be paid for the file");
    eprintln!("  -n, --iterations N           number of exchanges to be simulated");
    eprintln!("  -p, --protocol-parameter K V pass additional parameters to the protocol");
    eprintln!("  -e, --environments-configuration FILE (default {DEFAULT_ENVIRONMENTS_FILE})");
    eprintln!("  --output-csv PATH            write CSV file with results");
}

fn print_bulk_help() {
    eprintln!("Usage: fairbench bulk-execute [flags]");
    eprintln!("  -c, --bulk-config FILE       (default {DEFAULT_BULK_CONFIG})");
    eprintln!("  --target-iterations N        (default {DEFAULT_TARGET_ITERATIONS})");
    eprintln!("  --data-filename-template T   (default {DEFAULT_DATA_TEMPLATE})");
    eprintln!("  --price N                    price to be paid for the file");
    eprintln!("  -e, --environments-configuration FILE (default {DEFAULT_ENVIRONMENTS_FILE})");
}

fn init_logging(level: &str) {
    let filter = match level {
        "DEBUG" => log::LevelFilter::Debug,
        "INFO" => log::LevelFilter::Info,
        "WARNING" => log::LevelFilter::Warn,
        "ERROR" | "CRITICAL" => log::LevelFilter::Error,
        other => fatal(&format!(
            "invalid log level '{other}' (choose from DEBUG, INFO, WARNING, ERROR, CRITICAL)"
        )),
    };
    env_logger::Builder::new().filter_level(filter).init();
}

/// Pulls the global `-l/--log-level` flag out of the argument list.
fn extract_log_level(args: Vec<String>) -> (String, Vec<String>) {
    let mut level = "WARNING".to_string();
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "-l" || arg == "--log-level" {
            match iter.next() {
                Some(value) => level = value,
                None => fatal("missing value for --log-level"),
            }
        } else {
            rest.push(arg);
        }
    }
    (level, rest)
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // The hidden party subcommand configures its own logging from the
    // spec it receives on stdin.
    if args.first().map(String::as_str) == Some(PARTY_SUBCOMMAND) {
        std::process::exit(cmd_run_party());
    }

    let (log_level, rest) = extract_log_level(args);
    init_logging(&log_level);

    let exit_code = match rest.first().map(String::as_str) {
        Some("run") => cmd_run(&rest[1..], &log_level),
        Some("bulk-execute") => cmd_bulk_execute(&rest[1..], &log_level),
        Some("list-protocols") => cmd_list_protocols(),
        Some("list-strategies") => cmd_list_strategies(&rest[1..]),
        _ => {
            print_usage();
            1
        }
    };
    std::process::exit(exit_code);
}

fn report(err: &BenchError) -> i32 {
    log::error!("{err}");
    eprintln!("{err}");
    1
}

fn cmd_run(args: &[String], log_level: &str) -> i32 {
    let mut positional: Vec<String> = Vec::new();
    let mut price = DEFAULT_PRICE;
    let mut iterations: u32 = 1;
    let mut extra: BTreeMap<String, String> = BTreeMap::new();
    let mut environments_file = DEFAULT_ENVIRONMENTS_FILE.to_string();
    let mut output_csv: Option<PathBuf> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--price" => match iter.next().map(|value| value.parse::<u128>()) {
                Some(Ok(value)) => price = value,
                _ => fatal("invalid or missing value for --price"),
            },
            "-n" | "--iterations" => match iter.next().map(|value| value.parse::<u32>()) {
                Some(Ok(value)) => iterations = value,
                _ => fatal("invalid or missing value for --iterations"),
            },
            "-p" | "--protocol-parameter" => match (iter.next(), iter.next()) {
                (Some(key), Some(value)) => {
                    extra.insert(key.replace('-', "_"), value.clone());
                }
                _ => fatal("--protocol-parameter needs KEY and VALUE"),
            },
            "-e" | "--environments-configuration" => match iter.next() {
                Some(value) => environments_file = value.clone(),
                None => fatal("missing value for --environments-configuration"),
            },
            "--output-csv" => match iter.next() {
                Some(value) => output_csv = Some(PathBuf::from(value)),
                None => fatal("missing value for --output-csv"),
            },
            "-h" | "--help" => {
                print_run_help();
                return 0;
            }
            other => positional.push(other.to_string()),
        }
    }

    if positional.len() != 4 {
        print_run_help();
        return 1;
    }
    let [protocol, seller_strategy, buyer_strategy, filename] = [
        positional[0].as_str(),
        positional[1].as_str(),
        positional[2].as_str(),
        positional[3].as_str(),
    ];

    let environments = match EnvironmentsConfiguration::load(&environments_file) {
        Ok(environments) => environments,
        Err(err) => return report(&err),
    };
    let params = ProtocolParams {
        filename: PathBuf::from(filename),
        price,
        extra,
    };

    run_simulation(
        environments,
        protocol,
        params,
        seller_strategy,
        buyer_strategy,
        iterations,
        log_level,
        output_csv.as_deref(),
    )
}

#[allow(clippy::too_many_arguments)]
fn run_simulation(
    environments: EnvironmentsConfiguration,
    protocol: &str,
    params: ProtocolParams,
    seller_strategy: &str,
    buyer_strategy: &str,
    iterations: u32,
    log_level: &str,
    output_csv: Option<&Path>,
) -> i32 {
    let mut simulation = match Simulation::new(
        environments,
        protocol,
        params,
        seller_strategy,
        buyer_strategy,
        iterations,
        log_level,
    ) {
        Ok(simulation) => simulation,
        Err(err) => return report(&err),
    };
    let mut collector = match SimulationResultCollector::new(output_csv) {
        Ok(collector) => collector,
        Err(err) => return report(&err),
    };
    if let Err(err) = simulation.run(&mut collector) {
        return report(&err);
    }
    print!("{}", collector.result());
    0
}

#[derive(serde::Deserialize)]
struct BulkProtocolEntry {
    name: String,
    #[serde(default)]
    parameters: BTreeMap<String, serde_yaml::Value>,
}

#[derive(serde::Deserialize)]
struct BulkConfig {
    protocols: Vec<BulkProtocolEntry>,
    sizes: Vec<u64>,
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(text) => Some(text.clone()),
        serde_yaml::Value::Number(number) => Some(number.to_string()),
        serde_yaml::Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn cmd_bulk_execute(args: &[String], log_level: &str) -> i32 {
    let mut bulk_config_file = DEFAULT_BULK_CONFIG.to_string();
    let mut target_iterations = DEFAULT_TARGET_ITERATIONS;
    let mut data_template = DEFAULT_DATA_TEMPLATE.to_string();
    let mut price = DEFAULT_PRICE;
    let mut environments_file = DEFAULT_ENVIRONMENTS_FILE.to_string();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--bulk-config" => match iter.next() {
                Some(value) => bulk_config_file = value.clone(),
                None => fatal("missing value for --bulk-config"),
            },
            "--target-iterations" => match iter.next().map(|value| value.parse::<u32>()) {
                Some(Ok(value)) if value > 0 => target_iterations = value,
                _ => fatal("invalid or missing value for --target-iterations"),
            },
            "--data-filename-template" => match iter.next() {
                Some(value) => data_template = value.clone(),
                None => fatal("missing value for --data-filename-template"),
            },
            "--price" => match iter.next().map(|value| value.parse::<u128>()) {
                Some(Ok(value)) => price = value,
                _ => fatal("invalid or missing value for --price"),
            },
            "-e" | "--environments-configuration" => match iter.next() {
                Some(value) => environments_file = value.clone(),
                None => fatal("missing value for --environments-configuration"),
            },
            "-h" | "--help" => {
                print_bulk_help();
                return 0;
            }
            other => fatal(&format!("unknown bulk-execute argument '{other}'")),
        }
    }

    let contents = match std::fs::read_to_string(&bulk_config_file) {
        Ok(contents) => contents,
        Err(err) => {
            eprintln!("could not read bulk config {bulk_config_file}: {err}");
            return 1;
        }
    };
    let bulk: BulkConfig = match serde_yaml::from_str(&contents) {
        Ok(bulk) => bulk,
        Err(err) => {
            eprintln!("invalid bulk config {bulk_config_file}: {err}");
            return 1;
        }
    };
    if bulk.protocols.is_empty() || bulk.sizes.is_empty() {
        eprintln!("bulk config must list at least one protocol and one size");
        return 1;
    }

    let environments = match EnvironmentsConfiguration::load(&environments_file) {
        Ok(environments) => environments,
        Err(err) => return report(&err),
    };

    let combinations = (bulk.protocols.len() * bulk.sizes.len()) as u32;
    let iterations = (target_iterations / combinations).max(1);

    for entry in &bulk.protocols {
        for size in &bulk.sizes {
            let filename = data_template.replace("%s", &size.to_string());
            println!(
                "=== {} on {} ({} iterations) ===",
                entry.name, filename, iterations
            );
            let mut extra = BTreeMap::new();
            for (key, value) in &entry.parameters {
                match yaml_scalar_to_string(value) {
                    Some(text) => {
                        extra.insert(key.replace('-', "_"), text);
                    }
                    None => {
                        eprintln!("parameter {key} of {} is not a scalar", entry.name);
                        return 1;
                    }
                }
            }
            let params = ProtocolParams {
                filename: PathBuf::from(&filename),
                price,
                extra,
            };
            let code = run_simulation(
                environments.clone(),
                &entry.name,
                params,
                "Faithful",
                "Faithful",
                iterations,
                log_level,
                None,
            );
            if code != 0 {
                return code;
            }
        }
    }
    0
}

fn cmd_list_protocols() -> i32 {
    for spec in protocol_specs() {
        println!("{}", spec.name);
    }
    0
}

fn cmd_list_strategies(args: &[String]) -> i32 {
    let Some(protocol) = args.first() else {
        eprintln!("Usage: fairbench list-strategies <protocol>");
        return 1;
    };
    let spec = match find_protocol(protocol) {
        Ok(spec) => spec,
        Err(err) => return report(&err),
    };
    for (role, strategies) in [
        ("Seller", spec.strategies(Role::Seller)),
        ("Buyer", spec.strategies(Role::Buyer)),
    ] {
        println!("Strategies for {role}:");
        for strategy in strategies {
            println!("  * {strategy}");
        }
    }
    0
}

fn cmd_run_party() -> i32 {
    let mut input = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("could not read party spec: {err}");
        return 1;
    }
    let spec: PartySpec = match serde_json::from_str(&input) {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("invalid party spec: {err}");
            return 1;
        }
    };
    init_logging(&spec.log_level);

    match run_party(&spec) {
        Ok(result) => match serde_json::to_string(&result) {
            Ok(encoded) => {
                println!("{encoded}");
                0
            }
            Err(err) => {
                log::error!("could not encode result: {err}");
                1
            }
        },
        Err(err) => {
            log::error!("{} strategy failed: {err}", spec.role);
            1
        }
    }
}
