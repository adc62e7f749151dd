//! Simulation orchestration and result aggregation.
//!
//! Per iteration the orchestrator prepares the protocol, wires two relay
//! endpoints through the instrumented forwarder, forks one process per
//! party and collects their measurements together with the forwarder's
//! traffic counters. Results aggregate into a table with mean and standard
//! deviation rows and optionally stream into a CSV file.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use log::{debug, error};

use crate::chain::unix_now;
use crate::environments::EnvironmentsConfiguration;
use crate::errors::BenchError;
use crate::p2p::{Forwarder, ForwarderStats, JsonObjectServerStream};
use crate::process::{PartyProcess, PartySpec, StrategyProcessResult};
use crate::protocols::{find_protocol, Protocol, ProtocolParams, Role};

/// Measurements of one simulated exchange iteration.
#[derive(Debug, Clone, Default)]
pub struct IterationResult {
    /// Seller process measurements (zeroed when the process failed).
    pub seller: StrategyProcessResult,
    /// Buyer process measurements (zeroed when the process failed).
    pub buyer: StrategyProcessResult,
    /// Relay traffic counters.
    pub stats: ForwarderStats,
}

const WEI_PER_ETH: f64 = 1e18;

/// Aggregated results of a simulation run.
#[derive(Debug, Default)]
pub struct SimulationResult {
    iterations: Vec<IterationResult>,
}

impl SimulationResult {
    /// Column headers, excluding the leading `Start` column of CSV rows.
    pub fn headers() -> &'static [&'static str] {
        &[
            "S real",
            "B real",
            "S user",
            "B user",
            "S sys",
            "B sys",
            "S>B bytes",
            "B>S bytes",
            "S>B obj",
            "B>S obj",
            "S Tx Ct",
            "B Tx Ct",
            "S Tx Fees (Gas)",
            "B Tx Fees (Gas)",
            "S Funds Diff (Eth)",
            "B Funds Diff (Eth)",
        ]
    }

    fn numeric_row(result: &IterationResult) -> Vec<f64> {
        vec![
            result.seller.resources.realtime,
            result.buyer.resources.realtime,
            result.seller.resources.utime,
            result.buyer.resources.utime,
            result.seller.resources.stime,
            result.buyer.resources.stime,
            result.stats.bytes_1to2 as f64,
            result.stats.bytes_2to1 as f64,
            result.stats.objects_1to2 as f64,
            result.stats.objects_2to1 as f64,
            result.seller.tx_count as f64,
            result.buyer.tx_count as f64,
            result.seller.tx_fees_gas as f64,
            result.buyer.tx_fees_gas as f64,
            result.seller.balance_delta as f64 / WEI_PER_ETH,
            result.buyer.balance_delta as f64 / WEI_PER_ETH,
        ]
    }

    /// Formatted row values for one iteration.
    pub fn columns(result: &IterationResult) -> Vec<String> {
        Self::numeric_row(result)
            .into_iter()
            .map(format_value)
            .collect()
    }

    /// Records one iteration.
    pub fn add_iteration_result(&mut self, result: IterationResult) {
        self.iterations.push(result);
    }

    /// Number of recorded iterations.
    pub fn iteration_count(&self) -> usize {
        self.iterations.len()
    }

    /// Recorded iterations.
    pub fn iterations(&self) -> &[IterationResult] {
        &self.iterations
    }

    fn means(&self) -> Vec<f64> {
        let count = self.iterations.len().max(1) as f64;
        let mut sums = vec![0.0; Self::headers().len()];
        for iteration in &self.iterations {
            for (slot, value) in sums.iter_mut().zip(Self::numeric_row(iteration)) {
                *slot += value;
            }
        }
        sums.into_iter().map(|sum| sum / count).collect()
    }

    fn stdevs(&self) -> Vec<f64> {
        let count = self.iterations.len().max(1) as f64;
        let means = self.means();
        let mut sums = vec![0.0; Self::headers().len()];
        for iteration in &self.iterations {
            for ((slot, mean), value) in sums
                .iter_mut()
                .zip(&means)
                .zip(Self::numeric_row(iteration))
            {
                *slot += (value - mean) * (value - mean);
            }
        }
        sums.into_iter().map(|sum| (sum / count).sqrt()).collect()
    }
}

fn format_value(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.6}")
    }
}

impl fmt::Display for SimulationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rows: Vec<Vec<String>> = Vec::with_capacity(self.iterations.len() + 3);
        let mut header = vec!["#".to_string()];
        header.extend(Self::headers().iter().map(ToString::to_string));
        rows.push(header);
        for (index, iteration) in self.iterations.iter().enumerate() {
            let mut row = vec![(index + 1).to_string()];
            row.extend(Self::columns(iteration));
            rows.push(row);
        }
        let mut mean_row = vec!["Mean".to_string()];
        mean_row.extend(self.means().into_iter().map(format_value));
        rows.push(mean_row);
        let mut stdev_row = vec!["Stdev".to_string()];
        stdev_row.extend(self.stdevs().into_iter().map(format_value));
        rows.push(stdev_row);

        let columns = rows[0].len();
        let mut widths = vec![0usize; columns];
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }
        for row in &rows {
            let line: Vec<String> = row
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:>width$}"))
                .collect();
            writeln!(f, "{}", line.join("  "))?;
        }
        Ok(())
    }
}

/// Collects iteration results, optionally mirroring them into a CSV file.
pub struct SimulationResultCollector {
    result: SimulationResult,
    csv: Option<csv::Writer<std::fs::File>>,
    start: String,
}

impl SimulationResultCollector {
    /// Creates a collector; with a path, rows append to the CSV file and a
    /// header row is written when the file is empty.
    pub fn new(csv_path: Option<&Path>) -> Result<Self, BenchError> {
        let start = unix_now().to_string();
        let csv = match csv_path {
            None => None,
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| {
                        BenchError::Configuration(format!("{}: {err}", path.display()))
                    })?;
                let is_empty = file
                    .metadata()
                    .map(|metadata| metadata.len() == 0)
                    .unwrap_or(true);
                let mut writer = csv::Writer::from_writer(file);
                if is_empty {
                    let mut header = vec!["Start".to_string()];
                    header.extend(SimulationResult::headers().iter().map(ToString::to_string));
                    writer.write_record(&header).map_err(|err| {
                        BenchError::Configuration(format!("writing CSV header: {err}"))
                    })?;
                }
                Some(writer)
            }
        };
        Ok(Self {
            result: SimulationResult::default(),
            csv,
            start,
        })
    }

    /// Records one iteration and flushes it to the CSV file if configured.
    pub fn add_iteration_result(&mut self, iteration: IterationResult) -> Result<(), BenchError> {
        if let Some(writer) = &mut self.csv {
            let mut row = vec![self.start.clone()];
            row.extend(SimulationResult::columns(&iteration));
            writer
                .write_record(&row)
                .and_then(|_| writer.flush().map_err(csv::Error::from))
                .map_err(|err| BenchError::Configuration(format!("writing CSV row: {err}")))?;
        }
        self.result.add_iteration_result(iteration);
        Ok(())
    }

    /// The aggregated result.
    pub fn result(&self) -> &SimulationResult {
        &self.result
    }
}

/// Orchestrates a complete simulation run.
pub struct Simulation {
    environments: EnvironmentsConfiguration,
    protocol: Box<dyn Protocol>,
    protocol_name: String,
    params: ProtocolParams,
    seller_strategy: String,
    buyer_strategy: String,
    iterations: u32,
    log_level: String,
    tmp_dir: PathBuf,
}

impl Simulation {
    /// Validates the configuration and builds the protocol instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        environments: EnvironmentsConfiguration,
        protocol_name: &str,
        params: ProtocolParams,
        seller_strategy: &str,
        buyer_strategy: &str,
        iterations: u32,
        log_level: &str,
    ) -> Result<Self, BenchError> {
        let spec = find_protocol(protocol_name)?;
        if !spec.seller_strategies.contains(&seller_strategy) {
            return Err(BenchError::Configuration(format!(
                "unknown seller strategy '{seller_strategy}' for {protocol_name} \
                 (available: {})",
                spec.seller_strategies.join(", ")
            )));
        }
        if !spec.buyer_strategies.contains(&buyer_strategy) {
            return Err(BenchError::Configuration(format!(
                "unknown buyer strategy '{buyer_strategy}' for {protocol_name} \
                 (available: {})",
                spec.buyer_strategies.join(", ")
            )));
        }
        let protocol = (spec.build)(params.clone())?;
        let tmp_dir = std::env::temp_dir().join(format!(
            "fairbench-{}-{}",
            std::process::id(),
            unix_now()
        ));
        std::fs::create_dir_all(&tmp_dir)
            .map_err(|err| BenchError::Configuration(format!("creating tmp dir: {err}")))?;
        Ok(Self {
            environments,
            protocol,
            protocol_name: protocol_name.to_string(),
            params,
            seller_strategy: seller_strategy.to_string(),
            buyer_strategy: buyer_strategy.to_string(),
            iterations,
            log_level: log_level.to_string(),
            tmp_dir,
        })
    }

    fn party_spec(
        &self,
        role: Role,
        socket_path: PathBuf,
        snapshot: serde_json::Value,
    ) -> Result<PartySpec, BenchError> {
        let (environment, strategy, opposite) = match role {
            Role::Seller => (
                self.environments.seller.clone(),
                self.seller_strategy.clone(),
                self.environments.buyer.wallet()?.address(),
            ),
            Role::Buyer => (
                self.environments.buyer.clone(),
                self.buyer_strategy.clone(),
                self.environments.seller.wallet()?.address(),
            ),
        };
        Ok(PartySpec {
            protocol: self.protocol_name.clone(),
            params: self.params.clone(),
            snapshot,
            role,
            strategy,
            environment,
            opposite_address: opposite,
            socket_path,
            log_level: self.log_level.clone(),
        })
    }

    /// Runs all iterations, feeding results into `collector`.
    pub fn run(&mut self, collector: &mut SimulationResultCollector) -> Result<(), BenchError> {
        debug!("starting simulation");
        let operator = self.environments.operator.connect()?;
        let seller_address = self.environments.seller.wallet()?.address();
        let buyer_address = self.environments.buyer.wallet()?.address();

        debug!("setting up protocol simulation");
        self.protocol
            .set_up_simulation(&operator, seller_address, buyer_address)?;

        for iteration in 0..self.iterations {
            debug!("setting up protocol iteration {}", iteration + 1);
            self.protocol
                .set_up_iteration(&operator, seller_address, buyer_address)?;
            let snapshot = self.protocol.snapshot()?;

            let seller_socket = self.tmp_dir.join(format!("seller_{iteration}.ipc"));
            let buyer_socket = self.tmp_dir.join(format!("buyer_{iteration}.ipc"));
            let seller_endpoint = JsonObjectServerStream::bind(&seller_socket)
                .map_err(|err| BenchError::ProtocolRuntime(format!("binding relay: {err}")))?;
            let buyer_endpoint = JsonObjectServerStream::bind(&buyer_socket)
                .map_err(|err| BenchError::ProtocolRuntime(format!("binding relay: {err}")))?;
            let forwarder = Forwarder::start(seller_endpoint, buyer_endpoint);

            debug!("launching exchange protocol");
            let seller_process = PartyProcess::spawn(&self.party_spec(
                Role::Seller,
                seller_socket.clone(),
                snapshot.clone(),
            )?)?;
            let buyer_process = PartyProcess::spawn(&self.party_spec(
                Role::Buyer,
                buyer_socket.clone(),
                snapshot,
            )?)?;

            let seller_result = seller_process.join()?;
            let buyer_result = buyer_process.join()?;
            let stats = forwarder.join();

            if seller_result.is_none() || buyer_result.is_none() {
                error!("iteration {} had a failing party", iteration + 1);
            }

            debug!("tearing down protocol iteration");
            self.protocol
                .tear_down_iteration(&operator, seller_address, buyer_address)?;

            collector.add_iteration_result(IterationResult {
                seller: seller_result.unwrap_or_default(),
                buyer: buyer_result.unwrap_or_default(),
                stats,
            })?;

            let _ = std::fs::remove_file(&seller_socket);
            let _ = std::fs::remove_file(&buyer_socket);
        }

        debug!("tearing down protocol simulation");
        self.protocol
            .tear_down_simulation(&operator, seller_address, buyer_address)?;
        debug!("simulation has finished");
        Ok(())
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.tmp_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ResourceUsage;

    fn iteration(realtime: f64, gas: u128, delta: i128) -> IterationResult {
        IterationResult {
            seller: StrategyProcessResult {
                resources: ResourceUsage {
                    realtime,
                    utime: realtime / 2.0,
                    ..Default::default()
                },
                tx_count: 2,
                tx_fees_gas: gas,
                balance_delta: delta,
            },
            buyer: StrategyProcessResult {
                resources: ResourceUsage {
                    realtime,
                    ..Default::default()
                },
                tx_count: 1,
                tx_fees_gas: gas / 2,
                balance_delta: -delta,
            },
            stats: ForwarderStats {
                objects_1to2: 3,
                objects_2to1: 2,
                bytes_1to2: 4096,
                bytes_2to1: 256,
            },
        }
    }

    #[test]
    fn headers_match_csv_contract() {
        assert_eq!(SimulationResult::headers().len(), 16);
        assert_eq!(SimulationResult::headers()[0], "S real");
        assert_eq!(
            SimulationResult::headers()[15],
            "B Funds Diff (Eth)"
        );
    }

    #[test]
    fn mean_and_stdev() {
        let mut result = SimulationResult::default();
        result.add_iteration_result(iteration(1.0, 100, 1_000_000_000_000_000_000));
        result.add_iteration_result(iteration(3.0, 300, 1_000_000_000_000_000_000));
        let means = result.means();
        assert!((means[0] - 2.0).abs() < 1e-9);
        let stdevs = result.stdevs();
        assert!((stdevs[0] - 1.0).abs() < 1e-9);
        // Funds diff column is converted to ETH.
        assert!((means[14] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn table_rendering_contains_summary_rows() {
        let mut result = SimulationResult::default();
        result.add_iteration_result(iteration(1.5, 100, 0));
        let rendered = result.to_string();
        assert!(rendered.contains("S real"));
        assert!(rendered.contains("Mean"));
        assert!(rendered.contains("Stdev"));
    }

    #[test]
    fn csv_collector_writes_header_and_rows() {
        let path = std::env::temp_dir().join(format!(
            "fairbench_csv_{}.csv",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        {
            let mut collector = SimulationResultCollector::new(Some(&path)).unwrap();
            collector.add_iteration_result(iteration(1.0, 50, 0)).unwrap();
            collector.add_iteration_result(iteration(2.0, 70, 0)).unwrap();
            assert_eq!(collector.result().iteration_count(), 2);
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Start,S real,B real"));
        // Appending must not repeat the header.
        {
            let mut collector = SimulationResultCollector::new(Some(&path)).unwrap();
            collector.add_iteration_result(iteration(3.0, 90, 0)).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 4);
        std::fs::remove_file(&path).unwrap();
    }
}
