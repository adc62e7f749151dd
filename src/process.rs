//! Party processes: each role runs in its own OS process so adversarial
//! strategies cannot share state.
//!
//! The parent serializes a [`PartySpec`] to the child's stdin; the child
//! reconstructs protocol and strategy through the registry, runs the
//! strategy, and writes a [`StrategyProcessResult`] as a single JSON line
//! on stdout. Logs go to stderr only.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Instant;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::abi::Address;
use crate::environments::EnvironmentConfig;
use crate::errors::BenchError;
use crate::p2p::JsonObjectStream;
use crate::protocols::{find_protocol, ProtocolParams, Role};

/// Hidden subcommand under which the binary re-executes itself as a party.
pub const PARTY_SUBCOMMAND: &str = "__run-party";

/// Everything a party process needs to reconstruct its side of one
/// iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartySpec {
    /// Protocol name in the registry.
    pub protocol: String,
    /// Protocol parameters.
    pub params: ProtocolParams,
    /// Per-iteration protocol snapshot (contract addresses, channel
    /// parameters, deposits).
    pub snapshot: Value,
    /// Role this process plays.
    pub role: Role,
    /// Strategy name for the role.
    pub strategy: String,
    /// Chain endpoint and wallet of the role.
    pub environment: EnvironmentConfig,
    /// Address of the opposite party.
    pub opposite_address: Address,
    /// UNIX socket path of this party's relay endpoint.
    pub socket_path: PathBuf,
    /// Log level to configure in the child.
    pub log_level: String,
}

/// getrusage-style counter deltas over one strategy run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Wall-clock seconds.
    pub realtime: f64,
    /// User CPU seconds.
    pub utime: f64,
    /// System CPU seconds.
    pub stime: f64,
    /// Maximum resident set size delta.
    pub maxrss: i64,
    /// Integral shared memory size delta.
    pub ixrss: i64,
    /// Integral unshared data size delta.
    pub idrss: i64,
    /// Integral unshared stack size delta.
    pub isrss: i64,
    /// Soft page faults.
    pub minflt: i64,
    /// Hard page faults.
    pub majflt: i64,
    /// Swaps.
    pub nswap: i64,
    /// Block input operations.
    pub inblock: i64,
    /// Block output operations.
    pub oublock: i64,
    /// IPC messages sent.
    pub msgsnd: i64,
    /// IPC messages received.
    pub msgrcv: i64,
    /// Signals received.
    pub nsignals: i64,
    /// Voluntary context switches.
    pub nvcsw: i64,
    /// Involuntary context switches.
    pub nivcsw: i64,
}

fn rusage_self() -> libc::rusage {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    unsafe {
        libc::getrusage(libc::RUSAGE_SELF, &mut usage);
    }
    usage
}

fn timeval_seconds(value: libc::timeval) -> f64 {
    value.tv_sec as f64 + value.tv_usec as f64 / 1_000_000.0
}

impl ResourceUsage {
    fn delta(start: &libc::rusage, end: &libc::rusage, realtime: f64) -> Self {
        Self {
            realtime,
            utime: timeval_seconds(end.ru_utime) - timeval_seconds(start.ru_utime),
            stime: timeval_seconds(end.ru_stime) - timeval_seconds(start.ru_stime),
            maxrss: end.ru_maxrss - start.ru_maxrss,
            ixrss: end.ru_ixrss - start.ru_ixrss,
            idrss: end.ru_idrss - start.ru_idrss,
            isrss: end.ru_isrss - start.ru_isrss,
            minflt: end.ru_minflt - start.ru_minflt,
            majflt: end.ru_majflt - start.ru_majflt,
            nswap: end.ru_nswap - start.ru_nswap,
            inblock: end.ru_inblock - start.ru_inblock,
            oublock: end.ru_oublock - start.ru_oublock,
            msgsnd: end.ru_msgsnd - start.ru_msgsnd,
            msgrcv: end.ru_msgrcv - start.ru_msgrcv,
            nsignals: end.ru_nsignals - start.ru_nsignals,
            nvcsw: end.ru_nvcsw - start.ru_nvcsw,
            nivcsw: end.ru_nivcsw - start.ru_nivcsw,
        }
    }
}

/// Measurements one party process reports back to the parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyProcessResult {
    /// Resource counter deltas over the strategy run.
    pub resources: ResourceUsage,
    /// Transactions submitted to the chain.
    pub tx_count: u64,
    /// Total gas paid for those transactions.
    pub tx_fees_gas: u128,
    /// Balance change of the party's wallet in wei.
    pub balance_delta: i128,
}

/// Executes one party inside the current (child) process.
pub fn run_party(spec: &PartySpec) -> Result<StrategyProcessResult, BenchError> {
    let registry_entry = find_protocol(&spec.protocol)?;
    let mut protocol = (registry_entry.build)(spec.params.clone())?;
    protocol.restore(&spec.snapshot)?;
    // Strategy construction happens before measurement starts, so one-off
    // preparation (hashing the expected file) is not billed to the run.
    let mut strategy = protocol.make_strategy(spec.role, &spec.strategy)?;

    let environment = spec.environment.connect()?;
    let mut p2p = JsonObjectStream::connect(&spec.socket_path)
        .map_err(|err| BenchError::ProtocolRuntime(format!("p2p connect: {err}")))?;

    let balance_before = environment.balance()?;
    let clock = Instant::now();
    let usage_before = rusage_self();

    let outcome = strategy.run(&environment, &mut p2p, spec.opposite_address);

    let usage_after = rusage_self();
    let realtime = clock.elapsed().as_secs_f64();
    p2p.close();
    let balance_after = environment.balance()?;

    outcome?;
    Ok(StrategyProcessResult {
        resources: ResourceUsage::delta(&usage_before, &usage_after, realtime),
        tx_count: environment.tx_count(),
        tx_fees_gas: environment.tx_fees_gas(),
        balance_delta: balance_after as i128 - balance_before as i128,
    })
}

/// Handle onto a spawned party process.
pub struct PartyProcess {
    child: Child,
    role: Role,
}

impl PartyProcess {
    /// Spawns the current executable as a party process for `spec`.
    pub fn spawn(spec: &PartySpec) -> Result<Self, BenchError> {
        let exe = std::env::current_exe().map_err(|err| {
            BenchError::ProtocolRuntime(format!("cannot locate own executable: {err}"))
        })?;
        let mut child = Command::new(exe)
            .arg(PARTY_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| BenchError::ProtocolRuntime(format!("spawning party: {err}")))?;

        let encoded = serde_json::to_vec(spec)
            .map_err(|err| BenchError::ProtocolRuntime(format!("encoding party spec: {err}")))?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(&encoded)
            .map_err(|err| BenchError::ProtocolRuntime(format!("writing party spec: {err}")))?;

        debug!("spawned {} process (pid {})", spec.role, child.id());
        Ok(Self {
            child,
            role: spec.role,
        })
    }

    /// Waits for the party to exit and parses its result.
    ///
    /// A failing party is logged and reported as `None`; the simulation
    /// continues with the next iteration.
    pub fn join(self) -> Result<Option<StrategyProcessResult>, BenchError> {
        let output = self
            .child
            .wait_with_output()
            .map_err(|err| BenchError::ProtocolRuntime(format!("waiting for party: {err}")))?;
        if !output.status.success() {
            error!(
                "{} process exited with {:?}",
                self.role,
                output.status.code()
            );
            return Ok(None);
        }
        let result = serde_json::from_slice(&output.stdout).map_err(|err| {
            BenchError::ProtocolRuntime(format!(
                "{} process produced unreadable result: {err}",
                self.role
            ))
        })?;
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_delta_subtracts_fieldwise() {
        let mut start: libc::rusage = unsafe { std::mem::zeroed() };
        let mut end: libc::rusage = unsafe { std::mem::zeroed() };
        start.ru_maxrss = 100;
        end.ru_maxrss = 150;
        start.ru_utime = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        end.ru_utime = libc::timeval {
            tv_sec: 2,
            tv_usec: 0,
        };
        end.ru_nvcsw = 7;
        let delta = ResourceUsage::delta(&start, &end, 3.25);
        assert_eq!(delta.maxrss, 50);
        assert!((delta.utime - 0.5).abs() < 1e-9);
        assert_eq!(delta.nvcsw, 7);
        assert!((delta.realtime - 3.25).abs() < f64::EPSILON);
    }

    #[test]
    fn rusage_snapshot_is_monotonic() {
        let first = rusage_self();
        // Touch some memory so counters move.
        let data: Vec<u8> = (0..64 * 1024).map(|i| i as u8).collect();
        assert_eq!(data.len(), 64 * 1024);
        let second = rusage_self();
        assert!(timeval_seconds(second.ru_utime) >= timeval_seconds(first.ru_utime));
    }

    #[test]
    fn spec_serialization_roundtrip() {
        let spec = PartySpec {
            protocol: "Fairswap".to_string(),
            params: ProtocolParams {
                filename: PathBuf::from("/tmp/data.bin"),
                price: 1_000_000_000,
                extra: Default::default(),
            },
            snapshot: serde_json::json!({"contract": null}),
            role: Role::Buyer,
            strategy: "Faithful".to_string(),
            environment: EnvironmentConfig {
                endpoint_url: "http://localhost:8545/".to_string(),
                wallet_address: None,
                private_key: Some("0x01".to_string()),
            },
            opposite_address: Address([9u8; 20]),
            socket_path: PathBuf::from("/tmp/buyer.ipc"),
            log_level: "WARNING".to_string(),
        };
        let encoded = serde_json::to_string(&spec).unwrap();
        let decoded: PartySpec = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.protocol, "Fairswap");
        assert_eq!(decoded.role, Role::Buyer);
        assert_eq!(decoded.opposite_address, Address([9u8; 20]));
    }
}
