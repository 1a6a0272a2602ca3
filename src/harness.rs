//! Reachability harness
//!
//! Runs one ping per probe, strictly in declaration order, and keeps the
//! verbatim output. Packet loss is a result, not an error; only a substrate
//! that cannot run the probe at all stops the run.

pub mod ping;

use std::io::Write;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lab::Lab;
use crate::substrate::{Substrate, command_line};

/// A reachability check from a node to an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub source: String,
    pub destination: IpAddr,
    /// Human-readable name of the destination (e.g., "h3")
    pub label: String,
}

impl Probe {
    pub fn new(source: impl Into<String>, destination: IpAddr, label: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination,
            label: label.into(),
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub source: String,
    pub destination: IpAddr,
    pub label: String,
    pub command: String,
    pub raw_output: String,
    pub success: bool,
}

/// Totals over a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl Summary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Issues probes and collects their results
pub struct Harness {
    sink: Option<Box<dyn Write>>,
    count: u32,
    timeout: Option<Duration>,
    results: Vec<ProbeResult>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            sink: None,
            count: 1,
            timeout: None,
            results: Vec::new(),
        }
    }

    /// Write every result to `sink` as soon as it is known
    pub fn with_sink(mut self, sink: impl Write + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Bound each ping's wait for a reply
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Ping command for a destination
    fn command(&self, destination: IpAddr) -> Vec<String> {
        let mut args = vec!["ping".to_string(), "-c".to_string(), self.count.to_string()];
        if let Some(timeout) = self.timeout {
            args.push("-W".to_string());
            args.push(timeout.as_secs().max(1).to_string());
        }
        args.push(destination.to_string());
        args
    }

    /// Run probes in order, appending to the result log
    pub fn run<S: Substrate>(
        &mut self,
        lab: &mut Lab<S>,
        probes: &[Probe],
    ) -> Result<&[ProbeResult]> {
        let start = self.results.len();

        for probe in probes {
            let args = self.command(probe.destination);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let command = command_line(&args);

            info!("*** {} -> {}: {}", probe.source, probe.label, command);

            let output = lab.execute(&probe.source, &args).map_err(|e| match e {
                Error::UnknownNode(_) | Error::NotReady(_) => e,
                other => Error::ProbeExecution {
                    node: probe.source.clone(),
                    command: command.clone(),
                    message: other.to_string(),
                },
            })?;

            let raw_output = output.raw();
            let summary = ping::parse_summary(&raw_output);
            let success = output.success() && summary.is_some_and(|s| s.lossless());
            if success {
                debug!(source = %probe.source, destination = %probe.destination, "probe succeeded");
            } else {
                warn!(
                    source = %probe.source,
                    label = %probe.label,
                    status = output.status,
                    "probe failed"
                );
            }

            let result = ProbeResult {
                source: probe.source.clone(),
                destination: probe.destination,
                label: probe.label.clone(),
                command,
                raw_output,
                success,
            };
            self.record(&result)?;
            self.results.push(result);
        }

        Ok(&self.results[start..])
    }

    fn record(&mut self, result: &ProbeResult) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };

        write!(sink, "[{}] {}\n{}\n", result.source, result.command, result.raw_output)?;
        sink.flush()?;
        Ok(())
    }

    /// Every result recorded so far, in probe order
    pub fn results(&self) -> &[ProbeResult] {
        &self.results
    }

    pub fn summary(&self) -> Summary {
        let passed = self.results.iter().filter(|r| r.success).count();
        Summary {
            total: self.results.len(),
            passed,
            failed: self.results.len() - passed,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemorySubstrate;
    use crate::topology::Topology;
    use ipnet::IpNet;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Sink that tests can read back after handing it to the harness
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    /// a -- b, plus an island c
    fn lab(substrate: &MemorySubstrate) -> Lab<MemorySubstrate> {
        let mut topo = Topology::new();
        topo.add_host("a", None).unwrap();
        topo.add_host("b", None).unwrap();
        topo.add_host("c", None).unwrap();
        topo.add_link("a", "b", "a-eth0", "b-eth0", net("10.0.0.1/24"), net("10.0.0.2/24"))
            .unwrap();
        let mut lab = Lab::new(topo, substrate.clone());
        lab.realize().unwrap();
        lab
    }

    #[test]
    fn test_results_preserve_order() {
        let substrate = MemorySubstrate::new();
        let mut lab = lab(&substrate);
        let probes = vec![
            Probe::new("a", addr("10.0.0.2"), "b"),
            Probe::new("a", addr("10.9.9.9"), "nowhere"),
            Probe::new("b", addr("10.0.0.1"), "a"),
        ];

        let mut harness = Harness::new();
        let results = harness.run(&mut lab, &probes).unwrap();

        let outcome: Vec<_> = results.iter().map(|r| (r.label.as_str(), r.success)).collect();
        assert_eq!(outcome, vec![("b", true), ("nowhere", false), ("a", true)]);
        assert!(results[1].raw_output.contains("Network is unreachable"));
        assert_eq!(
            harness.summary(),
            Summary {
                total: 3,
                passed: 2,
                failed: 1
            }
        );
    }

    #[test]
    fn test_sink_format() {
        let substrate = MemorySubstrate::new();
        let mut lab = lab(&substrate);
        let buf = SharedBuf::default();
        let mut harness = Harness::new().with_sink(buf.clone());

        harness
            .run(&mut lab, &[Probe::new("a", addr("10.0.0.2"), "b")])
            .unwrap();

        let text = buf.contents();
        assert!(text.starts_with("[a] ping -c 1 10.0.0.2\nPING 10.0.0.2"));
        assert!(text.ends_with("ms\n\n"));
        assert_eq!(text, format!("[a] ping -c 1 10.0.0.2\n{}\n", harness.results()[0].raw_output));
    }

    #[test]
    fn test_timeout_flag() {
        let substrate = MemorySubstrate::new();
        let mut lab = lab(&substrate);
        let mut harness = Harness::new().with_timeout(Duration::from_secs(2));
        let results = harness
            .run(&mut lab, &[Probe::new("a", addr("10.0.0.2"), "b")])
            .unwrap();
        assert_eq!(results[0].command, "ping -c 1 -W 2 10.0.0.2");
        assert!(results[0].success);
    }

    #[test]
    fn test_refused_probe_is_an_error() {
        let substrate = MemorySubstrate::new();
        let mut lab = lab(&substrate);
        substrate.refuse("c");
        let probes = vec![
            Probe::new("a", addr("10.0.0.2"), "b"),
            Probe::new("c", addr("10.0.0.1"), "a"),
            Probe::new("b", addr("10.0.0.1"), "a"),
        ];

        let mut harness = Harness::new();
        let err = harness.run(&mut lab, &probes).unwrap_err();
        assert!(matches!(
            err,
            Error::ProbeExecution { ref node, ref command, .. }
                if node == "c" && command == "ping -c 1 10.0.0.1"
        ));
        // Results before the refusal are kept
        assert_eq!(harness.results().len(), 1);
    }

    #[test]
    fn test_unreachable_island_is_data() {
        let substrate = MemorySubstrate::new();
        let mut lab = lab(&substrate);
        let mut harness = Harness::new();
        let results = harness
            .run(&mut lab, &[Probe::new("c", addr("10.0.0.1"), "a")])
            .unwrap();
        assert!(!results[0].success);
        assert!(!harness.summary().all_passed());
    }
}
