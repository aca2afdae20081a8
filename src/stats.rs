use std::net::IpAddr;
use std::time::Duration;

use muxping::utils::format_time;
use muxping::{PingError, Probe};

#[derive(Debug, Clone)]
pub struct PingStatistics {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packets_lost: u32,
    pub min_time: f64,
    pub max_time: f64,
    pub total_time: f64,
}

impl PingStatistics {
    pub fn new() -> Self {
        Self {
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            min_time: f64::INFINITY,
            max_time: 0.0,
            total_time: 0.0,
        }
    }

    pub fn record_sent(&mut self) {
        self.packets_sent += 1;
    }

    pub fn record_received(&mut self, rtt: Duration) {
        let time_ms = rtt.as_secs_f64() * 1000.0;
        self.packets_received += 1;
        self.total_time += time_ms;

        if time_ms < self.min_time {
            self.min_time = time_ms;
        }

        if time_ms > self.max_time {
            self.max_time = time_ms;
        }
    }

    pub fn record_lost(&mut self) {
        self.packets_lost += 1;
    }

    /// Account for a resolved probe.
    pub fn record(&mut self, probe: &Probe, result: &Result<(), PingError>) {
        match (result, probe.rtt()) {
            (Ok(()), Some(rtt)) => self.record_received(rtt),
            _ => self.record_lost(),
        }
    }

    pub fn loss_percentage(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        (self.packets_lost as f64 / self.packets_sent as f64) * 100.0
    }

    pub fn average_time(&self) -> f64 {
        if self.packets_received == 0 {
            return 0.0;
        }
        self.total_time / self.packets_received as f64
    }

    pub fn format_summary(&self, target: &str) -> String {
        let mut summary = format!(
            "\n--- {} ping statistics ---\n{} packets transmitted, {} received, {} lost ({:.0}% loss)\n",
            target,
            self.packets_sent,
            self.packets_received,
            self.packets_lost,
            self.loss_percentage()
        );

        if self.packets_received > 0 {
            let min_time = if self.min_time == f64::INFINITY { 0.0 } else { self.min_time };
            summary.push_str(&format!(
                "rtt min/avg/max = {:.3}/{:.3}/{:.3} ms\n",
                min_time,
                self.average_time(),
                self.max_time
            ));
        }

        summary
    }

    pub fn format_response(&self, probe: &Probe) -> String {
        let time_display = probe
            .rtt()
            .map(format_time)
            .unwrap_or_else(|| "?".to_string());
        let ttl_display = probe
            .ttl
            .map(|ttl| ttl.to_string())
            .unwrap_or_else(|| "?".to_string());

        format!(
            "{} bytes from {}: icmp_seq={} ttl={} time={}",
            probe.len, probe.addr, probe.sequence, ttl_display, time_display
        )
    }

    pub fn format_failure(&self, probe: &Probe, error: &PingError) -> String {
        format!("From {} icmp_seq={}: {}", probe.addr, probe.sequence, error)
    }

    pub fn format_header(&self, target: &str, resolved_ip: IpAddr, payload_size: usize) -> String {
        if target == resolved_ip.to_string() {
            format!("PING {} with {} bytes of data:", target, payload_size)
        } else {
            format!("PING {} [{}] with {} bytes of data:", target, resolved_ip, payload_size)
        }
    }
}

impl Default for PingStatistics {
    fn default() -> Self {
        Self::new()
    }
}
