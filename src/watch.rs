//! System watch: CPU, memory, and disk usage alerts with hysteresis.
//!
//! Each metric is either `Normal` or `Warning`. A reading strictly above the
//! threshold moves a normal metric into warning; a reading strictly below it
//! moves it back. A reading equal to the threshold never changes state, and
//! each state change produces exactly one [`Alert`].

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::SystemWatchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricState {
    #[default]
    Normal,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transition {
    EnteredWarning,
    Recovered,
}

impl MetricState {
    /// Next state for a reading, and the transition if the state changed.
    pub fn transition(self, value: f64, threshold: f64) -> (MetricState, Option<Transition>) {
        match self {
            MetricState::Normal if value > threshold => {
                (MetricState::Warning, Some(Transition::EnteredWarning))
            }
            MetricState::Warning if value < threshold => {
                (MetricState::Normal, Some(Transition::Recovered))
            }
            state => (state, None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Metric {
    Cpu,
    Memory,
    Disk,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Cpu, Metric::Memory, Metric::Disk];

    fn index(self) -> usize {
        match self {
            Metric::Cpu => 0,
            Metric::Memory => 1,
            Metric::Disk => 2,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Cpu => "CPU",
            Metric::Memory => "Memory",
            Metric::Disk => "Disk",
        };
        write!(f, "{}", name)
    }
}

/// A state change worth notifying someone about.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub metric: Metric,
    pub transition: Transition,
    pub value: f64,
    pub threshold: f64,
}

/// One reading of system usage, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SystemUsage {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

impl SystemUsage {
    fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Cpu => self.cpu,
            Metric::Memory => self.memory,
            Metric::Disk => self.disk,
        }
    }
}

/// Tracks metric states across readings.
#[derive(Debug, Clone)]
pub struct SystemWatch {
    enabled: bool,
    /// Per metric; zero disables the metric.
    thresholds: [f64; 3],
    states: [MetricState; 3],
}

impl SystemWatch {
    pub fn new(config: &SystemWatchConfig) -> Self {
        Self {
            enabled: config.enabled,
            thresholds: [config.cpu_threshold, config.memory_threshold, config.disk_threshold],
            states: [MetricState::Normal; 3],
        }
    }

    pub fn state(&self, metric: Metric) -> MetricState {
        self.states[metric.index()]
    }

    /// Feed one reading and return the alerts it produced.
    pub fn observe(&mut self, usage: &SystemUsage) -> Vec<Alert> {
        if !self.enabled {
            return Vec::new();
        }

        let mut alerts = Vec::new();
        for metric in Metric::ALL {
            let threshold = self.thresholds[metric.index()];
            if threshold == 0.0 {
                continue;
            }
            let value = usage.get(metric);
            let (next, transition) = self.states[metric.index()].transition(value, threshold);
            self.states[metric.index()] = next;
            if let Some(transition) = transition {
                alerts.push(Alert {
                    metric,
                    transition,
                    value,
                    threshold,
                });
            }
        }
        alerts
    }

    /// Sample system usage every `interval` and log alerts until a shutdown
    /// message arrives.
    pub async fn run(mut self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?interval, "Starting system watch");
        let mut sampler = UsageSampler::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let usage = sampler.sample();
                    debug!(cpu = usage.cpu, memory = usage.memory, disk = usage.disk, "Sampled system usage");
                    for alert in self.observe(&usage) {
                        match alert.transition {
                            Transition::EnteredWarning => warn!(
                                metric = %alert.metric,
                                value = alert.value,
                                threshold = alert.threshold,
                                "System usage above threshold"
                            ),
                            Transition::Recovered => info!(
                                metric = %alert.metric,
                                value = alert.value,
                                threshold = alert.threshold,
                                "System usage recovered"
                            ),
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("System watch shutting down");
                    break;
                }
            }
        }
    }
}

/// Reads usage from the operating system.
pub struct UsageSampler {
    system: System,
}

impl UsageSampler {
    pub fn new() -> Self {
        Self { system: System::new() }
    }

    pub fn sample(&mut self) -> SystemUsage {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total_memory = self.system.total_memory();
        let memory = if total_memory > 0 {
            self.system.used_memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        SystemUsage {
            cpu: self.system.global_cpu_usage() as f64,
            memory,
            disk: disk_usage(),
        }
    }
}

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Usage of the root filesystem, or of all disks when there is none.
fn disk_usage() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let root = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"));
    let (total, available) = match root {
        Some(disk) => (disk.total_space(), disk.available_space()),
        None => disks.list().iter().fold((0, 0), |(t, a), d| {
            (t + d.total_space(), a + d.available_space())
        }),
    };
    if total == 0 {
        return 0.0;
    }
    total.saturating_sub(available) as f64 / total as f64 * 100.0
}
