//! Telemetry producer: periodic guest metrics as one-way events.
//!
//! Runs for the life of the process, across reconnects. Publishing never
//! blocks: when the outbound queue is saturated the sample is dropped and
//! counted, and the count rides along in the next sample that makes it
//! out. Between sessions publishing is a silent no-op.

use std::sync::Arc;

use helion_shared::message::Message;
use helion_shared::ops::{
    self, DiskUsage, InterfaceInfo, LoadAverages, OsIdentity, TelemetryReport, op,
};
use sysinfo::{Disks, Networks, System};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::outbound::{EnqueueError, OutboundHandle, OutboundSequence};

pub struct TelemetryProducer {
    cfg: Arc<Config>,
    outbound: OutboundHandle,
    seq: OutboundSequence,
    sys: System,
    /// Samples lost to back-pressure since the last delivered one.
    dropped: u64,
}

impl TelemetryProducer {
    pub fn new(cfg: Arc<Config>, outbound: OutboundHandle, seq: OutboundSequence) -> Self {
        TelemetryProducer {
            cfg,
            outbound,
            seq,
            sys: System::new_all(),
            dropped: 0,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(self.cfg.telemetry_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            self.publish();
        }
    }

    /// Collect one sample and offer it to the current session.
    fn publish(&mut self) {
        let report = self.collect();
        let Ok(payload) = ops::encode(&report) else {
            warn!("telemetry encode failed; sample skipped");
            return;
        };
        let Ok(frame) = Message::event(self.seq.next(), op::TELEMETRY_REPORT, payload).encode()
        else {
            warn!("telemetry frame encode failed; sample skipped");
            return;
        };

        match self.outbound.try_send(frame) {
            Ok(()) => {
                self.dropped = 0;
                trace!("telemetry sample queued");
            }
            Err(EnqueueError::Full) => {
                self.dropped += 1;
                debug!(dropped = self.dropped, "outbound queue full; sample dropped");
            }
            Err(EnqueueError::NotReady) => {
                trace!("no session; telemetry sample discarded");
            }
        }
    }

    fn collect(&mut self) -> TelemetryReport {
        self.sys.refresh_all();

        let disks = Disks::new_with_refreshed_list()
            .iter()
            .map(|disk| DiskUsage {
                mount_point: disk.mount_point().to_string_lossy().into_owned(),
                filesystem: disk.file_system().to_string_lossy().into_owned(),
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
            .collect();

        let interfaces = Networks::new_with_refreshed_list()
            .iter()
            .map(|(name, data)| InterfaceInfo {
                name: name.clone(),
                addresses: data
                    .ip_networks()
                    .iter()
                    .map(|network| format!("{}/{}", network.addr, network.prefix))
                    .collect(),
                mac: data.mac_address().to_string(),
                link_up: link_up(name),
            })
            .collect();

        TelemetryReport {
            cpu_percent: self.sys.global_cpu_usage(),
            mem_total: self.sys.total_memory(),
            mem_used: self.sys.used_memory(),
            mem_available: self.sys.available_memory(),
            swap_total: self.sys.total_swap(),
            swap_used: self.sys.used_swap(),
            disks,
            interfaces,
            load_avg: load_averages(),
            process_count: self.sys.processes().len() as u32,
            uptime_secs: System::uptime(),
            dropped_samples: self.dropped,
        }
    }
}

/// Load averages where the platform keeps them.
#[cfg(unix)]
fn load_averages() -> Option<LoadAverages> {
    let load = System::load_average();
    Some(LoadAverages {
        one: load.one,
        five: load.five,
        fifteen: load.fifteen,
    })
}

#[cfg(not(unix))]
fn load_averages() -> Option<LoadAverages> {
    None
}

#[cfg(target_os = "linux")]
fn link_up(interface: &str) -> bool {
    std::fs::read_to_string(format!("/sys/class/net/{interface}/operstate"))
        .map(|state| state.trim() == "up")
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn link_up(_interface: &str) -> bool {
    true
}

/// Identity block for the hello handshake.
pub fn os_identity() -> OsIdentity {
    OsIdentity {
        family: if cfg!(windows) { "windows" } else { "unix" }.to_string(),
        name: System::name(),
        version: System::os_version(),
        kernel: System::kernel_version(),
        hostname: System::host_name(),
    }
}
