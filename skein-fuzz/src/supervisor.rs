//! Memory supervisor
//!
//! A background task sampling system memory and tripping the shared
//! cancellation flag when usage crosses the configured fraction of
//! physical RAM or swap. The analysis side polls the flag at its
//! designated points and abandons partial work; artifacts already
//! written stay on disk.
use log::{debug, warn};
use skein_trace::CancelFlag;
use std::time::Duration;
use tokio::{task, time};

#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    /// fraction of physical memory that may be in use, 0.0..=1.0
    pub ram_fraction: f64,
    /// fraction of swap that may be in use, 0.0..=1.0
    pub swap_fraction: f64,
    pub interval: Duration,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            ram_fraction: 0.9,
            swap_fraction: 0.5,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    ram_used: f64,
    swap_used: f64,
}

#[cfg(target_os = "linux")]
async fn sample() -> Option<Sample> {
    let text = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    let mut total = 0u64;
    let mut avail = 0u64;
    let mut swap_total = 0u64;
    let mut swap_free = 0u64;
    for line in text.lines() {
        let mut it = line.split_whitespace();
        let key = it.next()?;
        let val: u64 = it.next()?.parse().ok()?;
        match key {
            "MemTotal:" => total = val,
            "MemAvailable:" => avail = val,
            "SwapTotal:" => swap_total = val,
            "SwapFree:" => swap_free = val,
            _ => (),
        }
    }
    if total == 0 {
        return None;
    }
    Some(Sample {
        ram_used: 1.0 - avail as f64 / total as f64,
        swap_used: if swap_total == 0 {
            0.0
        } else {
            1.0 - swap_free as f64 / swap_total as f64
        },
    })
}

#[cfg(not(target_os = "linux"))]
async fn sample() -> Option<Sample> {
    None
}

/// Supervise until cancelled or dropped. Returns a handle; aborting
/// it stops the sampling task, the flag is left as is.
pub struct Supervisor(task::JoinHandle<()>);

impl Supervisor {
    pub fn start(limits: MemoryLimits, cancel: CancelFlag) -> Self {
        let handle = task::spawn(async move {
            let mut tick = time::interval(limits.interval);
            loop {
                tick.tick().await;
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(s) = sample().await {
                    if s.ram_used > limits.ram_fraction
                        || s.swap_used > limits.swap_fraction
                    {
                        warn!(
                            "memory pressure (ram {:.0}%, swap {:.0}%), cancelling",
                            s.ram_used * 100.0,
                            s.swap_used * 100.0
                        );
                        cancel.cancel();
                        return;
                    }
                    debug!("memory ok, ram {:.0}%", s.ram_used * 100.0);
                }
            }
        });
        Self(handle)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.0.abort()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn trips_the_flag_on_pressure() {
        let cancel = CancelFlag::new();
        let limits = MemoryLimits {
            // everything is over this limit
            ram_fraction: -1.0,
            swap_fraction: -1.0,
            interval: Duration::from_millis(5),
        };
        let _sup = Supervisor::start(limits, cancel.clone());
        for _ in 0..200 {
            if cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // non linux hosts cannot sample, the flag stays down
        if cfg!(target_os = "linux") {
            panic!("supervisor never cancelled under an impossible limit")
        }
    }
}
