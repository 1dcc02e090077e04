//! Periodic link-state monitoring between NEM pairs.

use bitflags::bitflags;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use log::warn;
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::{NemId, NodeId};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

bitflags! {
    /// Flags carried on link records.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        const ADD = 0x01;
        const DELETE = 0x02;
        const CRI = 0x04;
        const LOCAL = 0x08;
    }
}

impl Serialize for MessageFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.bits())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LinkType {
    Wired,
    Wireless,
}

/// A link-state record broadcast to session subscribers.
#[derive(Clone, Debug, Serialize)]
pub struct LinkData {
    pub flags: MessageFlags,
    pub link_type: LinkType,
    pub node1_id: NodeId,
    pub node2_id: NodeId,
    pub network_id: NodeId,
    pub color: String,
}

/// Samples which NEM pairs can currently hear each other. The radio
/// emulator scrape lives behind this seam.
pub trait LinkProbe: Send + Sync {
    fn sample(&self) -> Vec<(NemId, NemId)>;
}

/// Probe reporting no links, used when none is configured.
pub struct NullProbe;

impl LinkProbe for NullProbe {
    fn sample(&self) -> Vec<(NemId, NemId)> {
        Vec::new()
    }
}

/// Invoked with `(nem1, nem2, up)` whenever a pair appears or vanishes.
pub type LinkChangeFn = Box<dyn Fn(NemId, NemId, bool) + Send>;

struct Worker {
    stop_tx: Sender<()>,
    done_rx: crossbeam::channel::Receiver<()>,
    handle: JoinHandle<()>,
}

/// Periodic worker diffing consecutive probe samples.
pub struct LinkMonitor {
    period: Duration,
    worker: Mutex<Option<Worker>>,
}

impl LinkMonitor {
    pub fn new(period: Duration) -> Self {
        LinkMonitor {
            period,
            worker: Mutex::new(None),
        }
    }

    pub fn running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    pub fn start(&self, probe: Arc<dyn LinkProbe>, on_change: LinkChangeFn) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded(1);
        let period = self.period;
        let handle = thread::Builder::new()
            .name("link-monitor".to_owned())
            .spawn(move || {
                let mut known: HashSet<(NemId, NemId)> = HashSet::new();
                loop {
                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let current: HashSet<(NemId, NemId)> = probe
                        .sample()
                        .into_iter()
                        .map(|(a, b)| (a.min(b), a.max(b)))
                        .collect();
                    for (a, b) in current.difference(&known) {
                        on_change(*a, *b, true);
                    }
                    for (a, b) in known.difference(&current) {
                        on_change(*a, *b, false);
                    }
                    known = current;
                }
                let _ = done_tx.send(());
            })
            .expect("spawning link monitor thread");
        *worker = Some(Worker {
            stop_tx,
            done_rx,
            handle,
        });
    }

    /// Stop the worker, waiting at most one second for it to finish its
    /// current sample.
    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            match worker.done_rx.recv_timeout(STOP_JOIN_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("link monitor did not stop in time, detaching");
                }
            }
        }
    }
}

impl Drop for LinkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    struct StaticProbe {
        pairs: Mutex<Vec<(NemId, NemId)>>,
    }

    impl LinkProbe for StaticProbe {
        fn sample(&self) -> Vec<(NemId, NemId)> {
            self.pairs.lock().unwrap().clone()
        }
    }

    #[test]
    fn reports_link_changes() {
        let probe = Arc::new(StaticProbe {
            pairs: Mutex::new(vec![(2, 1)]),
        });
        let (tx, rx) = unbounded();
        let monitor = LinkMonitor::new(Duration::from_millis(10));
        monitor.start(
            probe.clone(),
            Box::new(move |a, b, up| {
                let _ = tx.send((a, b, up));
            }),
        );

        // pair normalized and reported up once
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            (1, 2, true)
        );
        assert!(rx.try_recv().is_err());

        probe.pairs.lock().unwrap().clear();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            (1, 2, false)
        );

        monitor.stop();
        assert!(!monitor.running());
        // second stop is a no-op
        monitor.stop();
    }

    #[test]
    fn link_record_serializes_flags_as_bits() {
        let record = LinkData {
            flags: MessageFlags::DELETE,
            link_type: LinkType::Wireless,
            node1_id: 2,
            node2_id: 3,
            network_id: 10,
            color: "green".to_owned(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["flags"], 2);
        assert_eq!(json["link_type"], "Wireless");
    }
}
