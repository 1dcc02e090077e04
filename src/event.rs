//! Multicast gateway to the radio emulator's event bus.
//!
//! Outbound location events are published best-effort onto the event
//! channel; inbound events are consumed by a single monitor thread and
//! handed to the session's handler after filtering.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::util::create_multicast;
use crate::NemId;

/// Bounded wait for the monitor thread on reset; past this the thread is
/// detached and the socket surrendered.
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One NEM entry inside a location event. Only latitude, longitude and
/// altitude are consumed; the remaining attributes arrive on the wire
/// but are ignored.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct LocationEntry {
    pub nem: NemId,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub yaw: Option<f64>,
    pub pitch: Option<f64>,
    pub roll: Option<f64>,
    pub azimuth: Option<f64>,
    pub elevation: Option<f64>,
    pub velocity: Option<f64>,
}

impl LocationEntry {
    pub fn new(nem: NemId, lat: f64, lon: f64, alt: f64) -> Self {
        LocationEntry {
            nem,
            latitude: Some(lat),
            longitude: Some(lon),
            altitude: Some(alt),
            ..Default::default()
        }
    }
}

/// One datagram on the event channel.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LocationEventMsg {
    pub entries: Vec<LocationEntry>,
}

/// Receives filtered inbound locations: `(nem, lat, lon, alt)`. Must not
/// block; the monitor thread invokes it serially in arrival order.
pub type LocationHandler = Arc<dyn Fn(NemId, f64, f64, f64) + Send + Sync>;

struct EventService {
    addr: SocketAddrV4,
    nems: Vec<NemId>,
    // best-effort: a service without a socket swallows publications
    sock: Option<UdpSocket>,
}

struct Monitor {
    stop: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct GatewayState {
    services: HashMap<(Ipv4Addr, u16), EventService>,
    nem_service: HashMap<NemId, (Ipv4Addr, u16)>,
    monitor: Option<Monitor>,
}

/// Owns the per-service multicast connections and the monitor thread.
pub struct EventManager {
    handler: LocationHandler,
    state: Mutex<GatewayState>,
}

impl EventManager {
    pub fn new(handler: LocationHandler) -> Self {
        EventManager {
            handler,
            state: Mutex::new(GatewayState::default()),
        }
    }

    /// Register an event service for a NEM, creating the `(group, port)`
    /// connection when it does not exist yet. With `monitor` set the
    /// inbound side is consumed on the session's monitor thread.
    pub fn create_service(
        &self,
        nem_id: NemId,
        device: &str,
        group: Ipv4Addr,
        port: u16,
        monitor: bool,
    ) {
        let mut state = self.state.lock().unwrap();
        let key = (group, port);
        if !state.services.contains_key(&key) {
            let addr = SocketAddrV4::new(group, port);
            let sock = match create_multicast(&addr, &Ipv4Addr::UNSPECIFIED) {
                Ok(sock) => Some(sock),
                Err(e) => {
                    warn!("cannot open event channel {}: {}", addr, e);
                    None
                }
            };
            state.services.insert(
                key,
                EventService {
                    addr,
                    nems: Vec::new(),
                    sock,
                },
            );
            debug!("created event service {} on {}", addr, device);
        }
        let service = state.services.get_mut(&key).unwrap();
        if !service.nems.contains(&nem_id) {
            service.nems.push(nem_id);
        }
        state.nem_service.insert(nem_id, key);
        if monitor && state.monitor.is_none() {
            let started = self.start_monitor(&state.services[&key]);
            state.monitor = started;
        }
    }

    /// Publish one location event for a single NEM. Best-effort: failures
    /// are logged, never raised.
    pub fn publish_location(&self, nem_id: NemId, lon: f64, lat: f64, alt: i32) {
        self.publish_locations(&[(nem_id, lon, lat, alt)]);
    }

    /// Publish one location event carrying every entry of the batch.
    /// At most one datagram leaves per call; successive identical
    /// batches are not deduplicated.
    pub fn publish_locations(&self, positions: &[(NemId, f64, f64, i32)]) {
        let Some((first, _, _, _)) = positions.first() else {
            return;
        };
        let msg = LocationEventMsg {
            entries: positions
                .iter()
                .map(|(nem, lon, lat, alt)| {
                    LocationEntry::new(*nem, *lat, *lon, f64::from(*alt))
                })
                .collect(),
        };
        let state = self.state.lock().unwrap();
        let Some(service) = state
            .nem_service
            .get(first)
            .and_then(|key| state.services.get(key))
        else {
            debug!("no event service for NEM {}, dropping location", first);
            return;
        };
        let Some(sock) = service.sock.as_ref() else {
            return;
        };
        match bincode::serialize(&msg) {
            Ok(buf) => {
                if let Err(e) = sock.send_to(&buf, service.addr) {
                    warn!("location publish to {} failed: {}", service.addr, e);
                }
            }
            Err(e) => warn!("cannot encode location event: {}", e),
        }
    }

    fn start_monitor(&self, service: &EventService) -> Option<Monitor> {
        let sock = match service.sock.as_ref().and_then(|s| s.try_clone().ok()) {
            Some(sock) => sock,
            None => {
                warn!("event service {} has no socket to monitor", service.addr);
                return None;
            }
        };
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = bounded(1);
        let handler = self.handler.clone();
        let thread_stop = stop.clone();
        let addr = service.addr;
        let handle = thread::Builder::new()
            .name("radio-events".to_owned())
            .spawn(move || {
                info!("monitoring location events on {}", addr);
                monitor_loop(&sock, &thread_stop, &handler);
                let _ = done_tx.send(());
            })
            .ok()?;
        Some(Monitor {
            stop,
            done_rx,
            handle,
        })
    }

    /// Tear down services and join the monitor thread within a bounded
    /// wait.
    pub fn reset(&self) {
        let (monitor, count) = {
            let mut state = self.state.lock().unwrap();
            let count = state.services.len();
            state.services.clear();
            state.nem_service.clear();
            (state.monitor.take(), count)
        };
        if count > 0 {
            debug!("cleared {} event services", count);
        }
        if let Some(monitor) = monitor {
            monitor.stop.store(true, Ordering::Relaxed);
            match monitor.done_rx.recv_timeout(MONITOR_JOIN_TIMEOUT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = monitor.handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("event monitor did not stop in time, detaching");
                }
            }
        }
    }

    /// Session-stop synonym for [`EventManager::reset`].
    pub fn shutdown(&self) {
        self.reset();
    }

    #[cfg(test)]
    fn service_count(&self) -> usize {
        self.state.lock().unwrap().services.len()
    }
}

fn monitor_loop(sock: &UdpSocket, stop: &AtomicBool, handler: &LocationHandler) {
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        let len = match sock.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                debug!("event socket closed: {}", e);
                break;
            }
        };
        match bincode::deserialize::<LocationEventMsg>(&buf[..len]) {
            Ok(msg) => dispatch_entries(&msg.entries, handler),
            Err(e) => warn!("undecodable event datagram ({} bytes): {}", len, e),
        }
    }
}

/// Hand complete entries to the handler; entries missing any of
/// latitude, longitude or altitude are dropped with a warning.
fn dispatch_entries(entries: &[LocationEntry], handler: &LocationHandler) {
    for entry in entries {
        match (entry.latitude, entry.longitude, entry.altitude) {
            (Some(lat), Some(lon), Some(alt)) => handler(entry.nem, lat, lon, alt),
            _ => warn!("dropped invalid location event for NEM {}", entry.nem),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collecting_handler() -> (LocationHandler, Arc<StdMutex<Vec<(NemId, f64, f64, f64)>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: LocationHandler = Arc::new(move |nem, lat, lon, alt| {
            sink.lock().unwrap().push((nem, lat, lon, alt));
        });
        (handler, seen)
    }

    #[test]
    fn batched_publish_is_one_message() {
        let positions = [(1u16, 4.0, 52.0, 10), (2u16, 4.1, 52.1, 20)];
        let msg = LocationEventMsg {
            entries: positions
                .iter()
                .map(|(nem, lon, lat, alt)| {
                    LocationEntry::new(*nem, *lat, *lon, f64::from(*alt))
                })
                .collect(),
        };
        let buf = bincode::serialize(&msg).unwrap();
        let decoded: LocationEventMsg = bincode::deserialize(&buf).unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[0].nem, 1);
        assert_eq!(decoded.entries[1].altitude, Some(20.0));
    }

    #[test]
    fn incomplete_entries_are_dropped() {
        let (handler, seen) = collecting_handler();
        let entries = vec![
            LocationEntry::new(1, 52.0, 4.0, 5.0),
            LocationEntry {
                nem: 2,
                latitude: Some(52.0),
                longitude: Some(4.0),
                ..Default::default()
            },
            LocationEntry {
                nem: 3,
                yaw: Some(1.0),
                ..Default::default()
            },
        ];
        dispatch_entries(&entries, &handler);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(1, 52.0, 4.0, 5.0)]);
    }

    #[test]
    fn extra_attributes_are_ignored() {
        let (handler, seen) = collecting_handler();
        let mut entry = LocationEntry::new(7, 52.0, 4.0, 5.0);
        entry.yaw = Some(0.5);
        entry.velocity = Some(12.0);
        dispatch_entries(&[entry], &handler);
        assert_eq!(seen.lock().unwrap().as_slice(), &[(7, 52.0, 4.0, 5.0)]);
    }

    #[test]
    fn services_deduplicate_by_group_and_port() {
        let (handler, _) = collecting_handler();
        let manager = EventManager::new(handler);
        let group = Ipv4Addr::new(224, 0, 0, 1);
        manager.create_service(1, "b0.1", group, 45703, false);
        manager.create_service(2, "b0.1", group, 45703, false);
        assert_eq!(manager.service_count(), 1);
        manager.create_service(3, "b1.1", group, 45704, false);
        assert_eq!(manager.service_count(), 2);
        manager.reset();
        assert_eq!(manager.service_count(), 0);
    }
}
