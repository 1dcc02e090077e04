//! The radio manager. Owns the emulation lifecycle: NEM identity and
//! port allocation, control channel wiring, per-interface daemon
//! supervision and location event translation in both directions.

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::config::{ConfigKey, ConfigStore};
use crate::event::{EventManager, LocationHandler};
use crate::link::{LinkData, LinkMonitor, LinkProbe, LinkType, MessageFlags, NullProbe};
use crate::model::{ModelConfig, ModelRegistry};
use crate::session::{PositionHook, RadioNet, Session, SessionEvent};
use crate::util::parse_group;
use crate::{IfaceKey, NemId, NodeId, RadioError, Result};

/// Daemon verbosity used when the log level option is zero or unset.
const DEFAULT_LOG_LEVEL: i64 = 3;

const NEM_PORT_BASE: u16 = 47000;

/// Interval between link probe samples.
const LINK_PERIOD: Duration = Duration::from_secs(1);

/// Per-session NEM index filename.
pub const NEM_INDEX: &str = "radio_nems";

/// Outcome of session setup and startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum StartupResult {
    /// Radio networks are up.
    Success,
    /// The session has no radio networks.
    NotNeeded,
    /// Session instantiation must be deferred.
    NotReady,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RadioState {
    Idle,
    Setup,
    Running,
}

/// Capability token proving the radio emulator's event transport is
/// usable. Handed to the manager by the embedding program; without it,
/// `setup` refuses to instantiate the session.
#[derive(Clone, Copy, Debug)]
pub struct EventBindings;

impl EventBindings {
    /// Present when the radio daemon can be found on PATH.
    pub fn detect() -> Option<Self> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .any(|dir| dir.join("radio").is_file())
            .then_some(EventBindings)
    }
}

/// Derive the deterministic control port of a NEM.
pub fn nem_port(nem_id: NemId) -> u16 {
    NEM_PORT_BASE + nem_id
}

struct ManagerState {
    lifecycle: RadioState,
    nets: BTreeMap<NodeId, RadioNet>,
    nems_to_ifaces: BTreeMap<NemId, IfaceKey>,
    ifaces_to_nems: HashMap<IfaceKey, NemId>,
    platformport: i64,
    transformport: i64,
}

struct ManagerShared {
    session: Arc<Session>,
    registry: Arc<ModelRegistry>,
    bindings: Option<EventBindings>,
    probe: Arc<dyn LinkProbe>,
    // the node lock: networks and both NEM maps mutate under it
    state: Mutex<ManagerState>,
    configs: RwLock<ConfigStore>,
    events: EventManager,
    link_monitor: LinkMonitor,
}

impl ManagerShared {
    fn get_iface(&self, nem_id: NemId) -> Option<IfaceKey> {
        self.state
            .lock()
            .unwrap()
            .nems_to_ifaces
            .get(&nem_id)
            .copied()
    }

    fn get_nem_id(&self, key: IfaceKey) -> Option<NemId> {
        self.state
            .lock()
            .unwrap()
            .ifaces_to_nems
            .get(&key)
            .copied()
    }

    /// Allocate the next free NEM id for an interface and record the
    /// two-way mapping.
    fn next_nem_id(&self, key: IfaceKey) -> NemId {
        let start = self.session.options.get_int("nem_id_start", 1).max(1) as NemId;
        let nem_id = {
            let mut state = self.state.lock().unwrap();
            let mut nem_id = start;
            while state.nems_to_ifaces.contains_key(&nem_id) {
                nem_id += 1;
            }
            state.nems_to_ifaces.insert(nem_id, key);
            state.ifaces_to_nems.insert(key, nem_id);
            nem_id
        };
        self.write_nem(key, nem_id);
        nem_id
    }

    /// Append one line to the session's NEM index. Best-effort: OS
    /// errors are logged, never raised.
    fn write_nem(&self, key: IfaceKey, nem_id: NemId) {
        let path = self.session.directory.join(NEM_INDEX);
        let node_name = self.session.node_name(key.0).unwrap_or_default();
        let iface_name = self.session.iface_name(key).unwrap_or_default();
        let line = format!("{} {} {}\n", node_name, iface_name, nem_id);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            error!("error writing NEM index {}: {}", path.display(), e);
        }
    }

    /// Current emulator position of an interface, `None` when no NEM is
    /// assigned. Updates the node's stored geo as a side effect; an
    /// explicit altitude override on the node wins over the projected
    /// altitude.
    fn get_nem_position(&self, key: IfaceKey) -> Option<(NemId, f64, f64, i32)> {
        let Some(nem_id) = self.get_nem_id(key) else {
            info!("nem for interface ({}, {}) is unknown", key.0, key.1);
            return None;
        };
        let (x, y, z) = self.session.with_node(key.0, |n| n.position.get())?;
        let mut geo = self.session.location.getgeo(x, y, z);
        if let Some(alt) = self.session.with_node(key.0, |n| n.position.alt)? {
            geo.alt = alt;
        }
        self.session
            .with_node_mut(key.0, |n| n.position.set_geo(geo.lon, geo.lat, geo.alt));
        // the emulator only accepts integral altitudes
        Some((nem_id, geo.lon, geo.lat, geo.alt.round() as i32))
    }

    /// Publish a location event for one interface.
    fn set_nem_position(&self, key: IfaceKey) {
        if let Some((nem_id, lon, lat, alt)) = self.get_nem_position(key) {
            self.events.publish_location(nem_id, lon, lat, alt);
        }
    }

    fn handle_location_event(&self, nem_id: NemId, lat: f64, lon: f64, alt: f64) {
        debug!("radio location event: {},{},{}", lat, lon, alt);
        self.handle_location_event_to_xyz(nem_id, lat, lon, alt);
    }

    /// Reconcile an inbound location event back into canvas coordinates
    /// and broadcast the node movement. Returns false when the NEM is
    /// unknown or the position falls outside the coordinate space.
    fn handle_location_event_to_xyz(&self, nem_id: NemId, lat: f64, lon: f64, alt: f64) -> bool {
        match self.location_event_to_xyz(nem_id, lat, lon, alt) {
            Ok(()) => true,
            Err(RadioError::UnknownNem(nem)) => {
                info!("location event for unknown NEM {}", nem);
                false
            }
            Err(RadioError::InvalidLocation(x, y, z)) => {
                error!(
                    "dropped location event outside the coordinate space: NEM {} ({}, {}, {})",
                    nem_id, x, y, z
                );
                false
            }
            Err(e) => {
                warn!("location event for NEM {} failed: {}", nem_id, e);
                false
            }
        }
    }

    fn location_event_to_xyz(&self, nem_id: NemId, lat: f64, lon: f64, alt: f64) -> Result<()> {
        let key = self
            .get_iface(nem_id)
            .ok_or(RadioError::UnknownNem(nem_id))?;
        let (x, y, z) = self.session.location.getxyz(lat, lon, alt);
        let (x, y, z) = (x.trunc() as i64, y.trunc() as i64, z.trunc() as i64);
        debug!(
            "location event NEM {} ({}, {}, {}) -> ({}, {}, {})",
            nem_id, lat, lon, alt, x, y, z
        );
        let out_of_range = |v: i64| v < 0 || v > i64::from(u16::MAX);
        if out_of_range(x) || out_of_range(y) || out_of_range(z) {
            return Err(RadioError::InvalidLocation(x, y, z));
        }
        // write position and geo directly, bypassing the position hook,
        // so the update is not republished to the emulator
        self.session
            .with_node_mut(key.0, |node| {
                node.position.set(x as f64, y as f64, z as f64);
                node.position.set_geo(lon, lat, alt);
            })
            .ok_or(RadioError::NoSuchNode(key.0))?;
        self.session.broadcast(SessionEvent::NodePosition {
            node_id: key.0,
            x: x as f64,
            y: y as f64,
            z: z as f64,
            lon,
            lat,
            alt,
        });
        Ok(())
    }

    /// Link record between two NEMs, `None` when either is unknown or
    /// they sit on different radio networks.
    fn get_nem_link(&self, nem1: NemId, nem2: NemId, flags: MessageFlags) -> Option<LinkData> {
        let state = self.state.lock().unwrap();
        let Some(iface1) = state.nems_to_ifaces.get(&nem1).copied() else {
            error!("invalid NEM: {}", nem1);
            return None;
        };
        let Some(iface2) = state.nems_to_ifaces.get(&nem2).copied() else {
            error!("invalid NEM: {}", nem2);
            return None;
        };
        let net1 = state.nets.values().find(|n| n.ifaces.contains(&iface1))?;
        let net2 = state.nets.values().find(|n| n.ifaces.contains(&iface2))?;
        if net1.id != net2.id {
            return None;
        }
        Some(LinkData {
            flags,
            link_type: LinkType::Wireless,
            node1_id: iface1.0,
            node2_id: iface2.0,
            network_id: net1.id,
            color: self.session.get_link_color(net1.id),
        })
    }
}

/// Cheaply cloneable handle on the radio manager.
#[derive(Clone)]
pub struct RadioManager {
    shared: Arc<ManagerShared>,
}

impl RadioManager {
    pub fn new(
        session: Arc<Session>,
        registry: Arc<ModelRegistry>,
        bindings: Option<EventBindings>,
    ) -> Self {
        Self::with_probe(session, registry, bindings, Arc::new(NullProbe))
    }

    pub fn with_probe(
        session: Arc<Session>,
        registry: Arc<ModelRegistry>,
        bindings: Option<EventBindings>,
        probe: Arc<dyn LinkProbe>,
    ) -> Self {
        let platformport = session.options.get_int("radio_platform_port", 8100);
        let transformport = session.options.get_int("radio_transform_port", 8200);
        let shared = Arc::new_cyclic(|weak: &Weak<ManagerShared>| {
            let handler_ref = weak.clone();
            let handler: LocationHandler = Arc::new(move |nem_id, lat, lon, alt| {
                if let Some(shared) = handler_ref.upgrade() {
                    shared.handle_location_event(nem_id, lat, lon, alt);
                }
            });
            ManagerShared {
                session,
                registry,
                bindings,
                probe,
                state: Mutex::new(ManagerState {
                    lifecycle: RadioState::Idle,
                    nets: BTreeMap::new(),
                    nems_to_ifaces: BTreeMap::new(),
                    ifaces_to_nems: HashMap::new(),
                    platformport,
                    transformport,
                }),
                configs: RwLock::new(ConfigStore::new()),
                events: EventManager::new(handler),
                link_monitor: LinkMonitor::new(LINK_PERIOD),
            }
        });
        RadioManager { shared }
    }

    // --- configuration surface ---

    pub fn get_config(
        &self,
        key: ConfigKey,
        model: &str,
        default: bool,
    ) -> Result<Option<ModelConfig>> {
        self.shared
            .configs
            .read()
            .unwrap()
            .get(&self.shared.registry, key, model, default)
    }

    pub fn set_config(&self, key: ConfigKey, model: &str, config: &ModelConfig) -> Result<()> {
        self.shared
            .configs
            .write()
            .unwrap()
            .set(&self.shared.registry, key, model, config)
    }

    pub fn set_node_model(&self, node_id: NodeId, model: &str) {
        self.shared
            .configs
            .write()
            .unwrap()
            .set_node_model(node_id, model);
    }

    pub fn config_reset(&self, node_id: Option<NodeId>) {
        self.shared.configs.write().unwrap().reset(node_id);
    }

    /// Effective configuration for an interface on a radio network:
    /// interface, then node, then network, then model defaults.
    pub fn get_iface_config(&self, net: &RadioNet, key: IfaceKey) -> Result<ModelConfig> {
        let model = net
            .model
            .as_deref()
            .ok_or(RadioError::MissingNodeModel(net.id))?;
        self.shared
            .configs
            .read()
            .unwrap()
            .iface_config(&self.shared.registry, model, net.id, key)
    }

    // --- registrations and identity ---

    /// Register a radio network. The check-and-insert is atomic under
    /// the node lock.
    pub fn add_node(&self, net: RadioNet) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(existing) = state.nets.get(&net.id) {
            return Err(RadioError::DuplicateNetwork(net.id, existing.name.clone()));
        }
        state.nets.insert(net.id, net);
        Ok(())
    }

    pub fn get_iface(&self, nem_id: NemId) -> Option<IfaceKey> {
        self.shared.get_iface(nem_id)
    }

    pub fn get_nem_id(&self, key: IfaceKey) -> Option<NemId> {
        self.shared.get_nem_id(key)
    }

    /// Allocate the next free NEM id for an interface, recording the
    /// two-way mapping and appending to the session's NEM index.
    pub fn next_nem_id(&self, key: IfaceKey) -> NemId {
        self.shared.next_nem_id(key)
    }

    pub fn get_nem_port(&self, key: IfaceKey) -> Option<u16> {
        self.shared.get_nem_id(key).map(nem_port)
    }

    /// Next platform port; the counter starts from the
    /// `radio_platform_port` option.
    pub fn next_platform_port(&self) -> u16 {
        let mut state = self.shared.state.lock().unwrap();
        let port = state.platformport;
        state.platformport += 1;
        port as u16
    }

    /// Next transform port; the counter starts from the
    /// `radio_transform_port` option.
    pub fn next_transform_port(&self) -> u16 {
        let mut state = self.shared.state.lock().unwrap();
        let port = state.transformport;
        state.transformport += 1;
        port as u16
    }

    // --- lifecycle ---

    /// Collect the session's radio networks and verify this manager can
    /// run them.
    pub fn setup(&self) -> Result<StartupResult> {
        debug!("radio manager setup");
        for net in self.shared.session.radio_nets() {
            debug!("adding radio network: id({}) name({})", net.id, net.name);
            self.add_node(net)?;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            state.lifecycle = RadioState::Setup;
            if state.nets.is_empty() {
                debug!("no radio networks in session");
                return Ok(StartupResult::NotNeeded);
            }
        }
        if self.shared.bindings.is_none() {
            return Err(RadioError::MissingBindings);
        }
        self.check_node_models()?;
        Ok(StartupResult::Success)
    }

    /// Associate model selections with networks that were declared
    /// without one.
    fn check_node_models(&self) -> Result<()> {
        let configs = self.shared.configs.read().unwrap();
        let mut state = self.shared.state.lock().unwrap();
        for (id, net) in state.nets.iter_mut() {
            debug!("checking radio model for network: {}", id);
            if let Some(model) = &net.model {
                debug!("network({}) already has model({})", id, model);
                continue;
            }
            let Some(model) = configs.node_model(*id) else {
                error!("radio network({}) has no model set", id);
                return Err(RadioError::MissingNodeModel(*id));
            };
            self.shared.registry.get(model)?;
            debug!("setting radio model({}) for network({})", model, id);
            net.model = Some(model.to_owned());
        }
        Ok(())
    }

    /// Build platform definitions and start one daemon per interface.
    pub fn startup(&self) -> Result<StartupResult> {
        self.reset();
        let status = self.setup()?;
        if status != StartupResult::Success {
            return Ok(status);
        }
        self.startup_nodes();
        if self.links_enabled() {
            self.start_link_monitor();
        }
        self.shared.state.lock().unwrap().lifecycle = RadioState::Running;
        Ok(StartupResult::Success)
    }

    fn startup_nodes(&self) {
        info!("radio manager building platform definitions");
        // the node lock is not held across interface startups
        for (net, key) in self.get_ifaces() {
            if let Err(e) = self.start_iface(&net, key) {
                error!(
                    "failed to start radio interface node({}) iface({}): {}",
                    key.0, key.1, e
                );
            }
        }
    }

    /// All `(network, interface)` pairs eligible for startup, sorted by
    /// `(node id, interface id)`. Networks without a model and
    /// interfaces without a node are skipped.
    pub fn get_ifaces(&self) -> Vec<(RadioNet, IfaceKey)> {
        let mut ifaces = Vec::new();
        {
            let state = self.shared.state.lock().unwrap();
            for net in state.nets.values() {
                if net.model.is_none() {
                    error!("radio network({}) has no model", net.name);
                    continue;
                }
                for key in &net.ifaces {
                    if !self.shared.session.has_node(key.0) {
                        error!(
                            "radio network({}) connected interface({}) missing node",
                            net.name, key.1
                        );
                        continue;
                    }
                    ifaces.push((net.clone(), *key));
                }
            }
        }
        ifaces.sort_by_key(|(_, key)| *key);
        ifaces
    }

    fn start_iface(&self, net: &RadioNet, key: IfaceKey) -> Result<()> {
        let node_name = self
            .shared
            .session
            .node_name(key.0)
            .ok_or(RadioError::NoSuchNode(key.0))?;
        let iface_name = self
            .shared
            .session
            .iface_name(key)
            .ok_or(RadioError::NoSuchNode(key.0))?;
        let nem_id = self.shared.next_nem_id(key);
        info!(
            "starting radio for node({}) iface({}) nem({})",
            node_name, iface_name, nem_id
        );
        let config = self.get_iface_config(net, key)?;
        self.setup_control_channels(nem_id, key, &iface_name, &config)?;
        let model = self
            .shared
            .registry
            .get(net.model.as_deref().unwrap_or_default())?;
        let nem_name = format!("{}-{}", net.name, iface_name);
        let doc = model.build_platform_xml(nem_id, nem_port(nem_id), &nem_name, &iface_name, &config)?;
        let xml_path = self
            .shared
            .session
            .directory
            .join(format!("platform-{}.xml", iface_name));
        std::fs::write(&xml_path, doc)?;
        self.start_daemon(key, &iface_name)?;
        self.install_iface(key, &config)?;
        Ok(())
    }

    /// Wire the OTA and event control channels into the node and
    /// register the NEM's event service.
    fn setup_control_channels(
        &self,
        nem_id: NemId,
        key: IfaceKey,
        iface_name: &str,
        config: &ModelConfig,
    ) -> Result<()> {
        let session = &self.shared.session;
        let node_id = key.0;
        let option = |name: &str| {
            config
                .get(name)
                .cloned()
                .ok_or_else(|| RadioError::InvalidOption {
                    key: name.to_owned(),
                    value: "<unset>".to_owned(),
                })
        };
        let parse = |name: &str, value: &str| {
            parse_group(value).ok_or_else(|| RadioError::InvalidOption {
                key: name.to_owned(),
                value: value.to_owned(),
            })
        };
        let container = session
            .with_node(node_id, |n| n.is_container())
            .unwrap_or(false);

        // ota device
        let ota_value = option("otamanagergroup")?;
        let (ota_group, _ota_port) = parse("otamanagergroup", &ota_value)?;
        let ota_dev = option("otamanagerdevice")?;
        let ota_index = session.control_net_id(&ota_dev);
        session.add_control_net(ota_index, &ota_dev);
        if container {
            session.add_control_iface(node_id, ota_index);
        }

        // event device
        let event_value = option("eventservicegroup")?;
        let (event_group, event_port) = parse("eventservicegroup", &event_value)?;
        let event_dev = option("eventservicedevice")?;
        let event_index = session.control_net_id(&event_dev);
        let event_net = session.add_control_net(event_index, &event_dev);
        if container {
            session.add_control_iface(node_id, event_index);
        }

        self.shared.events.create_service(
            nem_id,
            &event_net.brname,
            event_group,
            event_port,
            self.do_event_monitor(),
        );

        info!(
            "node({}) interface({}) ota({}:{}) event({}:{})",
            node_id, iface_name, ota_group, ota_dev, event_group, event_dev
        );
        session.create_route(node_id, &ota_group, &ota_dev)?;
        // a second route for the event group would clash when both
        // channels share one group
        if event_group != ota_group {
            session.create_route(node_id, &event_group, &event_dev)?;
        }
        Ok(())
    }

    /// Launch the radio daemon for one interface, inside the node for
    /// container-backed nodes and on the host otherwise.
    fn start_daemon(&self, key: IfaceKey, iface_name: &str) -> Result<()> {
        let session = &self.shared.session;
        let mut loglevel = DEFAULT_LOG_LEVEL;
        let cfg_level = session.options.get_int("radio_log_level", 2);
        if cfg_level != 0 {
            info!("setting user-defined radio log level: {}", cfg_level);
            loglevel = cfg_level;
        }
        let mut cmd = format!("radio -d -l {}", loglevel);
        if session.options.get_bool("radio_realtime", true) {
            cmd.push_str(" -r");
        }
        let container = session
            .with_node(key.0, |n| n.is_container())
            .unwrap_or(false);
        let result = if container {
            let args = format!(
                "{} -f {}-radio.log platform-{}.xml",
                cmd, iface_name, iface_name
            );
            session.node_cmd(key.0, &args, true)
        } else {
            let log_file = session.directory.join(format!("{}-radio.log", iface_name));
            let platform_xml = session
                .directory
                .join(format!("platform-{}.xml", iface_name));
            let args = format!(
                "{} -f {} {}",
                cmd,
                log_file.display(),
                platform_xml.display()
            );
            session.host_cmd(&args, Some(&session.directory), true)
        };
        result.map(|_| ()).map_err(|e| {
            warn!("radio daemon launch for {} failed: {}", iface_name, e);
            RadioError::LaunchFailed(iface_name.to_owned())
        })
    }

    /// Final interface installation: addresses on the tap unless
    /// externally managed, then the position hook.
    fn install_iface(&self, key: IfaceKey, config: &ModelConfig) -> Result<()> {
        if config.get("external").map(String::as_str).unwrap_or("0") == "0" {
            self.shared.session.set_ips(key)?;
        }
        if self.gen_location_events() {
            self.shared.session.with_node_mut(key.0, |node| {
                if let Some(iface) = node.ifaces.get_mut(&key.1) {
                    iface.poshook = Some(PositionHook { iface: key });
                }
            });
            self.shared.set_nem_position(key);
        }
        Ok(())
    }

    /// Re-publish the position of every interface now that all NEMs are
    /// active, and run the per-model startup hooks.
    pub fn poststartup(&self) {
        let events_enabled = self.gen_location_events();
        let pairs: Vec<(Option<String>, IfaceKey)> = {
            let state = self.shared.state.lock().unwrap();
            state
                .nets
                .values()
                .flat_map(|net| {
                    debug!("post startup for radio network: {} - {}", net.id, net.name);
                    net.ifaces
                        .iter()
                        .map(|key| (net.model.clone(), *key))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for (model_name, key) in pairs {
            if let Some(model) = model_name.and_then(|m| self.shared.registry.get(&m).ok()) {
                if let Err(e) = model.post_startup(key) {
                    warn!("model post startup failed for ({}, {}): {}", key.0, key.1, e);
                }
            }
            if events_enabled {
                self.shared.set_nem_position(key);
            }
        }
    }

    /// Clear every registration and counter. Legal from any state.
    pub fn reset(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.nets.clear();
            state.nems_to_ifaces.clear();
            state.ifaces_to_nems.clear();
            state.platformport = self
                .shared
                .session
                .options
                .get_int("radio_platform_port", 8100);
            state.transformport = self
                .shared
                .session
                .options
                .get_int("radio_transform_port", 8200);
            state.lifecycle = RadioState::Idle;
        }
        // joins the monitor thread, so the node lock must not be held
        self.shared.events.reset();
    }

    /// Stop all radio daemons. Idempotent; the second call issues no
    /// external commands.
    pub fn shutdown(&self) {
        {
            let state = self.shared.state.lock().unwrap();
            if state.lifecycle != RadioState::Running {
                debug!("radio manager not running, nothing to stop");
                return;
            }
        }
        info!("stopping radio daemons");
        self.shared.link_monitor.stop();
        for (_, key) in self.get_ifaces() {
            let Some(up) = self.shared.session.with_node(key.0, |n| n.up) else {
                continue;
            };
            if !up {
                continue;
            }
            let Some(iface_name) = self.shared.session.iface_name(key) else {
                continue;
            };
            let kill_cmd = format!("pkill -f \"radio.+{}\"", iface_name);
            if let Err(e) = self.shared.session.node_cmd(key.0, &kill_cmd, false) {
                warn!("error stopping radio daemon for {}: {}", iface_name, e);
            }
            self.shared.session.with_node_mut(key.0, |node| {
                if let Some(iface) = node.ifaces.get_mut(&key.1) {
                    iface.poshook = None;
                }
            });
        }
        self.shared.events.shutdown();
        self.shared.state.lock().unwrap().lifecycle = RadioState::Idle;
    }

    // --- positions and links ---

    pub fn get_nem_position(&self, key: IfaceKey) -> Option<(NemId, f64, f64, i32)> {
        self.shared.get_nem_position(key)
    }

    /// Publish a location event for one interface.
    pub fn set_nem_position(&self, key: IfaceKey) {
        self.shared.set_nem_position(key);
    }

    /// Publish one batched location event for several moved interfaces.
    pub fn set_nem_positions(&self, moved: &[IfaceKey]) {
        let positions: Vec<_> = moved
            .iter()
            .filter_map(|key| self.shared.get_nem_position(*key))
            .collect();
        if positions.is_empty() {
            return;
        }
        self.shared.events.publish_locations(&positions);
    }

    pub fn handle_location_event_to_xyz(
        &self,
        nem_id: NemId,
        lat: f64,
        lon: f64,
        alt: f64,
    ) -> bool {
        self.shared.handle_location_event_to_xyz(nem_id, lat, lon, alt)
    }

    pub fn get_nem_link(
        &self,
        nem1: NemId,
        nem2: NemId,
        flags: MessageFlags,
    ) -> Option<LinkData> {
        self.shared.get_nem_link(nem1, nem2, flags)
    }

    fn start_link_monitor(&self) {
        let weak = Arc::downgrade(&self.shared);
        self.shared.link_monitor.start(
            self.shared.probe.clone(),
            Box::new(move |nem1, nem2, up| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let flags = if up {
                    MessageFlags::ADD
                } else {
                    MessageFlags::DELETE
                };
                if let Some(link) = shared.get_nem_link(nem1, nem2, flags) {
                    shared.session.broadcast(SessionEvent::Link(link));
                }
            }),
        );
    }

    /// True when a radio daemon is alive inside the node.
    pub fn running(&self, node_id: NodeId) -> bool {
        self.shared
            .session
            .node_cmd(node_id, "pkill -0 -x radio", true)
            .is_ok()
    }

    // --- options ---

    fn links_enabled(&self) -> bool {
        self.shared.session.options.get_bool("link_enabled", false)
    }

    fn do_event_monitor(&self) -> bool {
        self.shared
            .session
            .options
            .get_bool("radio_event_monitor", false)
    }

    fn gen_location_events(&self) -> bool {
        self.shared
            .session
            .options
            .get_bool("radio_event_generate", true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::HostRunner;

    #[test]
    fn nem_port_is_derived_from_the_id() {
        assert_eq!(nem_port(1), 47001);
        assert_eq!(nem_port(42), 47042);
        assert_eq!(nem_port(999), 47999);
    }

    #[test]
    fn port_counters_are_monotonic() {
        let session = Arc::new(Session::new(
            1,
            std::env::temp_dir(),
            Arc::new(HostRunner),
        ));
        session.options.set("radio_platform_port", "9000");
        let registry = Arc::new(ModelRegistry::with_defaults());
        let manager = RadioManager::new(session, registry, Some(EventBindings));
        assert_eq!(manager.next_platform_port(), 9000);
        assert_eq!(manager.next_platform_port(), 9001);
        assert_eq!(manager.next_transform_port(), 8200);
        assert_eq!(manager.next_transform_port(), 8201);
    }

    #[test]
    fn duplicate_network_is_atomic() {
        let session = Arc::new(Session::new(
            1,
            std::env::temp_dir(),
            Arc::new(HostRunner),
        ));
        let registry = Arc::new(ModelRegistry::with_defaults());
        let manager = RadioManager::new(session, registry, Some(EventBindings));
        manager
            .add_node(RadioNet::new(5, "wlan5").with_model("rfpipe"))
            .unwrap();
        let err = manager
            .add_node(RadioNet::new(5, "wlan5-again"))
            .unwrap_err();
        assert!(matches!(err, RadioError::DuplicateNetwork(5, _)));
        assert_eq!(manager.get_ifaces().len(), 0);
    }
}
