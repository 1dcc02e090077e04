//! The session side of the control plane: virtual nodes and their
//! interfaces, radio network declarations, typed options, control
//! networks and the command seam used to reach node namespaces.

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, RwLock};

use crate::link::LinkData;
use crate::location::{GeoPosition, GeoReference};
use crate::{IfaceId, IfaceKey, NodeId, RadioError, Result};

const PODMAN: &str = "podman";

/// Colors assigned to radio networks for link records, cycled by id.
const LINK_COLORS: [&str; 5] = ["green", "blue", "orange", "purple", "turquoise"];

/// String-keyed session options with typed accessors. Unset keys fall
/// back to the caller-provided default.
#[derive(Debug, Default)]
pub struct Options {
    values: RwLock<HashMap<String, String>>,
}

impl Options {
    pub fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().unwrap().get(key).cloned()
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!("option '{}' has non-numeric value '{}'", key, v);
                default
            }),
            None => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref() {
            Some("1") | Some("true") | Some("on") => true,
            Some("0") | Some("false") | Some("off") => false,
            Some(v) => {
                warn!("option '{}' has non-boolean value '{}'", key, v);
                default
            }
            None => default,
        }
    }
}

/// Where a node's processes execute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeBackend {
    /// Container-backed node; commands run through `podman exec`.
    Container { image: String },
    /// Plain host process, no namespace of its own.
    Host,
}

/// Canvas position of a node plus its last known geodetic position.
/// An explicit `alt` overrides the altitude derived from z.
#[derive(Clone, Debug, Default)]
pub struct Position {
    x: f64,
    y: f64,
    z: f64,
    pub alt: Option<f64>,
    geo: Option<GeoPosition>,
}

impl Position {
    pub fn set(&mut self, x: f64, y: f64, z: f64) {
        self.x = x;
        self.y = y;
        self.z = z;
    }

    pub fn get(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }

    pub fn set_geo(&mut self, lon: f64, lat: f64, alt: f64) {
        self.geo = Some(GeoPosition::new(lat, lon, alt));
    }

    pub fn geo(&self) -> Option<GeoPosition> {
        self.geo
    }
}

/// Marker installed on an interface whose movements should be published
/// as location events. Carries only the interface key so the radio
/// manager can be torn down independently of the nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PositionHook {
    pub iface: IfaceKey,
}

/// A tunnel/tap interface owned by a virtual node.
#[derive(Clone, Debug)]
pub struct Iface {
    pub id: IfaceId,
    pub name: String,
    /// CIDR addresses installed on the tap when the interface is not
    /// externally managed.
    pub ips: Vec<String>,
    pub poshook: Option<PositionHook>,
}

impl Iface {
    pub fn new(id: IfaceId, name: &str) -> Self {
        Iface {
            id,
            name: name.to_owned(),
            ips: Vec::new(),
            poshook: None,
        }
    }

    pub fn with_ips(mut self, ips: &[&str]) -> Self {
        self.ips = ips.iter().map(|s| (*s).to_owned()).collect();
        self
    }
}

/// A virtual node in the session.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub backend: NodeBackend,
    pub up: bool,
    pub position: Position,
    pub ifaces: BTreeMap<IfaceId, Iface>,
}

impl Node {
    pub fn new(id: NodeId, name: &str, backend: NodeBackend) -> Self {
        Node {
            id,
            name: name.to_owned(),
            backend,
            up: true,
            position: Position::default(),
            ifaces: BTreeMap::new(),
        }
    }

    pub fn add_iface(&mut self, iface: Iface) {
        self.ifaces.insert(iface.id, iface);
    }

    pub fn is_container(&self) -> bool {
        matches!(self.backend, NodeBackend::Container { .. })
    }
}

/// Declaration of a radio network: a set of member interfaces plus the
/// selected propagation model.
#[derive(Clone, Debug)]
pub struct RadioNet {
    pub id: NodeId,
    pub name: String,
    pub model: Option<String>,
    pub ifaces: Vec<IfaceKey>,
}

impl RadioNet {
    pub fn new(id: NodeId, name: &str) -> Self {
        RadioNet {
            id,
            name: name.to_owned(),
            model: None,
            ifaces: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_owned());
        self
    }

    pub fn add_iface(&mut self, key: IfaceKey) {
        self.ifaces.push(key);
    }
}

/// Seam through which all external commands run. Tests substitute a
/// recording implementation; production uses [`HostRunner`].
pub trait CommandRunner: Send + Sync {
    /// Run a command and wait for it, returning stdout.
    fn run(&self, cmd: &str, cwd: Option<&Path>) -> Result<String>;
    /// Start a command without waiting for completion.
    fn spawn(&self, cmd: &str, cwd: Option<&Path>) -> Result<()>;
}

/// Runs commands through the local shell.
pub struct HostRunner;

impl HostRunner {
    fn command(cmd: &str, cwd: Option<&Path>) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        command
    }
}

impl CommandRunner for HostRunner {
    fn run(&self, cmd: &str, cwd: Option<&Path>) -> Result<String> {
        let output = Self::command(cmd, cwd).output()?;
        if !output.status.success() {
            return Err(RadioError::CommandFailed {
                cmd: cmd.to_owned(),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn spawn(&self, cmd: &str, cwd: Option<&Path>) -> Result<()> {
        Self::command(cmd, cwd).spawn()?;
        Ok(())
    }
}

/// An out-of-band control network bridging node namespaces to the host.
#[derive(Clone, Debug)]
pub struct ControlNet {
    pub index: u32,
    pub device: String,
    pub brname: String,
}

/// Allocates control network indices per device name and tracks which
/// nodes have been attached.
#[derive(Default)]
struct ControlNets {
    by_device: HashMap<String, u32>,
    nets: HashMap<u32, ControlNet>,
    members: HashSet<(NodeId, u32)>,
    next_index: u32,
}

impl ControlNets {
    fn net_id(&mut self, device: &str) -> u32 {
        if let Some(index) = self.by_device.get(device) {
            return *index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.by_device.insert(device.to_owned(), index);
        index
    }

    fn add_net(&mut self, index: u32, device: &str, session_id: u16) -> ControlNet {
        self.nets
            .entry(index)
            .or_insert_with(|| ControlNet {
                index,
                device: device.to_owned(),
                brname: format!("b{}.{}", index, session_id),
            })
            .clone()
    }

    fn add_member(&mut self, node_id: NodeId, index: u32) -> bool {
        self.members.insert((node_id, index))
    }
}

/// Record broadcast to session subscribers.
#[derive(Clone, Debug, Serialize)]
pub enum SessionEvent {
    NodePosition {
        node_id: NodeId,
        x: f64,
        y: f64,
        z: f64,
        lon: f64,
        lat: f64,
        alt: f64,
    },
    Link(LinkData),
}

/// A running emulation session. Owns the nodes; the radio manager holds
/// only interface keys resolved through it.
pub struct Session {
    pub id: u16,
    pub directory: PathBuf,
    pub options: Options,
    pub location: GeoReference,
    nodes: RwLock<BTreeMap<NodeId, Node>>,
    nets: RwLock<BTreeMap<NodeId, RadioNet>>,
    control_nets: Mutex<ControlNets>,
    runner: Arc<dyn CommandRunner>,
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
}

impl Session {
    pub fn new(id: u16, directory: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Session {
            id,
            directory,
            options: Options::default(),
            location: GeoReference::default(),
            nodes: RwLock::new(BTreeMap::new()),
            nets: RwLock::new(BTreeMap::new()),
            control_nets: Mutex::new(ControlNets::default()),
            runner,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_location(mut self, location: GeoReference) -> Self {
        self.location = location;
        self
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.write().unwrap().insert(node.id, node);
    }

    pub fn add_net(&self, net: RadioNet) {
        self.nets.write().unwrap().insert(net.id, net);
    }

    /// Snapshot of all declared radio networks, ordered by id.
    pub fn radio_nets(&self) -> Vec<RadioNet> {
        self.nets.read().unwrap().values().cloned().collect()
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.read().unwrap().contains_key(&id)
    }

    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.nodes.read().unwrap().get(&id).map(f)
    }

    pub fn with_node_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        self.nodes.write().unwrap().get_mut(&id).map(f)
    }

    pub fn node_name(&self, id: NodeId) -> Option<String> {
        self.with_node(id, |n| n.name.clone())
    }

    pub fn iface_name(&self, key: IfaceKey) -> Option<String> {
        self.with_node(key.0, |n| n.ifaces.get(&key.1).map(|i| i.name.clone()))
            .flatten()
    }

    /// Move a node on the canvas. Returns the position hooks of its
    /// interfaces so the caller can publish location events for them.
    pub fn set_position(&self, id: NodeId, x: f64, y: f64, z: f64) -> Vec<PositionHook> {
        let mut hooks = Vec::new();
        self.with_node_mut(id, |node| {
            node.position.set(x, y, z);
            hooks.extend(node.ifaces.values().filter_map(|i| i.poshook));
        });
        hooks
    }

    /// Run a command in the context of a node: inside the container for
    /// container-backed nodes, on the host otherwise.
    pub fn node_cmd(&self, id: NodeId, args: &str, wait: bool) -> Result<String> {
        let (name, container) = self
            .with_node(id, |n| (n.name.clone(), n.is_container()))
            .ok_or(RadioError::NoSuchNode(id))?;
        let cmd = if container {
            format!("{} exec {} {}", PODMAN, name, args)
        } else {
            args.to_owned()
        };
        if wait {
            self.runner.run(&cmd, None)
        } else {
            self.runner.spawn(&cmd, None).map(|_| String::new())
        }
    }

    /// Run a command on the host on behalf of a node.
    pub fn host_cmd(&self, args: &str, cwd: Option<&Path>, wait: bool) -> Result<String> {
        if wait {
            self.runner.run(args, cwd)
        } else {
            self.runner.spawn(args, cwd).map(|_| String::new())
        }
    }

    /// Install a multicast route towards `group` on `device` inside the
    /// node's namespace.
    pub fn create_route(&self, id: NodeId, group: &Ipv4Addr, device: &str) -> Result<()> {
        self.node_cmd(id, &format!("ip route add {} dev {}", group, device), true)?;
        Ok(())
    }

    /// Configure the stored addresses on a tap interface.
    pub fn set_ips(&self, key: IfaceKey) -> Result<()> {
        let ifname = self
            .iface_name(key)
            .ok_or(RadioError::NoSuchNode(key.0))?;
        let ips = self
            .with_node(key.0, |n| {
                n.ifaces.get(&key.1).map(|i| i.ips.clone()).unwrap_or_default()
            })
            .unwrap_or_default();
        for ip in ips {
            self.node_cmd(key.0, &format!("ip addr add {} dev {}", ip, ifname), true)?;
        }
        Ok(())
    }

    /// Look up or allocate the control network index for a device name.
    pub fn control_net_id(&self, device: &str) -> u32 {
        self.control_nets.lock().unwrap().net_id(device)
    }

    /// Create the control network if it does not exist yet.
    pub fn add_control_net(&self, index: u32, device: &str) -> ControlNet {
        self.control_nets
            .lock()
            .unwrap()
            .add_net(index, device, self.id)
    }

    /// Attach a node to a control network once; repeat calls are no-ops.
    pub fn add_control_iface(&self, id: NodeId, index: u32) {
        let fresh = self.control_nets.lock().unwrap().add_member(id, index);
        if fresh {
            debug!("node({}) attached to control net {}", id, index);
        }
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver an event to every subscriber, dropping the disconnected.
    pub fn broadcast(&self, event: SessionEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn get_link_color(&self, net_id: NodeId) -> String {
        LINK_COLORS[net_id as usize % LINK_COLORS.len()].to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_fall_back_to_defaults() {
        let options = Options::default();
        assert_eq!(options.get_int("nem_id_start", 1), 1);
        options.set("nem_id_start", "100");
        assert_eq!(options.get_int("nem_id_start", 1), 100);
        options.set("radio_realtime", "0");
        assert!(!options.get_bool("radio_realtime", true));
        options.set("radio_realtime", "garbage");
        assert!(options.get_bool("radio_realtime", true));
    }

    #[test]
    fn control_net_indices_are_stable() {
        let mut nets = ControlNets::default();
        let ota = nets.net_id("ctrl0");
        let event = nets.net_id("ctrl1");
        assert_ne!(ota, event);
        assert_eq!(nets.net_id("ctrl0"), ota);
        let net = nets.add_net(ota, "ctrl0", 7);
        assert_eq!(net.brname, format!("b{}.7", ota));
        assert!(nets.add_member(2, ota));
        assert!(!nets.add_member(2, ota));
    }

    #[test]
    fn position_hooks_surface_on_move() {
        let session = Session::new(1, PathBuf::from("/tmp"), Arc::new(HostRunner));
        let mut node = Node::new(2, "n2", NodeBackend::Host);
        let mut iface = Iface::new(0, "eth0");
        iface.poshook = Some(PositionHook { iface: (2, 0) });
        node.add_iface(iface);
        session.add_node(node);

        let hooks = session.set_position(2, 10.0, 20.0, 0.0);
        assert_eq!(hooks, vec![PositionHook { iface: (2, 0) }]);
        assert_eq!(
            session.with_node(2, |n| n.position.get()),
            Some((10.0, 20.0, 0.0))
        );
    }
}
