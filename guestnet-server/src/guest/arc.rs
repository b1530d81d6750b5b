//! Android guest networking, for both the container and the VM flavor.
//!
//! The guest gets a management link (`arc0` behind `arcbr0`) plus one link
//! per supported uplink, each behind its own `arc_<uplink>` bridge. The
//! container is reached through veth pairs into its namespace; the VM
//! through TAP devices created up front with stable MACs.

use super::{Device, DeviceConfig, DeviceOptions, GuestContext, GuestService, GuestState};
use crate::datapath::Datapath;
use crate::shill::DeviceType;
use guestnet_common::addr::{GuestClass, MacAddress};
use guestnet_common::fwmark::TrafficSource;
use guestnet_common::ipc::GuestType;
use guestnet_common::net_util::{arc_bridge_name, arc_veth_host_name};
use guestnet_common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::Ipv4Addr;
use tracing::{error, info, warn};

pub const ARC_NETNS: &str = "arc_netns";
pub const ARC_IFNAME: &str = "arc0";
pub const ARC_BRIDGE: &str = "arcbr0";

/// Stable MAC index of the VM management link; uplink slots follow.
const MGMT_MAC_INDEX: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcKind {
    Container,
    Vm,
}

impl ArcKind {
    pub fn guest_type(self) -> GuestType {
        match self {
            ArcKind::Container => GuestType::Arc,
            ArcKind::Vm => GuestType::ArcVm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum UplinkClass {
    Ethernet,
    Wifi,
    Cellular,
}

/// Order in which per-uplink slots are carved out of the pool
const UPLINK_SLOTS: [UplinkClass; 5] = [
    UplinkClass::Ethernet,
    UplinkClass::Ethernet,
    UplinkClass::Wifi,
    UplinkClass::Wifi,
    UplinkClass::Cellular,
];

impl UplinkClass {
    fn of(ifname: &str) -> Option<Self> {
        let device_type = DeviceType::from_ifname(ifname);
        if device_type.is_ethernet() {
            Some(UplinkClass::Ethernet)
        } else if device_type.is_wifi() {
            Some(UplinkClass::Wifi)
        } else if device_type.is_cellular() {
            Some(UplinkClass::Cellular)
        } else {
            None
        }
    }
}

/// A guest-facing link of the Android VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestDevice {
    pub ifname: String,
    pub guest_ipv4: Ipv4Addr,
}

/// Free per-uplink configs, taken from and returned to the front
type SlotQueues = BTreeMap<UplinkClass, VecDeque<DeviceConfig>>;

struct Running {
    id: u64,
    mgmt: DeviceConfig,
    available: SlotQueues,
    devices: BTreeMap<String, Device>,
    /// TAPs in slot order, management first. Empty for the container.
    taps: Vec<GuestDevice>,
}

pub struct ArcService {
    kind: ArcKind,
    hypervisor_user: String,
    state: GuestState,
    running: Option<Running>,
    /// Uplinks reported by the device adapter, started or not
    shill_devices: BTreeSet<String>,
}

impl ArcService {
    pub fn new(kind: ArcKind, hypervisor_user: &str) -> Self {
        Self {
            kind,
            hypervisor_user: hypervisor_user.to_string(),
            state: GuestState::Stopped,
            running: None,
            shill_devices: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> ArcKind {
        self.kind
    }

    pub fn is_started(&self) -> bool {
        self.state == GuestState::Started
    }

    /// Pid of the container or CID of the VM while started
    pub fn id(&self) -> Option<u64> {
        self.running.as_ref().map(|r| r.id)
    }

    /// TAP links of the VM in slot order, management link first.
    pub fn guest_devices(&self) -> Vec<GuestDevice> {
        self.running.as_ref().map(|r| r.taps.clone()).unwrap_or_default()
    }

    pub fn device(&self, phys_ifname: &str) -> Option<&Device> {
        self.running.as_ref().and_then(|r| r.devices.get(phys_ifname))
    }

    fn mac_for(&self, ctx: &mut GuestContext<'_>, index: u32) -> MacAddress {
        match self.kind {
            ArcKind::Vm => ctx.addrs.generate_stable_mac_address(index),
            ArcKind::Container => ctx.addrs.generate_mac_address(),
        }
    }

    fn allocate_configs(&self, ctx: &mut GuestContext<'_>) -> Result<(DeviceConfig, SlotQueues)> {
        let subnet = ctx.addrs.allocate_ipv4_subnet(GuestClass::ContainerAndroid, None)?;
        let mac = self.mac_for(ctx, MGMT_MAC_INDEX);
        let mgmt = DeviceConfig::new(subnet, mac)?;

        let mut available = SlotQueues::new();
        for (index, class) in (MGMT_MAC_INDEX + 1..).zip(UPLINK_SLOTS) {
            let subnet = ctx.addrs.allocate_ipv4_subnet(GuestClass::AndroidNet, None)?;
            let mac = self.mac_for(ctx, index);
            available.entry(class).or_default().push_back(DeviceConfig::new(subnet, mac)?);
        }
        Ok((mgmt, available))
    }

    /// Create one TAP per config, management first, removing them all if any
    /// creation fails.
    fn create_taps(
        &self,
        datapath: &Datapath,
        mgmt: &mut DeviceConfig,
        available: &mut SlotQueues,
    ) -> Result<Vec<GuestDevice>> {
        let mut taps = Vec::new();
        let configs = std::iter::once(mgmt).chain(available.values_mut().flat_map(|q| q.iter_mut()));
        for config in configs {
            match datapath.add_tap("", Some(config.mac), None, &self.hypervisor_user) {
                Ok(tap) => {
                    config.tap_ifname.clone_from(&tap);
                    taps.push(GuestDevice {
                        ifname: tap,
                        guest_ipv4: config.guest_ipv4,
                    });
                }
                Err(e) => {
                    for tap in &taps {
                        datapath.remove_tap(&tap.ifname);
                    }
                    return Err(Error::interface(&e));
                }
            }
        }
        Ok(taps)
    }

    /// Attach the container namespace and wire `arc0` into it.
    fn setup_container_link(&self, datapath: &Datapath, id: u64, mgmt: &DeviceConfig) -> Result<String> {
        let pid = i32::try_from(id).map_err(|_| Error::InvalidArgument(format!("invalid container pid {id}")))?;
        datapath.netns_attach(ARC_NETNS, pid).map_err(|e| Error::namespace(&e))?;

        let veth = arc_veth_host_name(ARC_IFNAME);
        if let Err(e) = datapath.connect_veth_pair(
            ARC_NETNS,
            &veth,
            ARC_IFNAME,
            mgmt.mac,
            mgmt.guest_ipv4,
            mgmt.prefix_len(),
            false,
        ) {
            datapath.netns_delete(ARC_NETNS);
            return Err(Error::interface(&e));
        }

        if let Err(e) = datapath.kernel().write_sentinel(pid) {
            warn!("Failed to signal network readiness to pid {}: {:#}", pid, e);
        }
        Ok(veth)
    }

    /// Bring up `arcbr0`, reusing the bridge a previous run left down.
    ///
    /// The bridge cannot be deleted and added again, so one that was not
    /// parked by us is reused as well.
    fn bring_up_bridge(datapath: &Datapath, mgmt: &DeviceConfig) -> Result<()> {
        if let Ok(flags) = datapath.kernel().interface_flags(ARC_BRIDGE) {
            if flags & libc::IFF_DEBUG == 0 {
                warn!(
                    "Found {} without the parked marker, a previous run may have crashed",
                    ARC_BRIDGE
                );
            } else {
                info!("Reusing existing bridge {}", ARC_BRIDGE);
            }
            return datapath
                .mask_interface_flags(ARC_BRIDGE, libc::IFF_UP, libc::IFF_DEBUG)
                .map_err(|e| Error::interface(&e));
        }
        datapath
            .add_bridge(ARC_BRIDGE, mgmt.host_ipv4, mgmt.prefix_len())
            .map_err(|e| Error::interface(&e))
    }

    /// `arcbr0` is never deleted; it is brought down and flagged so the next
    /// start picks it up again.
    fn park_bridge(datapath: &Datapath) {
        if let Err(e) = datapath.mask_interface_flags(ARC_BRIDGE, libc::IFF_DEBUG, libc::IFF_UP) {
            error!("Failed to bring down {}, it may not restart correctly: {:#}", ARC_BRIDGE, e);
        }
    }

    fn teardown_link(&self, datapath: &Datapath, taps: &[GuestDevice]) {
        match self.kind {
            ArcKind::Container => {
                datapath.remove_interface(&arc_veth_host_name(ARC_IFNAME));
                datapath.netns_delete(ARC_NETNS);
            }
            ArcKind::Vm => {
                for tap in taps {
                    datapath.remove_tap(&tap.ifname);
                }
            }
        }
    }

    /// Start networking for the container `pid` or the VM `cid`.
    ///
    /// A start while already started stops the previous instance first.
    #[tracing::instrument(name = "arc.start", skip(self, ctx), fields(kind = ?self.kind))]
    pub fn start(&mut self, ctx: &mut GuestContext<'_>, id: u64) -> Result<()> {
        if self.is_started() {
            warn!("Already running, did something crash? Stopping and restarting");
            if let Some(prev) = self.id() {
                self.stop(ctx, prev)?;
            }
        }
        self.state
            .transition_to(GuestState::Starting)
            .map_err(|e| Error::AlreadyRunning(format!("ARC: {e}")))?;

        match self.setup(ctx, id) {
            Ok(running) => {
                info!("Started ARC management device {} on {}", ARC_IFNAME, ARC_BRIDGE);
                self.running = Some(running);
                self.state
                    .transition_to(GuestState::Started)
                    .map_err(|e| Error::AlreadyRunning(format!("ARC: {e}")))?;
            }
            Err(e) => {
                error!("Failed to start ARC {}: {}", id, e);
                self.state
                    .transition_to(GuestState::Stopped)
                    .map_err(|e| Error::NotRunning(format!("ARC: {e}")))?;
                return Err(e);
            }
        }

        let known: Vec<String> = self.shill_devices.iter().cloned().collect();
        for ifname in known {
            if let Err(e) = self.add_device(ctx, &ifname) {
                warn!("Failed to start device {}: {}", ifname, e);
            }
        }
        Ok(())
    }

    fn setup(&self, ctx: &mut GuestContext<'_>, id: u64) -> Result<Running> {
        let (mut mgmt, mut available) = self.allocate_configs(ctx)?;
        let datapath = ctx.datapath;

        let (arc_ifname, taps) = match self.kind {
            ArcKind::Vm => {
                let taps = self.create_taps(datapath, &mut mgmt, &mut available)?;
                (mgmt.tap_ifname.clone(), taps)
            }
            ArcKind::Container => (self.setup_container_link(datapath, id, &mgmt)?, Vec::new()),
        };

        let res = Self::bring_up_bridge(datapath, &mgmt).and_then(|()| {
            datapath
                .add_to_bridge(ARC_BRIDGE, &arc_ifname)
                .map_err(|e| Error::interface(&e))
        });
        if let Err(e) = res {
            Self::park_bridge(datapath);
            self.teardown_link(datapath, &taps);
            return Err(e);
        }

        Ok(Running {
            id,
            mgmt,
            available,
            devices: BTreeMap::new(),
            taps,
        })
    }

    /// Stop networking of the running guest. For the VM, `id` must match
    /// the CID it was started with.
    #[tracing::instrument(name = "arc.stop", skip(self, ctx), fields(kind = ?self.kind))]
    pub fn stop(&mut self, ctx: &mut GuestContext<'_>, id: u64) -> Result<()> {
        let Some(current) = self.id().filter(|_| self.is_started()) else {
            return Err(Error::NotRunning("ARC".to_string()));
        };
        if self.kind == ArcKind::Vm && current != id {
            return Err(Error::InvalidArgument(format!("mismatched ARCVM CIDs {current} != {id}")));
        }
        self.state
            .transition_to(GuestState::Stopping)
            .map_err(|e| Error::NotRunning(format!("ARC: {e}")))?;

        let started: Vec<String> = self
            .running
            .as_ref()
            .map(|r| r.devices.keys().cloned().collect())
            .unwrap_or_default();
        for ifname in started {
            self.remove_device(ctx, &ifname);
        }

        Self::park_bridge(ctx.datapath);
        if let Some(running) = self.running.take() {
            self.teardown_link(ctx.datapath, &running.taps);
            info!("Stopped ARC management device, released {}", running.mgmt.subnet);
        }

        self.state
            .transition_to(GuestState::Stopped)
            .map_err(|e| Error::NotRunning(format!("ARC: {e}")))
    }

    /// Start the guest link mirroring uplink `ifname`.
    #[tracing::instrument(name = "arc.add_device", skip(self, ctx))]
    pub fn add_device(&mut self, ctx: &mut GuestContext<'_>, ifname: &str) -> Result<()> {
        if !self.is_started() || ifname.is_empty() {
            return Ok(());
        }
        let kind = self.kind;
        let Some(running) = self.running.as_mut() else {
            return Ok(());
        };
        if running.devices.contains_key(ifname) {
            warn!("Device {} is already started", ifname);
            return Ok(());
        }
        let class = UplinkClass::of(ifname)
            .ok_or_else(|| Error::InvalidArgument(format!("unsupported interface {ifname}")))?;
        let config = running
            .available
            .get_mut(&class)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| Error::SubnetExhausted(format!("Android {ifname}")))?;

        let datapath = ctx.datapath;
        let fwd_multicast = datapath
            .kernel()
            .interface_flags(ifname)
            .is_ok_and(|flags| flags & libc::IFF_MULTICAST != 0);
        let ipv6 = class != UplinkClass::Cellular;
        let device = Device {
            phys_ifname: ifname.to_string(),
            host_ifname: arc_bridge_name(ifname),
            guest_ifname: ifname.to_string(),
            config,
            options: DeviceOptions {
                fwd_multicast,
                ipv6_enabled: ipv6,
                adb_allowed: ipv6,
            },
        };
        info!("Starting device {}", device);

        if let Err(e) = Self::setup_device(kind, datapath, &device) {
            running.available.entry(class).or_default().push_front(device.config);
            return Err(e);
        }

        if device.options.adb_allowed {
            if let Err(e) = datapath.add_adb_port_access_rule(ifname) {
                error!("Failed to add ADB port access rule: {:#}", e);
            }
        }
        ctx.forwarder.start_forwarding(
            datapath,
            &device.phys_ifname,
            &device.host_ifname,
            device.options.ipv6_enabled,
            device.options.fwd_multicast,
        );
        running.devices.insert(ifname.to_string(), device);
        Ok(())
    }

    fn setup_device(kind: ArcKind, datapath: &Datapath, device: &Device) -> Result<()> {
        let config = &device.config;
        datapath
            .add_bridge(&device.host_ifname, config.host_ipv4, config.prefix_len())
            .map_err(|e| Error::interface(&e))?;

        if let Err(e) = datapath.start_routing_device(
            &device.phys_ifname,
            &device.host_ifname,
            config.guest_ipv4,
            TrafficSource::Arc,
        ) {
            datapath.remove_bridge(&device.host_ifname);
            return Err(Error::packet_filter(&e));
        }
        let unroute = || {
            datapath.stop_routing_device(
                &device.phys_ifname,
                &device.host_ifname,
                config.guest_ipv4,
                TrafficSource::Arc,
            );
            datapath.remove_bridge(&device.host_ifname);
        };

        let virtual_ifname = match kind {
            ArcKind::Vm => {
                if config.tap_ifname.is_empty() {
                    unroute();
                    return Err(Error::InterfaceSetupFailed(format!("no TAP device for {device}")));
                }
                config.tap_ifname.clone()
            }
            ArcKind::Container => {
                let veth = arc_veth_host_name(&device.guest_ifname);
                if let Err(e) = datapath.connect_veth_pair(
                    ARC_NETNS,
                    &veth,
                    &device.guest_ifname,
                    config.mac,
                    config.guest_ipv4,
                    config.prefix_len(),
                    device.options.fwd_multicast,
                ) {
                    unroute();
                    return Err(Error::interface(&e));
                }
                veth
            }
        };

        if let Err(e) = datapath.add_to_bridge(&device.host_ifname, &virtual_ifname) {
            if kind == ArcKind::Container {
                datapath.remove_interface(&virtual_ifname);
            }
            unroute();
            return Err(Error::interface(&e));
        }
        Ok(())
    }

    /// Stop the guest link mirroring uplink `ifname` and return its slot.
    #[tracing::instrument(name = "arc.remove_device", skip(self, ctx))]
    pub fn remove_device(&mut self, ctx: &mut GuestContext<'_>, ifname: &str) {
        let kind = self.kind;
        let Some(running) = self.running.as_mut() else {
            return;
        };
        let Some(device) = running.devices.remove(ifname) else {
            warn!("Unknown device: {}", ifname);
            return;
        };
        info!("Removing device {}", device);

        let datapath = ctx.datapath;
        ctx.forwarder.stop_forwarding(
            datapath,
            &device.phys_ifname,
            &device.host_ifname,
            device.options.ipv6_enabled,
            device.options.fwd_multicast,
        );

        // VM TAPs live until the guest stops
        if kind == ArcKind::Container {
            datapath.remove_interface(&arc_veth_host_name(&device.guest_ifname));
        }
        datapath.stop_routing_device(
            &device.phys_ifname,
            &device.host_ifname,
            device.config.guest_ipv4,
            TrafficSource::Arc,
        );
        datapath.remove_bridge(&device.host_ifname);
        if device.options.adb_allowed {
            datapath.remove_adb_port_access_rule(ifname);
        }

        if let Some(class) = UplinkClass::of(ifname) {
            running.available.entry(class).or_default().push_front(device.config);
        }
    }
}

impl GuestService for ArcService {
    fn on_devices_changed(&mut self, ctx: &mut GuestContext<'_>, added: &BTreeSet<String>, removed: &BTreeSet<String>) {
        for ifname in removed {
            self.shill_devices.remove(ifname);
            if self.is_started() {
                self.remove_device(ctx, ifname);
            }
        }
        for ifname in added {
            self.shill_devices.insert(ifname.clone());
            if let Err(e) = self.add_device(ctx, ifname) {
                warn!("Failed to start device {}: {}", ifname, e);
            }
        }
    }

    fn shutdown(&mut self, ctx: &mut GuestContext<'_>) {
        if let Some(id) = self.id() {
            if let Err(e) = self.stop(ctx, id) {
                warn!("Failed to stop ARC: {}", e);
            }
        }
    }
}
