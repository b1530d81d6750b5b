//! Networking for Linux (Termina) and plugin VMs: one addressed TAP per VM,
//! routed rather than bridged.

use super::{Device, DeviceConfig, DeviceOptions, GuestContext, GuestService};
use crate::datapath::{Datapath, Ipv4Route};
use crate::shill::ShillDevice;
use guestnet_common::addr::{GuestClass, Subnet};
use guestnet_common::fwmark::TrafficSource;
use guestnet_common::ipc::GuestType;
use guestnet_common::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const ADB_SIDELOAD_MAX_TRY: u32 = 5;
pub const ADB_SIDELOAD_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const ADB_SIDELOAD_QUERY_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmKey {
    pub id: u64,
    pub is_termina: bool,
}

impl VmKey {
    pub fn new(id: u64, is_termina: bool) -> Self {
        Self { id, is_termina }
    }

    pub fn guest_type(self) -> GuestType {
        if self.is_termina {
            GuestType::TerminaVm
        } else {
            GuestType::PluginVm
        }
    }

    fn source(self) -> TrafficSource {
        if self.is_termina {
            TrafficSource::CrosVm
        } else {
            TrafficSource::PluginVm
        }
    }

    fn class(self) -> GuestClass {
        if self.is_termina {
            GuestClass::VmLinux
        } else {
            GuestClass::VmPlugin
        }
    }
}

impl fmt::Display for VmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", if self.is_termina { "t" } else { "p" }, self.id)
    }
}

/// What a VM needs to configure its side of the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDevice {
    pub ifname: String,
    pub host_ipv4: Ipv4Addr,
    pub guest_ipv4: Ipv4Addr,
    /// `(base, prefix length)` of the VM link
    pub subnet: (Ipv4Addr, u8),
    /// Subnet for containers nested in a Linux VM
    pub nested_subnet: Option<(Ipv4Addr, u8)>,
}

struct VmEntry {
    device: Device,
    nested: Option<Subnet>,
}

impl VmEntry {
    fn tap(&self) -> &str {
        &self.device.host_ifname
    }

    fn nested_route(&self) -> Option<Ipv4Route> {
        self.nested
            .as_ref()
            .map(|s| Ipv4Route::via(self.device.config.guest_ipv4, s.base_address(), s.prefix_length()))
    }
}

pub struct CrostiniService {
    hypervisor_user: String,
    vms: BTreeMap<VmKey, VmEntry>,
    /// Ethernet or wifi uplink carrying the default route, if any
    default_ifname: Option<String>,
    adb_sideloading: bool,
}

fn forwards_for_vms(device: Option<&ShillDevice>) -> Option<&str> {
    device
        .filter(|d| d.device_type.is_ethernet() || d.device_type.is_wifi())
        .map(|d| d.ifname.as_str())
}

impl CrostiniService {
    pub fn new(hypervisor_user: &str) -> Self {
        Self {
            hypervisor_user: hypervisor_user.to_string(),
            vms: BTreeMap::new(),
            default_ifname: None,
            adb_sideloading: false,
        }
    }

    pub fn is_running(&self, key: VmKey) -> bool {
        self.vms.contains_key(&key)
    }

    pub fn running(&self) -> impl Iterator<Item = VmKey> + '_ {
        self.vms.keys().copied()
    }

    pub fn device(&self, key: VmKey) -> Option<VmDevice> {
        let entry = self.vms.get(&key)?;
        let config = &entry.device.config;
        Some(VmDevice {
            ifname: entry.tap().to_string(),
            host_ipv4: config.host_ipv4,
            guest_ipv4: config.guest_ipv4,
            subnet: (config.subnet.base_address(), config.subnet.prefix_length()),
            nested_subnet: entry.nested.as_ref().map(|s| (s.base_address(), s.prefix_length())),
        })
    }

    /// Start networking for a VM. `subnet_index` pins the plugin VM subnet.
    #[tracing::instrument(name = "crostini.start", skip(self, ctx), fields(vm = %key))]
    pub fn start(&mut self, ctx: &mut GuestContext<'_>, key: VmKey, subnet_index: Option<u32>) -> Result<VmDevice> {
        if key.id == 0 {
            return Err(Error::InvalidArgument("invalid VM id 0".to_string()));
        }
        if self.vms.contains_key(&key) {
            return Err(Error::AlreadyRunning(format!("VM {key}")));
        }

        let entry = self.add_tap(ctx, key, subnet_index)?;
        let datapath = ctx.datapath;
        if let Err(e) = datapath.start_routing_device("", entry.tap(), entry.device.config.guest_ipv4, key.source()) {
            Self::remove_tap(datapath, &entry);
            return Err(Error::packet_filter(&e));
        }

        if let Some(phys) = &self.default_ifname {
            ctx.forwarder.start_forwarding(datapath, phys, entry.tap(), true, true);
        }
        if self.adb_sideloading {
            Self::start_adb_port_forwarding(datapath, entry.tap());
        }

        info!("Started VM network {} on {}", key, entry.device);
        self.vms.insert(key, entry);
        self.device(key)
            .ok_or_else(|| Error::NotRunning(format!("VM {key}")))
    }

    fn add_tap(&self, ctx: &mut GuestContext<'_>, key: VmKey, subnet_index: Option<u32>) -> Result<VmEntry> {
        let subnet = ctx.addrs.allocate_ipv4_subnet(key.class(), subnet_index)?;
        let nested = if key.is_termina {
            Some(ctx.addrs.allocate_ipv4_subnet(GuestClass::VmContainer, None)?)
        } else {
            None
        };
        let mac = match subnet_index {
            Some(index) => ctx.addrs.generate_stable_mac_address(index),
            None => ctx.addrs.generate_mac_address(),
        };
        let mut config = DeviceConfig::new(subnet, mac)?;

        let tap = ctx
            .datapath
            .add_tap(
                "",
                Some(mac),
                Some((config.host_ipv4, config.prefix_len())),
                &self.hypervisor_user,
            )
            .map_err(|e| Error::interface(&e))?;
        config.tap_ifname.clone_from(&tap);

        let entry = VmEntry {
            device: Device {
                phys_ifname: tap.clone(),
                host_ifname: tap,
                guest_ifname: String::new(),
                config,
                options: DeviceOptions {
                    fwd_multicast: true,
                    ipv6_enabled: true,
                    adb_allowed: false,
                },
            },
            nested,
        };

        if let Some(route) = entry.nested_route() {
            if let Err(e) = ctx.datapath.add_ipv4_route(&route) {
                ctx.datapath.remove_tap(entry.tap());
                return Err(Error::interface(&e.context("Failed to route nested container subnet")));
            }
        }
        Ok(entry)
    }

    fn remove_tap(datapath: &Datapath, entry: &VmEntry) {
        if let Some(route) = entry.nested_route() {
            datapath.delete_ipv4_route(&route);
        }
        datapath.remove_tap(entry.tap());
    }

    #[tracing::instrument(name = "crostini.stop", skip(self, ctx), fields(vm = %key))]
    pub fn stop(&mut self, ctx: &mut GuestContext<'_>, key: VmKey) -> Result<()> {
        let entry = self
            .vms
            .remove(&key)
            .ok_or_else(|| Error::NotRunning(format!("VM {key}")))?;
        let datapath = ctx.datapath;

        datapath.stop_routing_device("", entry.tap(), entry.device.config.guest_ipv4, key.source());
        if let Some(phys) = &self.default_ifname {
            ctx.forwarder.stop_forwarding(datapath, phys, entry.tap(), true, true);
        }
        if self.adb_sideloading {
            Self::stop_adb_port_forwarding(datapath, entry.tap());
        }
        Self::remove_tap(datapath, &entry);

        info!("Stopped VM network {}", key);
        Ok(())
    }

    fn start_adb_port_forwarding(datapath: &Datapath, ifname: &str) {
        if let Err(e) = datapath.add_adb_port_forward_rule(ifname) {
            error!("Failed to add ADB port forwarding rule for {}: {:#}", ifname, e);
            return;
        }
        if let Err(e) = datapath.add_adb_port_access_rule(ifname) {
            datapath.remove_adb_port_forward_rule(ifname);
            error!("Failed to add ADB port access rule for {}: {:#}", ifname, e);
            return;
        }
        if let Err(e) = datapath.set_route_localnet(ifname, true) {
            error!("Failed to enable route_localnet on {}: {:#}", ifname, e);
        }
    }

    fn stop_adb_port_forwarding(datapath: &Datapath, ifname: &str) {
        datapath.remove_adb_port_forward_rule(ifname);
        datapath.remove_adb_port_access_rule(ifname);
    }

    /// Record the ADB sideloading policy, opening the ADB port on every
    /// running VM once it is enabled.
    pub fn set_adb_sideloading(&mut self, ctx: &mut GuestContext<'_>, enabled: bool) {
        if !enabled || self.adb_sideloading {
            return;
        }
        info!("ADB sideloading enabled");
        self.adb_sideloading = true;
        for entry in self.vms.values() {
            Self::start_adb_port_forwarding(ctx.datapath, entry.tap());
        }
    }
}

impl GuestService for CrostiniService {
    fn on_default_device_changed(
        &mut self,
        ctx: &mut GuestContext<'_>,
        new: Option<&ShillDevice>,
        prev: Option<&ShillDevice>,
    ) {
        if new.map(|d| &d.ifname) == prev.map(|d| &d.ifname) {
            return;
        }
        let datapath = ctx.datapath;

        if let Some(phys) = self.default_ifname.take() {
            for entry in self.vms.values() {
                ctx.forwarder.stop_forwarding(datapath, &phys, entry.tap(), true, true);
            }
        }
        self.default_ifname = forwards_for_vms(new).map(str::to_string);
        if let Some(phys) = &self.default_ifname {
            for entry in self.vms.values() {
                ctx.forwarder.start_forwarding(datapath, phys, entry.tap(), true, true);
            }
        }
    }

    fn shutdown(&mut self, ctx: &mut GuestContext<'_>) {
        let keys: Vec<VmKey> = self.vms.keys().copied().collect();
        for key in keys {
            if let Err(e) = self.stop(ctx, key) {
                warn!("Failed to stop VM {}: {}", key, e);
            }
        }
    }
}

/// Run `command` and read a boolean from its output.
pub async fn query_adb_sideloading(command: &str, timeout: Duration) -> anyhow::Result<bool> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty ADB sideloading query"))?;
    let output = tokio::time::timeout(
        timeout,
        Command::new(program).args(parts).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("ADB sideloading query timed out"))??;
    if !output.status.success() {
        anyhow::bail!("ADB sideloading query exited with {}", output.status);
    }
    let answer = String::from_utf8_lossy(&output.stdout);
    Ok(matches!(answer.trim(), "true" | "1"))
}

/// Query the sideloading policy in the background, retrying failed queries.
/// The answer is delivered on `tx` at most once.
pub fn spawn_adb_sideload_query(command: String, tx: mpsc::UnboundedSender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        for attempt in 1..=ADB_SIDELOAD_MAX_TRY {
            match query_adb_sideloading(&command, ADB_SIDELOAD_QUERY_TIMEOUT).await {
                Ok(enabled) => {
                    let _ = tx.send(enabled);
                    return;
                }
                Err(e) => {
                    warn!("ADB sideloading query {} failed: {:#}", attempt, e);
                    tokio::time::sleep(ADB_SIDELOAD_RETRY_DELAY).await;
                }
            }
        }
        warn!(
            "Failed to get ADB sideloading status after {} tries, ADB sideloading will not work",
            ADB_SIDELOAD_MAX_TRY
        );
    })
}
