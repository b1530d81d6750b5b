//! Single-threaded coordinator of the guest network services.
//!
//! The manager owns every piece of mutable state (datapath, address pools,
//! guest services, connected namespaces, helper processes) and mutates it
//! only from [`Manager::run`], one event at a time.

pub mod feature;
pub mod request;

use crate::config::Config;
use crate::connected_ns::{ConnectedNamespaces, CHECK_INTERVAL};
use crate::counters::CountersService;
use crate::datapath::Datapath;
use crate::guest::arc::{ArcKind, ArcService};
use crate::guest::crostini::{CrostiniService, VmKey};
use crate::guest::{Forwarder, GuestContext, GuestService};
use crate::helper::{HelperEvent, HelperKind, HelperSpec, HelperSupervisor};
use crate::shill::{ShillClient, ShillEvent, Snapshot};
use crate::{port_rules, routing};
use guestnet_common::addr::AddressManager;
use guestnet_common::ipc::ip_helper_message::Payload;
use guestnet_common::ipc::{GuestEvent, GuestMessage, GuestType, NdProxyEvent, NdProxyMessage};
use guestnet_common::net_util::{ipv4_cidr, GUEST_RANGE};
use guestnet_common::{Error, Result};
use request::{counters_response, Envelope, Request, Response};
use std::future::Future;
use std::net::Ipv6Addr;
use std::os::fd::AsFd;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Physical uplink prefixes that unmasqueraded guest traffic must not leave on
const PHYSICAL_PREFIXES: [&str; 6] = ["eth", "wlan", "mlan", "usb", "wwan", "rmnet"];
/// Android owns the ports above this range
const LOCAL_PORT_RANGE: &str = "32768 47103";
const DEFAULT_LOCAL_PORT_RANGE: &str = "32768 61000";
const HOST_ROUTE_PREFIX_LEN: u8 = 128;

/// Host-wide state the guest services borrow.
struct Host {
    datapath: Datapath,
    addrs: AddressManager,
    forwarder: Forwarder,
}

impl Host {
    fn ctx(&mut self) -> GuestContext<'_> {
        GuestContext {
            datapath: &self.datapath,
            addrs: &mut self.addrs,
            forwarder: &mut self.forwarder,
        }
    }
}

/// Event sources feeding [`Manager::run`].
pub struct Channels {
    pub requests: mpsc::Receiver<Envelope>,
    pub snapshots: mpsc::Receiver<Snapshot>,
    pub helper_events: mpsc::UnboundedReceiver<HelperEvent>,
    pub sideloading: mpsc::UnboundedReceiver<bool>,
}

/// Helpers to run for `config`. The ND proxy is this binary in helper mode.
pub fn helper_specs(config: &Config, nd_proxy_enabled: bool) -> Vec<HelperSpec> {
    let mut specs: Vec<HelperSpec> = [
        (HelperKind::AdbProxy, config.adb_proxy.as_deref()),
        (HelperKind::McastProxy, config.mcast_proxy.as_deref()),
    ]
    .into_iter()
    .filter_map(|(kind, line)| HelperSpec::from_command_line(kind, line?))
    .collect();
    if nd_proxy_enabled {
        match HelperSpec::nd_proxy() {
            Ok(spec) => specs.push(spec),
            Err(e) => error!("ND proxy unavailable: {:#}", e),
        }
    }
    specs
}

pub struct Manager {
    host: Host,
    shill: ShillClient,
    arc: ArcService,
    crostini: CrostiniService,
    connected: ConnectedNamespaces,
    helpers: HelperSupervisor,
    /// Evaluated once at startup
    nd_proxy_enabled: bool,
}

impl Manager {
    pub fn new(
        datapath: Datapath,
        config: &Config,
        helpers: HelperSupervisor,
        nd_proxy_enabled: bool,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            host: Host {
                datapath,
                addrs: AddressManager::new(),
                forwarder: Forwarder::new(),
            },
            shill: ShillClient::new(),
            arc: ArcService::new(config.arc_kind, &config.hypervisor_user),
            crostini: CrostiniService::new(&config.hypervisor_user),
            connected: ConnectedNamespaces::new()?,
            helpers,
            nd_proxy_enabled,
        })
    }

    pub fn start_helpers(&mut self, specs: Vec<HelperSpec>) {
        for spec in specs {
            let kind = spec.kind;
            if let Err(e) = self.helpers.add(spec) {
                error!("Failed to start {}: {:#}", kind.name(), e);
            }
        }
    }

    fn sysctl(&self, key: &str, value: &str, consequence: &str) {
        if let Err(e) = self.host.datapath.sysctl_w(key, value) {
            error!("Failed to set {} to {}: {:#}. {}", key, value, e, consequence);
        }
    }

    /// One-time host configuration: forwarding sysctls and the top-level
    /// packet-filter rules. Failures are logged, not fatal.
    #[tracing::instrument(name = "manager.setup", skip(self), fields(nd_proxy = self.nd_proxy_enabled))]
    pub fn setup(&self) {
        self.sysctl(
            "net.ipv4.ip_forward",
            "1",
            "Guest connectivity will not work correctly.",
        );
        self.sysctl(
            "net.ipv4.ip_local_port_range",
            LOCAL_PORT_RANGE,
            "Some Android features or apps may not work correctly.",
        );
        self.sysctl(
            "net.ipv6.conf.all.forwarding",
            "1",
            "IPv6 functionality may be broken.",
        );
        // Kernel proxy_ndp is only needed without the ND proxy
        if !self.nd_proxy_enabled {
            self.sysctl(
                "net.ipv6.conf.all.proxy_ndp",
                "1",
                "IPv6 functionality may be broken.",
            );
        }

        let dp = &self.host.datapath;
        if let Err(e) = dp.add_snat_mark_rules() {
            error!("{:#}. Guest connectivity may be broken.", e);
        }
        if let Err(e) = dp.add_forward_established_rule() {
            error!("Failed to install forwarding rule for established connections: {:#}", e);
        }
        if let Err(e) = dp.add_interface_snat("wwan+") {
            error!("Failed to set up cellular masquerade: {:#}", e);
        }
        if let Err(e) = dp.add_outbound_ipv4_snat_mark("vmtap+") {
            error!("Failed to set up NAT for TAP devices: {:#}", e);
        }
        let guest_range = ipv4_cidr(GUEST_RANGE.0, GUEST_RANGE.1);
        for prefix in PHYSICAL_PREFIXES {
            if let Err(e) = dp.add_source_ipv4_drop(prefix, &guest_range) {
                error!("Failed to drop guest sources leaving on {}+: {:#}", prefix, e);
            }
        }
        info!("Host networking configured");
    }

    fn teardown_host(&self) {
        let dp = &self.host.datapath;
        let guest_range = ipv4_cidr(GUEST_RANGE.0, GUEST_RANGE.1);
        for prefix in PHYSICAL_PREFIXES {
            dp.remove_source_ipv4_drop(prefix, &guest_range);
        }
        dp.remove_outbound_ipv4_snat_mark("vmtap+");
        dp.remove_interface_snat("wwan+");
        dp.remove_forward_established_rule();
        dp.remove_snat_mark_rules();

        self.sysctl("net.ipv4.ip_local_port_range", DEFAULT_LOCAL_PORT_RANGE, "");
        if !self.nd_proxy_enabled {
            self.sysctl("net.ipv6.conf.all.proxy_ndp", "0", "");
        }
        self.sysctl("net.ipv6.conf.all.forwarding", "0", "");
        self.sysctl("net.ipv4.ip_forward", "0", "");
    }

    fn expect_arc(&self, kind: ArcKind) -> Result<()> {
        if self.arc.kind() == kind {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "this host runs Android as {:?}, not {:?}",
                self.arc.kind(),
                kind
            )))
        }
    }

    async fn broadcast_guest(&mut self, event: GuestEvent, guest_type: GuestType, id: u64) {
        self.helpers
            .broadcast(&GuestMessage::new(event, guest_type, id).into())
            .await;
    }

    /// Deliver the forwarding changes the guest services queued.
    async fn flush_forwarding(&mut self) {
        for (kind, msg) in self.host.forwarder.take_pending() {
            if let Err(e) = self.helpers.send(kind, &msg.into()).await {
                debug!("Dropped forwarding update for {}: {}", kind.name(), e);
            }
        }
    }

    /// Answer one request. Forwarding changes are flushed whatever the outcome.
    #[tracing::instrument(name = "manager.request", skip_all, fields(request = %request))]
    pub async fn handle(&mut self, request: Request) -> Result<Response> {
        let result = self.dispatch(request).await;
        self.flush_forwarding().await;
        if let Err(e) = &result {
            warn!("Request failed: {}", e);
        }
        result
    }

    async fn dispatch(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::ArcStartup { pid } => {
                self.expect_arc(ArcKind::Container)?;
                self.arc.start(&mut self.host.ctx(), pid)?;
                self.broadcast_guest(GuestEvent::Start, GuestType::Arc, pid).await;
                Ok(Response::Done)
            }
            Request::ArcShutdown => {
                self.expect_arc(ArcKind::Container)?;
                let Some(pid) = self.arc.id() else {
                    return Err(Error::NotRunning("ARC is not running".to_string()));
                };
                self.broadcast_guest(GuestEvent::Stop, GuestType::Arc, pid).await;
                self.arc.stop(&mut self.host.ctx(), pid)?;
                Ok(Response::Done)
            }
            Request::ArcVmStartup { cid } => {
                self.expect_arc(ArcKind::Vm)?;
                self.arc.start(&mut self.host.ctx(), cid)?;
                self.broadcast_guest(GuestEvent::Start, GuestType::ArcVm, cid).await;
                Ok(Response::ArcVmStarted {
                    devices: self.arc.guest_devices(),
                })
            }
            Request::ArcVmShutdown { cid } => {
                self.expect_arc(ArcKind::Vm)?;
                if !self.arc.is_started() {
                    return Err(Error::NotRunning("ARCVM is not running".to_string()));
                }
                self.broadcast_guest(GuestEvent::Stop, GuestType::ArcVm, cid).await;
                self.arc.stop(&mut self.host.ctx(), cid)?;
                Ok(Response::Done)
            }
            Request::VmStartup {
                id,
                is_termina,
                subnet_index,
            } => {
                let key = VmKey::new(id, is_termina);
                let device = self.crostini.start(&mut self.host.ctx(), key, subnet_index)?;
                self.broadcast_guest(GuestEvent::Start, key.guest_type(), id).await;
                Ok(Response::VmStarted(device))
            }
            Request::VmShutdown { id, is_termina } => {
                let key = VmKey::new(id, is_termina);
                if !self.crostini.is_running(key) {
                    return Err(Error::NotRunning(format!("VM {key} is not running")));
                }
                self.broadcast_guest(GuestEvent::Stop, key.guest_type(), id).await;
                self.crostini.stop(&mut self.host.ctx(), key)?;
                Ok(Response::Done)
            }
            Request::SetVpnIntent { socket, policy } => {
                let Some(socket) = socket else {
                    return Err(Error::InvalidArgument("invalid socket descriptor".to_string()));
                };
                routing::set_vpn_intent(&socket, policy)?;
                Ok(Response::Done)
            }
            Request::ConnectNamespace { fd, request } => {
                // Our duplicate is taken during connect; the passed fd closes on return
                let info = self.connected.connect(
                    &self.host.datapath,
                    &mut self.host.addrs,
                    &self.shill,
                    fd.as_ref().map(AsFd::as_fd),
                    &request,
                )?;
                Ok(Response::NamespaceConnected(info))
            }
            Request::GetTrafficCounters { uplinks } => {
                let counters = CountersService::get_counters(&self.host.datapath, &uplinks)
                    .map_err(|e| Error::packet_filter(&e))?;
                Ok(Response::TrafficCounters(counters_response(counters)))
            }
            Request::ModifyPortRule(req) => {
                port_rules::modify_port_rule(&self.host.datapath, &req)?;
                Ok(Response::Done)
            }
        }
    }

    /// Feed one device snapshot through the connection-manager adapter.
    pub async fn on_snapshot(&mut self, snapshot: &Snapshot) {
        for event in self.shill.apply(snapshot) {
            self.on_shill_event(event);
        }
        self.flush_forwarding().await;
    }

    fn on_shill_event(&mut self, event: ShillEvent) {
        match event {
            ShillEvent::DevicesChanged { added, removed } => {
                CountersService::on_devices_changed(&self.host.datapath, &added);
                let mut ctx = self.host.ctx();
                self.arc.on_devices_changed(&mut ctx, &added, &removed);
                self.crostini.on_devices_changed(&mut ctx, &added, &removed);
            }
            ShillEvent::DefaultDeviceChanged { new, prev } => {
                let mut ctx = self.host.ctx();
                self.arc
                    .on_default_device_changed(&mut ctx, new.as_ref(), prev.as_ref());
                self.crostini
                    .on_default_device_changed(&mut ctx, new.as_ref(), prev.as_ref());
            }
            ShillEvent::IpConfigsChanged { ifname, ipconfig } => {
                debug!("IP configuration of {} changed: {:?}", ifname, ipconfig);
            }
        }
    }

    pub async fn on_helper_event(&mut self, event: HelperEvent) {
        match event {
            HelperEvent::Message(_, msg) => match msg.payload {
                Some(Payload::NdProxy(msg)) => self.on_nd_proxy_message(&msg),
                other => warn!("Unexpected helper message: {:?}", other),
            },
            HelperEvent::Exited(kind) => self.helpers.on_exited(kind),
            HelperEvent::RestartDue(kind) => {
                self.helpers.on_restart_due(kind);
                // A fresh helper knows nothing of the pairs already forwarding
                if self.helpers.is_running(kind) {
                    self.host.forwarder.replay(kind);
                    self.flush_forwarding().await;
                }
            }
        }
    }

    /// Apply a discovery report from the ND proxy.
    fn on_nd_proxy_message(&self, msg: &NdProxyMessage) {
        if msg.ifname.is_empty() {
            warn!("ND proxy message without interface name");
            return;
        }
        let addr: Ipv6Addr = match msg.ip6addr.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("ND proxy reported invalid address {}", msg.ip6addr);
                return;
            }
        };

        let dp = &self.host.datapath;
        match msg.event() {
            NdProxyEvent::AddRoute => {
                if let Err(e) = dp.add_ipv6_host_route(&msg.ifname, addr, HOST_ROUTE_PREFIX_LEN) {
                    warn!("Failed to set up the IPv6 route for {}: {:#}", msg.ifname, e);
                }
            }
            NdProxyEvent::AddAddress => {
                if let Err(e) = dp.add_ipv6_address(&msg.ifname, addr) {
                    warn!("Failed to assign {} to {}: {:#}", addr, msg.ifname, e);
                }
            }
            NdProxyEvent::DeleteAddress => dp.remove_ipv6_address(&msg.ifname, addr),
            NdProxyEvent::Unknown => warn!("ND proxy message without event"),
        }
    }

    pub fn set_adb_sideloading(&mut self, enabled: bool) {
        self.crostini.set_adb_sideloading(&mut self.host.ctx(), enabled);
    }

    pub fn check_connected_namespaces(&mut self) -> usize {
        self.connected.check_liveness(&self.host.datapath)
    }

    /// Ordered teardown: connected namespaces, guests, host rules, sysctls.
    #[tracing::instrument(name = "manager.shutdown", skip(self))]
    pub async fn shutdown(&mut self) {
        info!("Shutting down and cleaning up");
        self.connected.disconnect_all(&self.host.datapath);
        {
            let mut ctx = self.host.ctx();
            self.crostini.shutdown(&mut ctx);
            self.arc.shutdown(&mut ctx);
        }
        self.flush_forwarding().await;
        self.helpers.shutdown();
        self.teardown_host();
    }

    /// Serve events until `shutdown` resolves, then tear everything down.
    pub async fn run(mut self, mut channels: Channels, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut liveness = tokio::time::interval(CHECK_INTERVAL);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                Some(envelope) = channels.requests.recv() => {
                    let result = self.handle(envelope.request).await;
                    if envelope.reply.send(result).is_err() {
                        debug!("Requester went away before the response");
                    }
                }
                Some(snapshot) = channels.snapshots.recv() => self.on_snapshot(&snapshot).await,
                Some(event) = channels.helper_events.recv() => self.on_helper_event(event).await,
                Some(enabled) = channels.sideloading.recv() => {
                    info!("ADB sideloading is {}", if enabled { "enabled" } else { "disabled" });
                    self.set_adb_sideloading(enabled);
                    self.flush_forwarding().await;
                }
                _ = liveness.tick() => {
                    let closed = self.check_connected_namespaces();
                    if closed > 0 {
                        info!("Released {} connected namespaces", closed);
                    }
                }
            }
        }

        self.shutdown().await;
    }
}
