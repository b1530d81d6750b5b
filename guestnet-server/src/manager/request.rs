//! Requests the manager answers and the handle used to submit them.

use crate::connected_ns::{ConnectNamespaceRequest, ConnectedNamespaceInfo};
use crate::counters::{Counter, CounterMap};
use crate::guest::arc::GuestDevice;
use crate::guest::crostini::VmDevice;
use crate::port_rules::PortRuleRequest;
use guestnet_common::fwmark::{TrafficSource, VpnRoutingPolicy};
use guestnet_common::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::os::fd::OwnedFd;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub enum Request {
    ArcStartup {
        pid: u64,
    },
    ArcShutdown,
    ArcVmStartup {
        cid: u64,
    },
    ArcVmShutdown {
        cid: u64,
    },
    VmStartup {
        id: u64,
        is_termina: bool,
        /// Pins the plugin VM subnet slot
        subnet_index: Option<u32>,
    },
    VmShutdown {
        id: u64,
        is_termina: bool,
    },
    SetVpnIntent {
        socket: Option<OwnedFd>,
        policy: VpnRoutingPolicy,
    },
    ConnectNamespace {
        fd: Option<OwnedFd>,
        request: ConnectNamespaceRequest,
    },
    GetTrafficCounters {
        /// Empty selects every uplink
        uplinks: BTreeSet<String>,
    },
    ModifyPortRule(PortRuleRequest),
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::ArcStartup { pid } => write!(f, "ArcStartup(pid {pid})"),
            Request::ArcShutdown => write!(f, "ArcShutdown"),
            Request::ArcVmStartup { cid } => write!(f, "ArcVmStartup(cid {cid})"),
            Request::ArcVmShutdown { cid } => write!(f, "ArcVmShutdown(cid {cid})"),
            Request::VmStartup { id, is_termina, .. } => write!(f, "VmStartup(id {id}, termina {is_termina})"),
            Request::VmShutdown { id, is_termina } => write!(f, "VmShutdown(id {id}, termina {is_termina})"),
            Request::SetVpnIntent { policy, .. } => write!(f, "SetVpnIntent({policy:?})"),
            Request::ConnectNamespace { request, .. } => write!(f, "ConnectNamespace(pid {})", request.pid),
            Request::GetTrafficCounters { .. } => write!(f, "GetTrafficCounters"),
            Request::ModifyPortRule(_) => write!(f, "ModifyPortRule"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkCounter {
    pub device: String,
    pub source: TrafficSource,
    pub counter: Counter,
}

pub fn counters_response(counters: CounterMap) -> Vec<UplinkCounter> {
    counters
        .into_iter()
        .map(|((source, device), counter)| UplinkCounter {
            device,
            source,
            counter,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Done,
    ArcVmStarted { devices: Vec<GuestDevice> },
    VmStarted(VmDevice),
    NamespaceConnected(ConnectedNamespaceInfo),
    TrafficCounters(Vec<UplinkCounter>),
}

pub struct Envelope {
    pub request: Request,
    pub reply: oneshot::Sender<Result<Response>>,
}

/// Create a handle and the receiving end the manager loop consumes.
pub fn channel(capacity: usize) -> (ManagerHandle, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ManagerHandle { tx }, rx)
}

/// Cloneable entry point for request transports.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ManagerHandle {
    /// Submit `request` and wait for the manager's answer.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn request(&self, request: Request) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| Error::NotRunning("manager has stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::NotRunning("manager dropped the request".to_string()))?
    }
}
