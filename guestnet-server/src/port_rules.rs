//! Port access, lockdown and forwarding rules requested by clients.

use crate::datapath::{Datapath, IpFamily, Rule};
use guestnet_common::net_util::is_valid_ifname;
use guestnet_common::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Access,
    Lockdown,
    Forwarding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl TryFrom<i32> for Operation {
    type Error = Error;

    fn try_from(v: i32) -> Result<Self> {
        match v {
            1 => Ok(Operation::Create),
            2 => Ok(Operation::Delete),
            _ => Err(Error::InvalidArgument(format!("unknown operation {v}"))),
        }
    }
}

impl TryFrom<i32> for RuleType {
    type Error = Error;

    fn try_from(v: i32) -> Result<Self> {
        match v {
            1 => Ok(RuleType::Access),
            2 => Ok(RuleType::Lockdown),
            3 => Ok(RuleType::Forwarding),
            _ => Err(Error::InvalidArgument(format!("unknown port rule type {v}"))),
        }
    }
}

impl TryFrom<i32> for Protocol {
    type Error = Error;

    fn try_from(v: i32) -> Result<Self> {
        match v {
            1 => Ok(Protocol::Tcp),
            2 => Ok(Protocol::Udp),
            _ => Err(Error::InvalidArgument(format!("unknown protocol {v}"))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Port rule request as received; enum fields are raw wire values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRuleRequest {
    pub op: i32,
    pub rule_type: i32,
    pub proto: i32,
    /// Interface the traffic arrives on; empty matches any for access rules
    pub input_ifname: String,
    pub input_dst_ip: Option<Ipv4Addr>,
    pub input_dst_port: u32,
    /// DNAT target of forwarding rules
    pub dst_ip: Option<Ipv4Addr>,
    pub dst_port: u32,
}

/// A validated port rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRule {
    /// Accept inbound `proto`/`port`, optionally only on `ifname`
    Access {
        proto: Protocol,
        port: u16,
        ifname: String,
    },
    /// Block local connections to `proto`/`port` over loopback
    Lockdown { proto: Protocol, port: u16 },
    /// DNAT `proto` arriving on `ifname` for `input_dst:port` to `dst:dst_port`
    Forwarding {
        proto: Protocol,
        ifname: String,
        input_dst: Option<Ipv4Addr>,
        port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
    },
}

fn port(v: u32, what: &str) -> Result<u16> {
    match u16::try_from(v) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(Error::InvalidArgument(format!("invalid {what} {v}"))),
    }
}

impl PortRule {
    pub fn from_request(req: &PortRuleRequest) -> Result<(Operation, Self)> {
        let op = Operation::try_from(req.op)?;
        let rule_type = RuleType::try_from(req.rule_type)?;
        let proto = Protocol::try_from(req.proto)?;
        let input_port = port(req.input_dst_port, "input port")?;

        if !req.input_ifname.is_empty() && !is_valid_ifname(&req.input_ifname) {
            return Err(Error::InvalidArgument(format!(
                "invalid interface name {:?}",
                req.input_ifname
            )));
        }

        let rule = match rule_type {
            RuleType::Access => PortRule::Access {
                proto,
                port: input_port,
                ifname: req.input_ifname.clone(),
            },
            RuleType::Lockdown => PortRule::Lockdown {
                proto,
                port: input_port,
            },
            RuleType::Forwarding => {
                if req.input_ifname.is_empty() {
                    return Err(Error::InvalidArgument(
                        "forwarding rule needs an input interface".to_string(),
                    ));
                }
                let dst = req.dst_ip.ok_or_else(|| {
                    Error::InvalidArgument("forwarding rule needs a destination".to_string())
                })?;
                PortRule::Forwarding {
                    proto,
                    ifname: req.input_ifname.clone(),
                    input_dst: req.input_dst_ip,
                    port: input_port,
                    dst,
                    dst_port: port(req.dst_port, "destination port")?,
                }
            }
        };
        Ok((op, rule))
    }

    fn rules(&self) -> Vec<Rule> {
        match self {
            PortRule::Access { proto, port, ifname } => {
                let iif = if ifname.is_empty() {
                    String::new()
                } else {
                    format!("-i {ifname} ")
                };
                let spec = format!("{iif}-p {proto} --dport {port} -j ACCEPT");
                IpFamily::BOTH
                    .iter()
                    .map(|&family| Rule {
                        family,
                        ..Rule::v4("filter", "INPUT", spec.clone())
                    })
                    .collect()
            }
            PortRule::Lockdown { proto, port } => {
                let spec = format!("-o lo -p {proto} --dport {port} -j DROP");
                IpFamily::BOTH
                    .iter()
                    .map(|&family| Rule {
                        family,
                        ..Rule::v4("filter", "OUTPUT", spec.clone())
                    })
                    .collect()
            }
            PortRule::Forwarding {
                proto,
                ifname,
                input_dst,
                port,
                dst,
                dst_port,
            } => {
                let match_dst = input_dst.map(|d| format!("-d {d} ")).unwrap_or_default();
                vec![
                    Rule::v4(
                        "nat",
                        "PREROUTING",
                        format!(
                            "-i {ifname} -p {proto} {match_dst}--dport {port} -j DNAT --to-destination {dst}:{dst_port}"
                        ),
                    ),
                    Rule::v4(
                        "filter",
                        "FORWARD",
                        format!("-i {ifname} -p {proto} -d {dst} --dport {dst_port} -j ACCEPT"),
                    ),
                ]
            }
        }
    }
}

/// Validate and apply a port rule request.
#[tracing::instrument(name = "port_rules.modify", skip(datapath))]
pub fn modify_port_rule(datapath: &Datapath, req: &PortRuleRequest) -> Result<()> {
    let (op, rule) = PortRule::from_request(req)?;
    let rules = rule.rules();
    match op {
        Operation::Create => {
            datapath
                .add_rules(&rules)
                .map_err(|e| Error::packet_filter(&e))?;
            info!("Installed port rule {:?}", rule);
        }
        Operation::Delete => {
            datapath.remove_rules(&rules);
            info!("Removed port rule {:?}", rule);
        }
    }
    Ok(())
}
