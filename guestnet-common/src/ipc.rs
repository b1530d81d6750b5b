//! Control messages exchanged between the manager and its helper processes.
//!
//! Every message is a protobuf-encoded [`IpHelperMessage`] preceded by its
//! length as a big-endian `u32`.

use anyhow::{bail, Context, Result};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected on both ends
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum GuestEvent {
    Unknown = 0,
    Start = 1,
    Stop = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum GuestType {
    Unknown = 0,
    Arc = 1,
    ArcVm = 2,
    TerminaVm = 3,
    PluginVm = 4,
}

/// Guest lifecycle notification broadcast to every helper
#[derive(Clone, PartialEq, prost::Message)]
pub struct GuestMessage {
    #[prost(enumeration = "GuestEvent", tag = "1")]
    pub event: i32,
    #[prost(enumeration = "GuestType", tag = "2")]
    pub guest_type: i32,
    /// PID for containers, context id for VMs
    #[prost(uint64, tag = "3")]
    pub id: u64,
}

/// Start or stop forwarding between an uplink and a guest bridge
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceMessage {
    #[prost(string, tag = "1")]
    pub dev_ifname: String,
    #[prost(string, tag = "2")]
    pub br_ifname: String,
    #[prost(bool, tag = "3")]
    pub teardown: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum NdProxyEvent {
    Unknown = 0,
    /// A guest owns `ip6addr`; install a /128 host route on `ifname`
    AddRoute = 1,
    /// Assign `ip6addr` to the guest bridge `ifname`
    AddAddress = 2,
    /// Remove a previously announced `ip6addr` from `ifname`
    DeleteAddress = 3,
}

/// Discovery report from the ND proxy
#[derive(Clone, PartialEq, prost::Message)]
pub struct NdProxyMessage {
    #[prost(enumeration = "NdProxyEvent", tag = "1")]
    pub event: i32,
    #[prost(string, tag = "2")]
    pub ifname: String,
    #[prost(string, tag = "3")]
    pub ip6addr: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IpHelperMessage {
    #[prost(oneof = "ip_helper_message::Payload", tags = "1, 2, 3")]
    pub payload: Option<ip_helper_message::Payload>,
}

pub mod ip_helper_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Guest(super::GuestMessage),
        #[prost(message, tag = "2")]
        Device(super::DeviceMessage),
        #[prost(message, tag = "3")]
        NdProxy(super::NdProxyMessage),
    }
}

use ip_helper_message::Payload;

impl GuestMessage {
    pub fn new(event: GuestEvent, guest_type: GuestType, id: u64) -> Self {
        Self {
            event: event as i32,
            guest_type: guest_type as i32,
            id,
        }
    }
}

impl NdProxyMessage {
    pub fn new(event: NdProxyEvent, ifname: &str, ip6addr: std::net::Ipv6Addr) -> Self {
        Self {
            event: event as i32,
            ifname: ifname.to_string(),
            ip6addr: ip6addr.to_string(),
        }
    }
}

impl From<GuestMessage> for IpHelperMessage {
    fn from(msg: GuestMessage) -> Self {
        Self {
            payload: Some(Payload::Guest(msg)),
        }
    }
}

impl From<DeviceMessage> for IpHelperMessage {
    fn from(msg: DeviceMessage) -> Self {
        Self {
            payload: Some(Payload::Device(msg)),
        }
    }
}

impl From<NdProxyMessage> for IpHelperMessage {
    fn from(msg: NdProxyMessage) -> Self {
        Self {
            payload: Some(Payload::NdProxy(msg)),
        }
    }
}

/// Encode `msg` into a length-prefixed frame.
pub fn encode_frame(msg: &IpHelperMessage) -> Result<Vec<u8>> {
    let len = msg.encoded_len();
    if len > MAX_FRAME_LEN {
        bail!("control message too large: {} bytes", len);
    }
    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    msg.encode(&mut buf).context("Failed to encode control message")?;
    Ok(buf)
}

pub async fn write_message<W>(w: &mut W, msg: &IpHelperMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    w.write_all(&frame)
        .await
        .context("Failed to write control message")?;
    w.flush().await.context("Failed to flush control socket")?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_message<R>(r: &mut R) -> Result<Option<IpHelperMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read control message length"),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("control message too large: {} bytes", len);
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body)
        .await
        .context("Truncated control message")?;

    let msg = IpHelperMessage::decode(body.as_slice()).context("Malformed control message")?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg: IpHelperMessage = GuestMessage::new(GuestEvent::Start, GuestType::ArcVm, 2).into();

        write_message(&mut a, &msg).await.unwrap();
        drop(a);

        let got = read_message(&mut b).await.unwrap().unwrap();
        assert_eq!(got, msg);
        assert!(read_message(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(read_message(&mut b).await.is_err());
    }

    #[test]
    fn test_enum_accessors() {
        let msg = NdProxyMessage::new(
            NdProxyEvent::AddAddress,
            "arc_eth0",
            "2001:db8::1".parse().unwrap(),
        );
        assert_eq!(msg.event(), NdProxyEvent::AddAddress);
        assert_eq!(msg.ip6addr, "2001:db8::1");
    }
}
