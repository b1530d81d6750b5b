//! Control-socket framing between the manager and a helper, over an
//! in-memory duplex stream.

use guestnet_common::ipc::{
    ip_helper_message::Payload, read_message, write_message, DeviceMessage, GuestEvent,
    GuestMessage, GuestType, IpHelperMessage, NdProxyEvent, NdProxyMessage,
};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let (mut manager, mut helper) = tokio::io::duplex(4096);

    let sent: Vec<IpHelperMessage> = vec![
        GuestMessage::new(GuestEvent::Start, GuestType::Arc, 1234).into(),
        DeviceMessage {
            dev_ifname: "eth0".to_string(),
            br_ifname: "arc_eth0".to_string(),
            teardown: false,
        }
        .into(),
        NdProxyMessage::new(
            NdProxyEvent::AddRoute,
            "arc_eth0",
            "2001:db8::5".parse().unwrap(),
        )
        .into(),
    ];

    for msg in &sent {
        write_message(&mut manager, msg).await.unwrap();
    }
    drop(manager);

    let mut received = Vec::new();
    while let Some(msg) = read_message(&mut helper).await.unwrap() {
        received.push(msg);
    }
    assert_eq!(received, sent);

    match &received[1].payload {
        Some(Payload::Device(dev)) => {
            assert_eq!(dev.dev_ifname, "eth0");
            assert!(!dev.teardown);
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn test_truncated_frame_is_an_error() {
    let (mut a, mut b) = tokio::io::duplex(64);
    a.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
    drop(a);
    assert!(read_message(&mut b).await.is_err());
}

#[tokio::test]
async fn test_empty_message_roundtrip() {
    let (mut a, mut b) = tokio::io::duplex(64);
    write_message(&mut a, &IpHelperMessage::default()).await.unwrap();
    let got = read_message(&mut b).await.unwrap().unwrap();
    assert!(got.payload.is_none());
}
