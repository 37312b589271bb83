//! Link add/remove notifications from an RTNLGRP_LINK netlink subscription

use crate::netlink::{link_mac, link_name};
use futures::StreamExt;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{AsyncSocket, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Multicast group mask of RTNLGRP_LINK
const RTMGRP_LINK: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventKind {
    Added,
    Removed,
}

/// A link appeared or vanished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub kind: LinkEventKind,
    pub name: String,
    pub mac: String,
}

/// Event for one RTM_NEWLINK/RTM_DELLINK broadcast; links without an
/// ethernet address are skipped
pub fn link_event(message: NetlinkMessage<RouteNetlinkMessage>) -> Option<LinkEvent> {
    let (kind, link) = match message.payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => (LinkEventKind::Added, link),
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => (LinkEventKind::Removed, link),
        _ => return None,
    };
    Some(LinkEvent {
        kind,
        name: link_name(&link)?,
        mac: link_mac(&link)?,
    })
}

/// Streams [`LinkEvent`]s, resubscribing if the socket fails
#[derive(Debug, Default)]
pub struct LinkMonitor;

impl LinkMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Start monitoring; the task ends once the receiver is dropped
    pub fn spawn(self) -> (mpsc::Receiver<LinkEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(async move {
            loop {
                match run_monitor(&tx).await {
                    Ok(true) => return,
                    Ok(false) => warn!("link subscription closed, resubscribing"),
                    Err(e) => warn!("link subscription failed: {}, resubscribing", e),
                }
                tokio::time::sleep(RESTART_DELAY).await;
            }
        });
        (rx, handle)
    }
}

/// Returns `Ok(true)` when the receiver went away
async fn run_monitor(tx: &mpsc::Sender<LinkEvent>) -> std::io::Result<bool> {
    // the handle keeps the connection task alive while we only listen
    let (mut connection, _handle, mut messages) = rtnetlink::new_connection()?;
    connection
        .socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, RTMGRP_LINK))?;
    let connection = tokio::spawn(connection);

    let mut receiver_gone = false;
    while let Some((message, _)) = messages.next().await {
        let Some(event) = link_event(message) else {
            continue;
        };
        debug!("link event {:?} {} {}", event.kind, event.name, event.mac);
        if tx.send(event).await.is_err() {
            receiver_gone = true;
            break;
        }
    }
    connection.abort();
    Ok(receiver_gone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_core::NetlinkHeader;
    use netlink_packet_route::link::{LinkAttribute, LinkMessage};

    fn broadcast(payload: RouteNetlinkMessage) -> NetlinkMessage<RouteNetlinkMessage> {
        NetlinkMessage::new(NetlinkHeader::default(), NetlinkPayload::InnerMessage(payload))
    }

    fn link(name: &str, address: Vec<u8>) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.push(LinkAttribute::Address(address));
        msg
    }

    #[test]
    fn test_new_link_is_added() {
        let msg = broadcast(RouteNetlinkMessage::NewLink(link("eth1", vec![0x52, 0x54, 0x9e, 0x12, 0x34, 0x56])));
        assert_eq!(
            link_event(msg),
            Some(LinkEvent {
                kind: LinkEventKind::Added,
                name: "eth1".to_string(),
                mac: "52:54:9e:12:34:56".to_string(),
            })
        );
    }

    #[test]
    fn test_del_link_is_removed() {
        let msg = broadcast(RouteNetlinkMessage::DelLink(link("nic1a2b3c4d5e6", vec![0xee, 0xee, 0xee, 0, 0, 1])));
        let event = link_event(msg).unwrap();
        assert_eq!(event.kind, LinkEventKind::Removed);
        assert_eq!(event.name, "nic1a2b3c4d5e6");
        assert_eq!(event.mac, "ee:ee:ee:00:00:01");
    }

    #[test]
    fn test_skips_non_ethernet_and_other_messages() {
        // ipip tunnels carry a 4 byte address
        let tunnel = broadcast(RouteNetlinkMessage::NewLink(link("tunl0", vec![0, 0, 0, 0])));
        assert_eq!(link_event(tunnel), None);

        let unnamed = broadcast(RouteNetlinkMessage::NewLink(LinkMessage::default()));
        assert_eq!(link_event(unnamed), None);

        let route = broadcast(RouteNetlinkMessage::NewRoute(Default::default()));
        assert_eq!(link_event(route), None);
    }
}
