//! Thin wrapper around the kernel's rtnetlink link surface: one-shot link
//! enumeration plus a cancellable subscription to link change events.

use anyhow::Context;
use anyhow::Result;
use futures::stream::StreamExt;
use futures::stream::TryStreamExt;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::link::InfoKind;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::link::LinkInfo;
use netlink_packet_route::link::LinkMessage;
use netlink_packet_route::link::State;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::AsyncSocket;
use netlink_sys::SocketAddr;
use rtnetlink::constants::RTMGRP_LINK;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

/// Kind of change a [`LinkUpdate`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// `RTM_NEWLINK`: the link was created or one of its attributes changed.
    New,
    /// `RTM_DELLINK`: the link was removed.
    Del,
}

/// One link change delivered by [`subscribe_link_updates`].
#[derive(Debug, Clone)]
pub struct LinkUpdate {
    pub event: LinkEvent,
    pub name: String,
    pub is_bridge: bool,
    pub oper_up: bool,
}

impl LinkUpdate {
    fn from_message(event: LinkEvent, message: &LinkMessage) -> Option<Self> {
        Some(Self {
            event,
            name: link_name(message)?,
            is_bridge: is_bridge(message),
            oper_up: is_oper_up(message),
        })
    }
}

fn link_name(message: &LinkMessage) -> Option<String> {
    message.attributes.iter().find_map(|attribute| match attribute {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

fn is_bridge(message: &LinkMessage) -> bool {
    message.attributes.iter().any(|attribute| match attribute {
        LinkAttribute::LinkInfo(infos) => infos
            .iter()
            .any(|info| matches!(info, LinkInfo::Kind(InfoKind::Bridge))),
        _ => false,
    })
}

fn is_oper_up(message: &LinkMessage) -> bool {
    message
        .attributes
        .iter()
        .any(|attribute| matches!(attribute, LinkAttribute::OperState(State::Up)))
}

/// Names of all kernel links whose kind is `bridge` at the moment of the call.
pub async fn list_bridge_names() -> Result<Vec<String>> {
    let (connection, handle, _) =
        rtnetlink::new_connection().context("opening rtnetlink connection")?;
    tokio::spawn(connection);

    let mut links = handle.link().get().execute();
    let mut names = Vec::new();
    while let Some(message) = links.try_next().await.context("dumping kernel links")? {
        if is_bridge(&message) {
            if let Some(name) = link_name(&message) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Stats a single link by name.
///
/// Returns `Ok(Some(oper_up))` when the link exists, `Ok(None)` when the
/// kernel does not know it, and an error for anything else.
pub async fn link_oper_up(name: &str) -> Result<Option<bool>> {
    let (connection, handle, _) =
        rtnetlink::new_connection().context("opening rtnetlink connection")?;
    tokio::spawn(connection);

    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(message) => Ok(message.map(|message| is_oper_up(&message))),
        Err(rtnetlink::Error::NetlinkError(err)) if err.raw_code() == -libc::ENODEV => Ok(None),
        Err(err) => Err(err).with_context(|| format!("could not check link {name}")),
    }
}

/// Joins the kernel's link multicast group and forwards every parseable
/// update until `stop` is cancelled.
///
/// The returned channel is bounded; the kernel may drop multicast messages
/// while the consumer lags. Consumers re-derive state from every event they
/// do see, so delivery only needs to be eventual.
pub fn subscribe_link_updates(stop: CancellationToken) -> Result<mpsc::Receiver<LinkUpdate>> {
    let (mut connection, _handle, mut messages) =
        rtnetlink::new_connection().context("opening rtnetlink connection")?;
    connection
        .socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, RTMGRP_LINK))
        .context("joining the rtnetlink link multicast group")?;

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let forward = async {
            while let Some((message, _addr)) = messages.next().await {
                let update = match message.payload {
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(ref link)) => {
                        LinkUpdate::from_message(LinkEvent::New, link)
                    }
                    NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(ref link)) => {
                        LinkUpdate::from_message(LinkEvent::Del, link)
                    }
                    _ => None,
                };
                let Some(update) = update else { continue };
                if tx.send(update).await.is_err() {
                    return;
                }
            }
        };

        tokio::select! {
            () = stop.cancelled() => debug!("stopping link update subscription"),
            () = connection => warn!("rtnetlink connection terminated"),
            () = forward => debug!("link update stream ended"),
        }
    });

    Ok(rx)
}
