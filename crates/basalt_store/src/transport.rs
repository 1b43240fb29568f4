//! UDP datagram transport for the replica engine.
//!
//! Sends are best-effort and non-blocking; a full socket buffer drops the
//! datagram, which the protocol tolerates. Timers are implemented as delayed
//! self-delivery: the deferred message is fed back into the node's event
//! queue after the delay, so it re-enters the replica on the same loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use basalt_mvtso::engine::{
    encode_message, Address, GroupId, Message, TimerEvent, Transport,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    /// Replica addresses per group, indexed by replica position.
    groups: Vec<Vec<SocketAddr>>,
    /// Event queue shared with the node loop; timers feed back into it.
    events: mpsc::UnboundedSender<(Address, Message)>,
}

impl UdpTransport {
    pub fn new(
        socket: Arc<UdpSocket>,
        groups: Vec<Vec<SocketAddr>>,
        events: mpsc::UnboundedSender<(Address, Message)>,
    ) -> Self {
        Self {
            socket,
            groups,
            events,
        }
    }

    fn send_datagram(&self, to: SocketAddr, msg: &Message) {
        let frame = encode_message(msg);
        if let Err(err) = self.socket.try_send_to(&frame, to) {
            warn!(to = %to, error = %err, "datagram send failed");
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: Address, msg: Message) {
        self.send_datagram(to, &msg);
    }

    fn send_replica(&self, group: GroupId, replica: usize, msg: Message) {
        let Some(addr) = self
            .groups
            .get(group as usize)
            .and_then(|members| members.get(replica))
        else {
            warn!(group, replica, "send to unknown replica");
            return;
        };
        self.send_datagram(*addr, &msg);
    }

    fn send_group(&self, group: GroupId, msg: Message) {
        let Some(members) = self.groups.get(group as usize) else {
            warn!(group, "send to unknown group");
            return;
        };
        for addr in members {
            self.send_datagram(*addr, &msg);
        }
    }

    fn timer(&self, delay_ms: u64, event: TimerEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            // The loop may have shut down; a dead queue is fine.
            let _ = events.send((event.from, event.msg));
        });
    }
}
