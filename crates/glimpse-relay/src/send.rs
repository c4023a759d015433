//! Per-client outbound serialization.
//!
//! Every connected client gets one writer task fed by two paths:
//!
//! - the non-frame path, an unbounded FIFO that never drops, and
//! - the frame path, a per-session slot allowing at most one frame in
//!   flight with a single latest-wins pending replacement.
//!
//! A slow viewer therefore never builds a frame backlog: old frames are
//! silently replaced while ordinary messages keep their order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::Sink;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use glimpse_protocol::framing::send_value;
use glimpse_protocol::messages::ConnectionId;
use glimpse_protocol::rpc::ServerEvent;

enum Outbound {
    Event(ServerEvent),
    Frame {
        connection_id: ConnectionId,
        event: ServerEvent,
    },
}

/// The frame slot state machine. See module docs.
#[derive(Default)]
pub(crate) struct FrameSlot {
    in_flight: bool,
    pending: Option<ServerEvent>,
}

impl FrameSlot {
    /// Offer a frame; returns it back when it should be written now.
    pub(crate) fn offer(&mut self, event: ServerEvent) -> Option<ServerEvent> {
        if self.in_flight {
            if self.pending.replace(event).is_some() {
                tracing::debug!("Pending frame replaced (latest wins)");
            }
            None
        } else {
            self.in_flight = true;
            Some(event)
        }
    }

    /// The in-flight frame finished writing; returns the next frame to
    /// write, keeping the slot in flight when one is pending.
    pub(crate) fn completed(&mut self) -> Option<ServerEvent> {
        match self.pending.take() {
            Some(next) => Some(next),
            None => {
                self.in_flight = false;
                None
            }
        }
    }

    /// A write failed: drop everything.
    pub(crate) fn failed(&mut self) {
        self.in_flight = false;
        self.pending = None;
    }

    #[cfg(test)]
    pub(crate) fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

type SlotMap = Arc<Mutex<HashMap<ConnectionId, FrameSlot>>>;

/// Handle to one client's writer task.
pub struct ClientSender {
    queue: mpsc::UnboundedSender<Outbound>,
    slots: SlotMap,
    shutdown: CancellationToken,
    writer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ClientSender {
    /// Spawn the writer task over the client's write half.
    pub fn spawn<S>(sink: S) -> Arc<Self>
    where
        S: Sink<bytes::Bytes, Error = std::io::Error> + Unpin + Send + 'static,
    {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let slots: SlotMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let writer = tokio::spawn(writer_task(
            sink,
            queue_rx,
            queue.clone(),
            Arc::clone(&slots),
            shutdown.clone(),
        ));

        Arc::new(Self {
            queue,
            slots,
            shutdown,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Queue a non-frame event; FIFO, never dropped.
    pub fn enqueue(&self, event: ServerEvent) {
        let _ = self.queue.send(Outbound::Event(event));
    }

    /// Queue a frame event through the per-session coalescing slot.
    pub fn enqueue_frame(&self, connection_id: &str, event: ServerEvent) {
        let to_send = {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slots
                .entry(connection_id.to_string())
                .or_default()
                .offer(event)
        };
        if let Some(event) = to_send {
            let _ = self.queue.send(Outbound::Frame {
                connection_id: connection_id.to_string(),
                event,
            });
        }
    }

    /// Forget a session's slot (its frames can no longer arrive).
    pub fn drop_session(&self, connection_id: &str) {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(connection_id);
    }

    /// Stop the writer and wait for its clean exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn writer_task<S>(
    mut sink: S,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    requeue: mpsc::UnboundedSender<Outbound>,
    slots: SlotMap,
    shutdown: CancellationToken,
) where
    S: Sink<bytes::Bytes, Error = std::io::Error> + Unpin + Send + 'static,
{
    loop {
        let outbound = tokio::select! {
            () = shutdown.cancelled() => return,
            outbound = queue.recv() => match outbound {
                Some(outbound) => outbound,
                None => return,
            },
        };

        match outbound {
            Outbound::Event(event) => {
                if let Err(e) = send_value(&mut sink, &event).await {
                    tracing::debug!("Client write failed: {e}");
                    fail_all(&slots);
                    return;
                }
            }
            Outbound::Frame {
                connection_id,
                event,
            } => {
                if let Err(e) = send_value(&mut sink, &event).await {
                    tracing::debug!("Client frame write failed: {e}");
                    fail_all(&slots);
                    return;
                }
                // Delivery complete: promote a pending frame, if any.
                let next = {
                    let mut slots = slots
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    slots.get_mut(&connection_id).and_then(FrameSlot::completed)
                };
                if let Some(event) = next {
                    let _ = requeue.send(Outbound::Frame {
                        connection_id,
                        event,
                    });
                }
            }
        }
    }
}

fn fail_all(slots: &SlotMap) {
    let mut slots = slots
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    for slot in slots.values_mut() {
        slot.failed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glimpse_protocol::framing::{frame_duplex, recv_value};
    use glimpse_protocol::messages::MessageKind;

    fn frame_event(n: u64) -> ServerEvent {
        ServerEvent::MessageReceived {
            connection_id: "s1".into(),
            sender_client_id: "c1".into(),
            kind: MessageKind::ScreenFrame,
            data: n.to_le_bytes().to_vec(),
        }
    }

    fn plain_event(n: u64) -> ServerEvent {
        ServerEvent::MessageReceived {
            connection_id: "s1".into(),
            sender_client_id: "c1".into(),
            kind: MessageKind::DisplayList,
            data: n.to_le_bytes().to_vec(),
        }
    }

    fn payload(event: &ServerEvent) -> u64 {
        match event {
            ServerEvent::MessageReceived { data, .. } => {
                u64::from_le_bytes(data.as_slice().try_into().unwrap())
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slot_keeps_at_most_one_in_flight_and_one_pending() {
        let mut slot = FrameSlot::default();

        // A goes straight out.
        let a = slot.offer(frame_event(1)).unwrap();
        assert_eq!(payload(&a), 1);
        assert!(slot.is_in_flight());

        // B parks as pending; C replaces it.
        assert!(slot.offer(frame_event(2)).is_none());
        assert!(slot.offer(frame_event(3)).is_none());

        // Ack of A releases C, slot stays in flight.
        let c = slot.completed().unwrap();
        assert_eq!(payload(&c), 3);
        assert!(slot.is_in_flight());

        // Ack of C leaves the slot idle.
        assert!(slot.completed().is_none());
        assert!(!slot.is_in_flight());
    }

    #[test]
    fn slot_failure_clears_both_states() {
        let mut slot = FrameSlot::default();
        slot.offer(frame_event(1)).unwrap();
        assert!(slot.offer(frame_event(2)).is_none());
        slot.failed();
        assert!(!slot.is_in_flight());
        // The next frame goes straight out again.
        assert_eq!(payload(&slot.offer(frame_event(3)).unwrap()), 3);
    }

    #[tokio::test]
    async fn non_frame_events_preserve_fifo_order() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (sink, _stream) = futures::StreamExt::split(frame_duplex(ours));
        let sender = ClientSender::spawn(sink);
        let mut reader = frame_duplex(theirs);

        for n in 0..20 {
            sender.enqueue(plain_event(n));
        }
        for n in 0..20 {
            let got: ServerEvent = recv_value(&mut reader).await.unwrap().unwrap();
            assert_eq!(payload(&got), n);
        }
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn frames_flow_through_the_writer() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (sink, _stream) = futures::StreamExt::split(frame_duplex(ours));
        let sender = ClientSender::spawn(sink);
        let mut reader = frame_duplex(theirs);

        sender.enqueue_frame("s1", frame_event(1));
        let got: ServerEvent = recv_value(&mut reader).await.unwrap().unwrap();
        assert_eq!(payload(&got), 1);
        sender.shutdown().await;
    }

    #[tokio::test]
    async fn burst_of_frames_collapses_to_first_and_latest() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (sink, _stream) = futures::StreamExt::split(frame_duplex(ours));
        let sender = ClientSender::spawn(sink);
        let mut reader = frame_duplex(theirs);

        // Enqueue a burst before the writer can drain: the first frame
        // goes in flight, the rest collapse into the pending slot.
        sender.enqueue_frame("s1", frame_event(1));
        sender.enqueue_frame("s1", frame_event(2));
        sender.enqueue_frame("s1", frame_event(3));
        sender.enqueue_frame("s1", frame_event(4));

        let first: ServerEvent = recv_value(&mut reader).await.unwrap().unwrap();
        let second: ServerEvent = recv_value(&mut reader).await.unwrap().unwrap();
        assert_eq!(payload(&first), 1);
        assert_eq!(payload(&second), 4);

        // Nothing else arrives.
        sender.enqueue(plain_event(99));
        let third: ServerEvent = recv_value(&mut reader).await.unwrap().unwrap();
        assert_eq!(payload(&third), 99);
        sender.shutdown().await;
    }
}
