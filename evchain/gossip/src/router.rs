use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::queue::FrameQueue;
use crate::decoder::StreamDecoder;

/// A fully reassembled inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub source: String,
    pub data: Vec<u8>,
}

struct DecodeState {
    decoders: HashMap<Uuid, StreamDecoder>,
    last_seen: HashMap<Uuid, Instant>,
}

struct RetransmitFrame {
    frame: Frame,
    transmit_count: usize,
}

struct QueueState {
    message_queue: VecDeque<FrameQueue>,
    retransmit_queue: VecDeque<RetransmitFrame>,
    frames_seen: HashMap<Uuid, HashSet<u16>>,
}

/// The frame-level heart of the transport: slices outbound messages,
/// reassembles inbound streams, and re-gossips foreign frames a bounded
/// number of times.
///
/// Two independent lock domains — `decode` and `queues` — are never taken
/// in opposite orders.
pub struct FrameRouter {
    source_name: String,
    retransmit_multiplier: usize,
    wait_timeout: Duration,
    decode: Mutex<DecodeState>,
    queues: Mutex<QueueState>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

impl FrameRouter {
    pub fn new(
        source_name: impl Into<String>,
        retransmit_multiplier: usize,
        wait_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>) {
        let (inbound, receiver) = mpsc::unbounded_channel();
        let router = Arc::new(FrameRouter {
            source_name: source_name.into(),
            retransmit_multiplier,
            wait_timeout,
            decode: Mutex::new(DecodeState {
                decoders: HashMap::new(),
                last_seen: HashMap::new(),
            }),
            queues: Mutex::new(QueueState {
                message_queue: VecDeque::new(),
                retransmit_queue: VecDeque::new(),
                frames_seen: HashMap::new(),
            }),
            inbound,
        });
        (router, receiver)
    }

    /// Queues a message for fragmented delivery.
    pub fn enqueue(&self, bytes: Vec<u8>) {
        let queue = FrameQueue::new(self.source_name.clone(), bytes);
        self.queues.lock().message_queue.push_back(queue);
    }

    pub fn has_outbound(&self) -> bool {
        let queues = self.queues.lock();
        !queues.message_queue.is_empty() || !queues.retransmit_queue.is_empty()
    }

    /// Times a frame is sent in total (initial send plus retransmissions),
    /// scaled by cluster size. Clamped so every frame goes out at least
    /// once even in tiny clusters.
    pub fn transmission_count(&self, member_count: usize) -> usize {
        let scale = ((member_count + 1) as f64).log10().ceil() as usize;
        (self.retransmit_multiplier * scale).max(1)
    }

    /// Pops the next frame to put on the wire: fresh message frames first,
    /// then pending retransmissions.
    pub fn next_outbound(&self, mtu: usize, member_count: usize) -> Option<Vec<u8>> {
        let mut queues = self.queues.lock();

        loop {
            let Some(front) = queues.message_queue.front_mut() else {
                break;
            };
            match front.next_frame(mtu) {
                Ok(Some(frame)) => {
                    if self.transmission_count(member_count) > 1 {
                        queues.retransmit_queue.push_back(RetransmitFrame {
                            frame: frame.clone(),
                            transmit_count: 1,
                        });
                    }
                    return Some(frame.encode());
                }
                Ok(None) => {
                    queues.message_queue.pop_front();
                }
                Err(err) => {
                    // The rest of this message cannot be sent either.
                    warn!(%err, "failed to slice outbound message, dropping it");
                    queues.message_queue.pop_front();
                    return None;
                }
            }
        }

        let front = queues.retransmit_queue.front_mut()?;
        front.transmit_count += 1;
        let encoded = front.frame.encode();
        debug!(
            stream = %front.frame.stream_id,
            frame_number = front.frame.frame_number,
            "retransmitting frame"
        );
        if front.transmit_count >= self.transmission_count(member_count) {
            queues.retransmit_queue.pop_front();
        }
        Some(encoded)
    }

    /// Ingests one frame off the wire: bookkeeps retransmission for
    /// foreign frames, feeds the stream decoder, and emits the message
    /// once complete.
    pub fn handle_frame(&self, bytes: &[u8]) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "failed to decode inbound frame");
                return;
            }
        };

        debug!(
            stream = %frame.stream_id,
            frame_number = frame.frame_number,
            is_last = frame.is_last,
            source = %frame.source,
            "received frame"
        );

        // Frames first seen from a foreign source are re-gossiped.
        if frame.source != self.source_name {
            let mut queues = self.queues.lock();
            let seen = queues.frames_seen.entry(frame.stream_id).or_default();
            if seen.insert(frame.frame_number) {
                queues.retransmit_queue.push_back(RetransmitFrame {
                    frame: frame.clone(),
                    transmit_count: 0,
                });
            }
        }

        let mut decode = self.decode.lock();
        decode.last_seen.insert(frame.stream_id, Instant::now());
        let decoder = decode
            .decoders
            .entry(frame.stream_id)
            .or_insert_with(|| StreamDecoder::new(frame.stream_id));

        if decoder.has_frame(frame.frame_number) {
            return;
        }

        let stream_id = frame.stream_id;
        if let Err(err) = decoder.read_frame(frame) {
            warn!(%err, stream = %stream_id, "failed to ingest frame");
            return;
        }

        if decoder.received_all() {
            debug!(stream = %stream_id, "received all frames for stream");
            let decoder = decode
                .decoders
                .remove(&stream_id)
                .expect("decoder present");

            let source = match decoder.source() {
                Ok(source) => source.to_string(),
                Err(err) => {
                    warn!(%err, stream = %stream_id, "completed stream has no source");
                    return;
                }
            };
            let data = match decoder.decode() {
                Ok(data) => data,
                Err(err) => {
                    warn!(%err, stream = %stream_id, "failed to decode completed stream");
                    return;
                }
            };

            let _ = self.inbound.send(InboundMessage { source, data });
        }
    }

    /// Drops per-stream state that has seen no traffic for the configured
    /// wait timeout. Bounds memory under frame loss.
    pub fn prune(&self) {
        let mut decode = self.decode.lock();
        let mut queues = self.queues.lock();

        let stale: Vec<Uuid> = decode
            .last_seen
            .iter()
            .filter(|(_, last_seen)| last_seen.elapsed() > self.wait_timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in stale {
            if decode.decoders.remove(&id).is_some() {
                warn!(stream = %id, "stream idle too long, dropping decoder state");
            }
            decode.last_seen.remove(&id);
            queues.frames_seen.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn foreign_frame(number: u16, is_last: bool, id: Uuid) -> Frame {
        Frame {
            is_compressed: false,
            stream_id: id,
            frame_number: number,
            is_last,
            source: "other-node".to_string(),
            data: vec![number as u8],
        }
    }

    #[test]
    fn transmission_count_is_clamped_to_one() {
        let (router, _rx) = FrameRouter::new("n", 2, Duration::from_secs(10));
        // log10(1+1) rounds up to 1.
        assert_eq!(router.transmission_count(1), 2);
        // A 1-member cluster still transmits once.
        let (router, _rx) = FrameRouter::new("n", 0, Duration::from_secs(10));
        assert_eq!(router.transmission_count(1), 1);
        // Larger clusters scale with log10.
        let (router, _rx) = FrameRouter::new("n", 2, Duration::from_secs(10));
        assert_eq!(router.transmission_count(50), 4);
    }

    #[test]
    fn outbound_messages_are_sliced_then_retransmitted() {
        let (router, _rx) = FrameRouter::new("n", 2, Duration::from_secs(10));
        router.enqueue(b"hello world".to_vec());

        let first = router.next_outbound(1024, 10).expect("first send");
        let frame = Frame::decode(&first).unwrap();
        assert_eq!(frame.frame_number, 0);
        assert!(frame.is_last);

        // transmission_count(10) = 2 * ceil(log10(11)) = 4: three more
        // retransmissions follow, then the queue drains.
        for _ in 0..3 {
            let again = router.next_outbound(1024, 10).expect("retransmission");
            assert_eq!(Frame::decode(&again).unwrap(), frame);
        }
        assert!(router.next_outbound(1024, 10).is_none());
    }

    #[test]
    fn completed_inbound_stream_is_delivered() {
        let (router, mut rx) = FrameRouter::new("n", 2, Duration::from_secs(10));
        let id = Uuid::new_v4();
        router.handle_frame(&foreign_frame(1, true, id).encode());
        router.handle_frame(&foreign_frame(0, false, id).encode());

        let message = rx.try_recv().unwrap();
        assert_eq!(message.source, "other-node");
        assert_eq!(message.data, vec![0, 1]);
    }

    #[test]
    fn duplicate_foreign_frames_queue_one_retransmission() {
        let (router, _rx) = FrameRouter::new("n", 1, Duration::from_secs(10));
        let id = Uuid::new_v4();
        let frame = foreign_frame(0, false, id);
        router.handle_frame(&frame.encode());
        router.handle_frame(&frame.encode());

        // member_count 20 gives transmission_count 2: the single queued
        // copy goes out twice, then the queue drains.
        assert!(router.next_outbound(1024, 20).is_some());
        assert!(router.next_outbound(1024, 20).is_some());
        assert!(router.next_outbound(1024, 20).is_none());
    }

    #[test]
    fn own_frames_are_not_requeued() {
        let (router, _rx) = FrameRouter::new("self-node", 2, Duration::from_secs(10));
        let id = Uuid::new_v4();
        let mut frame = foreign_frame(0, true, id);
        frame.source = "self-node".to_string();
        router.handle_frame(&frame.encode());
        assert!(router.next_outbound(1024, 20).is_none());
    }

    #[test]
    fn prune_drops_idle_streams() {
        let (router, _rx) = FrameRouter::new("n", 2, Duration::ZERO);
        let id = Uuid::new_v4();
        router.handle_frame(&foreign_frame(0, false, id).encode());

        router.prune();
        // After pruning, the same frame is treated as new again.
        router.handle_frame(&foreign_frame(0, false, id).encode());
        assert!(router.has_outbound());
    }
}
