//! Chunking, reassembly, progress, and cancellation for payload transfer
//! (spec.md §4.6), grounded on
//! `connections/implementation/offline_simulation_user.cc`'s payload
//! exchange shape: split into fixed-size chunks, one `DATA` frame per
//! chunk, `CONTROL{canceled}` to tear down early, offset-validated
//! reassembly on the receiving side.

use crate::endpoint_manager::IncomingFrameProcessor;
use crate::session::SessionContext;
use nc_core::endpoint::EndpointId;
use nc_core::frame::{ControlEvent, OfflineFrame, PayloadTransferBody, PayloadTransferFrame, WirePayloadKind};
use nc_core::payload::{Payload, PayloadHeader, PayloadId, PayloadKind, PayloadProgressInfo, PayloadStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

/// Where the bytes for an outgoing payload come from.
pub enum PayloadSource {
    Bytes(Vec<u8>),
    Stream(Box<dyn tokio::io::AsyncRead + Unpin + Send>),
}

struct OutboundState {
    cancel: Arc<AtomicBool>,
}

struct InboundState {
    kind: PayloadKind,
    total_size: i64,
    buffer: Vec<u8>,
}

fn wire_kind(kind: PayloadKind) -> WirePayloadKind {
    match kind {
        PayloadKind::Bytes => WirePayloadKind::Bytes,
        PayloadKind::Stream => WirePayloadKind::Stream,
        PayloadKind::File => WirePayloadKind::File,
    }
}

fn payload_kind(wire: WirePayloadKind) -> PayloadKind {
    match wire {
        WirePayloadKind::Bytes => PayloadKind::Bytes,
        WirePayloadKind::Stream => PayloadKind::Stream,
        WirePayloadKind::File => PayloadKind::File,
    }
}

/// One engine instance serves every in-flight send and receive for a
/// session. Outbound state is keyed by payload id so `CancelPayload` can
/// find the right in-flight send; inbound state is keyed the same way for
/// reassembly.
pub struct PayloadEngine {
    session: Arc<SessionContext>,
    outbound: Mutex<HashMap<PayloadId, OutboundState>>,
    inbound: Mutex<HashMap<PayloadId, InboundState>>,
}

impl PayloadEngine {
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self {
            session,
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
        }
    }

    /// Starts sending `payload` to every id in `endpoint_ids`, fanning each
    /// chunk out serially via the endpoint manager's best-effort broadcast.
    /// Returns immediately; progress is reported through the session's
    /// subscriber as the background task runs.
    pub async fn send(
        self: &Arc<Self>,
        endpoint_ids: Vec<EndpointId>,
        header: PayloadHeader,
        source: PayloadSource,
    ) {
        let cancel = Arc::new(AtomicBool::new(false));
        self.outbound
            .lock()
            .await
            .insert(header.id, OutboundState { cancel: cancel.clone() });

        let engine = self.clone();
        tokio::spawn(async move {
            engine.send_loop(endpoint_ids, header, source, cancel).await;
            engine.outbound.lock().await.remove(&header.id);
        });
    }

    async fn send_loop(
        &self,
        mut endpoint_ids: Vec<EndpointId>,
        header: PayloadHeader,
        mut source: PayloadSource,
        cancel: Arc<AtomicBool>,
    ) {
        let chunk_size = self.session.config.payload_chunk_size;
        let mut offset: i64 = 0;

        loop {
            if cancel.load(Ordering::Acquire) {
                let frame = OfflineFrame::PayloadTransfer(PayloadTransferFrame {
                    payload_id: header.id.0,
                    payload_kind: wire_kind(header.kind),
                    total_size: header.total_size,
                    body: PayloadTransferBody::Control {
                        offset,
                        event: ControlEvent::Canceled,
                    },
                    extra: Vec::new(),
                });
                self.session
                    .endpoint_manager
                    .send_payload_chunk(&frame, &endpoint_ids)
                    .await;
                self.report(&endpoint_ids, header, PayloadStatus::Canceled, offset).await;
                return;
            }

            let (chunk, last) = match Self::next_chunk(&mut source, chunk_size).await {
                Ok(pair) => pair,
                Err(_) => {
                    self.report(&endpoint_ids, header, PayloadStatus::Failed, offset).await;
                    return;
                }
            };

            let frame = OfflineFrame::PayloadTransfer(PayloadTransferFrame {
                payload_id: header.id.0,
                payload_kind: wire_kind(header.kind),
                total_size: header.total_size,
                body: PayloadTransferBody::Data {
                    offset,
                    last,
                    body: chunk.clone(),
                },
                extra: Vec::new(),
            });
            offset += chunk.len() as i64;

            let failed = self
                .session
                .endpoint_manager
                .send_payload_chunk(&frame, &endpoint_ids)
                .await;
            if !failed.is_empty() {
                self.report(&failed, header, PayloadStatus::Failed, offset).await;
                endpoint_ids.retain(|id| !failed.contains(id));
            }
            if endpoint_ids.is_empty() {
                return;
            }

            self.report(&endpoint_ids, header, PayloadStatus::InProgress, offset).await;

            if last {
                self.report(&endpoint_ids, header, PayloadStatus::Success, offset).await;
                return;
            }
        }
    }

    async fn next_chunk(
        source: &mut PayloadSource,
        chunk_size: usize,
    ) -> std::io::Result<(Vec<u8>, bool)> {
        match source {
            PayloadSource::Bytes(bytes) => {
                let take = chunk_size.min(bytes.len());
                let chunk = bytes.drain(..take).collect::<Vec<u8>>();
                Ok((chunk, bytes.is_empty()))
            }
            PayloadSource::Stream(reader) => {
                let mut buf = vec![0u8; chunk_size];
                let mut read_total = 0;
                loop {
                    let n = reader.read(&mut buf[read_total..]).await?;
                    if n == 0 {
                        break;
                    }
                    read_total += n;
                    if read_total == chunk_size {
                        break;
                    }
                }
                buf.truncate(read_total);
                let last = read_total < chunk_size;
                Ok((buf, last))
            }
        }
    }

    async fn report(&self, endpoint_ids: &[EndpointId], header: PayloadHeader, status: PayloadStatus, transferred: i64) {
        let mut subscriber = self.session.subscriber.lock().await;
        let info = PayloadProgressInfo {
            payload_id: header.id,
            status,
            bytes_transferred: transferred,
            total_bytes: header.total_size,
        };
        for &endpoint_id in endpoint_ids {
            subscriber.on_payload_progress(endpoint_id, &info);
        }
    }

    /// Signals the in-flight send for `payload_id` to stop at its next
    /// chunk boundary. Idempotent; a second cancel on an already-finished
    /// send is simply a no-op.
    pub async fn cancel(&self, payload_id: PayloadId) -> bool {
        match self.outbound.lock().await.get(&payload_id) {
            Some(state) => {
                state.cancel.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Feeds one incoming `PayloadTransferFrame` into the reassembly state
    /// for its payload id.
    pub async fn on_frame(&self, endpoint_id: EndpointId, frame: PayloadTransferFrame) {
        match frame.body {
            PayloadTransferBody::Data { offset, last, body } => {
                self.on_data(endpoint_id, &frame, offset, last, body).await;
            }
            PayloadTransferBody::Control { event: ControlEvent::Canceled, .. } => {
                self.inbound.lock().await.remove(&PayloadId(frame.payload_id));
                let header = PayloadHeader {
                    id: PayloadId(frame.payload_id),
                    kind: payload_kind(frame.payload_kind),
                    total_size: frame.total_size,
                };
                self.report(&[endpoint_id], header, PayloadStatus::Canceled, 0).await;
            }
            PayloadTransferBody::Control { event: ControlEvent::ReceivedAck, .. } => {}
        }
    }

    async fn on_data(
        &self,
        endpoint_id: EndpointId,
        frame: &PayloadTransferFrame,
        offset: i64,
        last: bool,
        body: Vec<u8>,
    ) {
        let payload_id = PayloadId(frame.payload_id);
        let header = PayloadHeader {
            id: payload_id,
            kind: payload_kind(frame.payload_kind),
            total_size: frame.total_size,
        };

        let mut inbound = self.inbound.lock().await;
        let state = inbound.entry(payload_id).or_insert_with(|| InboundState {
            kind: header.kind,
            total_size: frame.total_size,
            buffer: Vec::new(),
        });

        if offset != state.buffer.len() as i64 {
            tracing::warn!(
                endpoint_id = %endpoint_id,
                payload_id = payload_id.0,
                expected = state.buffer.len(),
                got = offset,
                "discarding out-of-order payload chunk"
            );
            drop(inbound);
            self.report(&[endpoint_id], header, PayloadStatus::Failed, offset).await;
            return;
        }

        state.buffer.extend_from_slice(&body);
        let transferred = state.buffer.len() as i64;
        let done = last || (state.total_size >= 0 && transferred >= state.total_size);
        let kind = state.kind;
        let complete_bytes = if done {
            Some(std::mem::take(&mut state.buffer))
        } else {
            None
        };
        if done {
            inbound.remove(&payload_id);
        }
        drop(inbound);

        self.report(&[endpoint_id], header, PayloadStatus::InProgress, transferred).await;

        if let Some(bytes) = complete_bytes {
            let payload = Payload {
                header: PayloadHeader {
                    id: payload_id,
                    kind,
                    total_size: transferred,
                },
                bytes,
            };
            self.session.subscriber.lock().await.on_payload_received(endpoint_id, &payload);
            self.report(&[endpoint_id], header, PayloadStatus::Success, transferred).await;
        }
    }
}

/// Adapts `Arc<PayloadEngine>` to the endpoint manager's synchronous
/// `IncomingFrameProcessor`, registered under the `"payload-transfer"` frame
/// kind.
pub struct PayloadEngineProcessor(pub Arc<PayloadEngine>);

impl IncomingFrameProcessor for PayloadEngineProcessor {
    fn process(&self, endpoint_id: EndpointId, frame: OfflineFrame) {
        if let OfflineFrame::PayloadTransfer(transfer) = frame {
            let engine = self.0.clone();
            tokio::spawn(async move { engine.on_frame(endpoint_id, transfer).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::endpoint_manager::EndpointManager;
    use crate::medium::LoopbackDriver;
    use nc_core::config::Config;
    use nc_core::event::NoopSubscriber;
    use nc_core::medium::Medium;

    fn session() -> Arc<SessionContext> {
        let registry = Arc::new(crate::channel::ChannelRegistry::new());
        let manager = Arc::new(EndpointManager::new(Config::default(), registry, Arc::new(SystemClock::new())));
        Arc::new(SessionContext::new(
            Config::default(),
            manager,
            vec![Arc::new(LoopbackDriver::new(Medium::WifiLan))],
            Box::new(NoopSubscriber),
        ))
    }

    #[tokio::test]
    async fn reassembles_two_chunks_in_order() {
        let engine = Arc::new(PayloadEngine::new(session()));
        let id = PayloadId(1);
        let endpoint_id = EndpointId::new(*b"WXYZ").unwrap();

        engine
            .on_frame(
                endpoint_id,
                PayloadTransferFrame {
                    payload_id: id.0,
                    payload_kind: WirePayloadKind::Bytes,
                    total_size: 8,
                    body: PayloadTransferBody::Data {
                        offset: 0,
                        last: false,
                        body: vec![1, 2, 3, 4],
                    },
                    extra: Vec::new(),
                },
            )
            .await;

        engine
            .on_frame(
                endpoint_id,
                PayloadTransferFrame {
                    payload_id: id.0,
                    payload_kind: WirePayloadKind::Bytes,
                    total_size: 8,
                    body: PayloadTransferBody::Data {
                        offset: 4,
                        last: true,
                        body: vec![5, 6, 7, 8],
                    },
                    extra: Vec::new(),
                },
            )
            .await;

        assert!(engine.inbound.lock().await.is_empty());
    }

    #[tokio::test]
    async fn discards_an_out_of_order_chunk() {
        let engine = Arc::new(PayloadEngine::new(session()));
        let id = PayloadId(2);
        let endpoint_id = EndpointId::new(*b"WXYZ").unwrap();

        engine
            .on_frame(
                endpoint_id,
                PayloadTransferFrame {
                    payload_id: id.0,
                    payload_kind: WirePayloadKind::Bytes,
                    total_size: 8,
                    body: PayloadTransferBody::Data {
                        offset: 4,
                        last: false,
                        body: vec![1, 2, 3, 4],
                    },
                    extra: Vec::new(),
                },
            )
            .await;

        let inbound = engine.inbound.lock().await;
        let state = inbound.get(&id).unwrap();
        assert!(state.buffer.is_empty());
    }
}
