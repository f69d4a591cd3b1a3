//! Request transports.
//!
//! The client only needs one capability: send a request frame, get the
//! matching response frame back. [`Transport`] captures that.
//! [`StreamTransport`] implements it on top of a noisy byte/text stream
//! (e.g. a WebSocket tunnel relaying hex-encoded frames), reassembling
//! frames, serializing requests and correlating responses.

use crate::frame::{parse_frame, ParsedFrame, ProtocolError, FRAME_HEAD_0, FRAME_HEAD_1, FRAME_TAIL};
use crate::status::hex_upper;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("link is not connected")]
    NotConnected,
    #[error("a previous request is still pending")]
    Busy,
    #[error("request frame is malformed")]
    InvalidRequest,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("link closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "tokio-serial-async")]
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// One request/response round-trip. Implementations may assume a single
/// outstanding call per logical session; the client never overlaps them.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn request(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Reassembles discrete validated frames out of an unbounded inbound byte
/// stream, recovering alignment after corruption.
#[derive(Debug, Default)]
pub struct FrameCollector {
    buf: Vec<u8>,
}

impl FrameCollector {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extracts the next complete CRC-valid frame, if any.
    ///
    /// Candidates are anchored at every head-marker position in order and
    /// tried against every tail-marker position after it; the first candidate
    /// that fully parses wins and everything before its end is consumed.
    /// Nothing is discarded until a frame parses, so a frame that is merely
    /// incomplete stays buffered, while corrupted bytes in front of a good
    /// frame are skipped once the good frame arrives.
    pub fn try_next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 6 {
            return None;
        }
        let heads: Vec<usize> = self
            .buf
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[0] == FRAME_HEAD_0 && pair[1] == FRAME_HEAD_1)
            .map(|(index, _)| index)
            .collect();
        let Some(first_head) = heads.first().copied() else {
            // No head marker at all: everything but a possible half-marker at
            // the end is garbage.
            let keep_from = self.buf.len().saturating_sub(1);
            self.buf.drain(..keep_from);
            return None;
        };

        for head in heads {
            for tail in (head + 2)..self.buf.len() {
                if self.buf[tail] != FRAME_TAIL {
                    continue;
                }
                let candidate = &self.buf[head..=tail];
                match parse_frame(candidate) {
                    Ok(_) => {
                        let frame = candidate.to_vec();
                        self.buf.drain(..=tail);
                        return Some(frame);
                    }
                    Err(err) => {
                        log::debug!("dropping frame candidate at +{head}: {err}");
                    }
                }
            }
        }

        // Nothing parsed yet; drop leading garbage before the first head and
        // wait for more bytes.
        self.buf.drain(..first_head);
        None
    }
}

/// Inbound event from the underlying tunnel.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Raw frame bytes.
    Binary(Vec<u8>),
    /// Tunnel text payload: a `{"hex": "..."}` envelope or a keepalive.
    Text(String),
}

/// The byte/text pipe the stream transport runs on. The concrete tunnel
/// (WebSocket bridge, test harness, ...) lives outside this crate. The
/// futures are `Send` so the worker can run as a spawned task.
pub trait StreamLink {
    fn send_text(
        &mut self,
        text: &str,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
    /// Next inbound event; `None` once the link is closed.
    fn recv(&mut self) -> impl std::future::Future<Output = Option<StreamEvent>> + Send;
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Opaque handshake payload forwarded verbatim when the worker starts;
    /// the tunnel is not considered ready before it is sent.
    pub handshake: Option<String>,
    /// Minimum spacing between transmitted frames; the controller starts
    /// dropping requests when they arrive back-to-back.
    pub min_frame_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            handshake: None,
            min_frame_interval: Duration::from_millis(80),
            request_timeout: Duration::from_millis(2500),
        }
    }
}

/// The (source, target, function) triple a response must carry to resolve
/// the outstanding request. Addresses swap relative to the request; an error
/// reply answers with the function code's high bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExpectedReply {
    source: u8,
    target: u8,
    function: u8,
}

impl ExpectedReply {
    fn for_request(frame: &[u8]) -> Self {
        Self {
            source: frame[3],
            target: frame[2],
            function: frame[4],
        }
    }

    fn matches(&self, parsed: &ParsedFrame) -> bool {
        if parsed.source() != self.source || parsed.target() != self.target {
            return false;
        }
        match parsed {
            ParsedFrame::Error { .. } => parsed.function() == self.function | 0x80,
            _ => parsed.function() == self.function,
        }
    }
}

struct Request {
    frame: Vec<u8>,
    reply: oneshot::Sender<Result<Vec<u8>, TransportError>>,
}

/// Serializing request transport over a [`StreamLink`].
///
/// Holds a single pending-request slot; further requests queue behind it.
/// A worker task owns the link, the reassembly buffer and the timers, so
/// inbound bytes keep flowing while a caller awaits its response.
pub struct StreamTransport {
    requests: mpsc::Sender<Request>,
}

impl StreamTransport {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn<L>(link: L, options: StreamOptions) -> Self
    where
        L: StreamLink + Send + 'static,
    {
        let (requests, queue) = mpsc::channel(16);
        tokio::spawn(run_worker(link, options, queue));
        Self { requests }
    }
}

impl Transport for StreamTransport {
    async fn request(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request {
                frame: frame.to_vec(),
                reply,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        response.await.map_err(|_| TransportError::Closed)?
    }
}

/// Decodes one inbound event into frame bytes, if it carries any.
fn payload_bytes(event: StreamEvent) -> Option<Vec<u8>> {
    match event {
        StreamEvent::Binary(bytes) => Some(bytes),
        StreamEvent::Text(text) => {
            let text = text.trim();
            if text.is_empty() || text == "pong" {
                return None;
            }
            let envelope: serde_json::Value = match serde_json::from_str(text) {
                Ok(value) => value,
                Err(err) => {
                    log::debug!("ignoring non-envelope text payload: {err}");
                    return None;
                }
            };
            let hex = envelope.get("hex")?.as_str()?;
            match hex_to_bytes(hex) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    log::debug!("ignoring bad hex payload: {err}");
                    None
                }
            }
        }
    }
}

async fn run_worker<L: StreamLink>(
    mut link: L,
    options: StreamOptions,
    mut queue: mpsc::Receiver<Request>,
) {
    if let Some(handshake) = &options.handshake {
        if let Err(err) = link.send_text(handshake).await {
            log::warn!("stream handshake failed: {err}");
            return;
        }
    }

    let mut collector = FrameCollector::default();
    let mut pending: Option<(ExpectedReply, oneshot::Sender<Result<Vec<u8>, TransportError>>)> =
        None;
    let mut last_tx: Option<Instant> = None;
    let deadline = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            event = link.recv() => {
                let Some(event) = event else {
                    if let Some((_, reply)) = pending.take() {
                        let _ = reply.send(Err(TransportError::Closed));
                    }
                    return;
                };
                if let Some(bytes) = payload_bytes(event) {
                    collector.push(&bytes);
                    while let Some(frame) = collector.try_next_frame() {
                        handle_frame(&frame, &mut pending);
                    }
                }
            }

            () = &mut deadline, if pending.is_some() => {
                if let Some((expected, reply)) = pending.take() {
                    log::debug!("request timed out waiting for {expected:?}");
                    let _ = reply.send(Err(TransportError::Timeout(options.request_timeout)));
                }
            }

            request = queue.recv(), if pending.is_none() => {
                let Some(request) = request else { return };
                if request.frame.len() < 6 {
                    let _ = request.reply.send(Err(TransportError::InvalidRequest));
                    continue;
                }
                if let Some(previous) = last_tx {
                    let since = previous.elapsed();
                    if since < options.min_frame_interval {
                        tokio::time::sleep(options.min_frame_interval - since).await;
                    }
                }
                let hex = hex_upper(&request.frame);
                if let Err(err) = link.send_text(&hex).await {
                    let _ = request.reply.send(Err(err));
                    continue;
                }
                last_tx = Some(Instant::now());
                pending = Some((ExpectedReply::for_request(&request.frame), request.reply));
                deadline.as_mut().reset(Instant::now() + options.request_timeout);
            }
        }
    }
}

fn handle_frame(
    frame: &[u8],
    pending: &mut Option<(ExpectedReply, oneshot::Sender<Result<Vec<u8>, TransportError>>)>,
) {
    let Some((expected, _)) = pending else {
        log::debug!("unsolicited frame dropped ({} bytes)", frame.len());
        return;
    };
    // The collector only yields frames that already parsed once.
    let Ok(parsed) = parse_frame(frame) else {
        return;
    };
    if !expected.matches(&parsed) {
        log::debug!(
            "mismatched frame dropped (src={:#04x} target={:#04x} func={:#04x})",
            parsed.source(),
            parsed.target(),
            parsed.function()
        );
        return;
    }
    if let Some((_, reply)) = pending.take() {
        let _ = reply.send(Ok(frame.to_vec()));
    }
}

/// Decodes a hex payload, tolerating a `0x` prefix, whitespace and
/// separators. The digit count must be even.
pub(crate) fn hex_to_bytes(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let cleaned: String = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .chars()
        .filter(char::is_ascii_hexdigit)
        .collect();
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        return Err(ProtocolError::InvalidHex);
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16).map_err(|_| ProtocolError::InvalidHex))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::testing::{build_error_reply, build_read_reply, build_write_ack};
    use crate::frame::{
        build_read_frame, FUNC_READ_HOLDING_REGISTERS, FUNC_WRITE_MULTIPLE_REGISTERS, HOST_ADDRESS,
    };

    #[test]
    fn collector_extracts_back_to_back_frames() {
        let first = build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x00, 0x01]);
        let second = build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x00, 0x02]);
        let mut collector = FrameCollector::default();
        collector.push(&first);
        collector.push(&second);
        assert_eq!(collector.try_next_frame().as_deref(), Some(first.as_slice()));
        assert_eq!(collector.try_next_frame().as_deref(), Some(second.as_slice()));
        assert_eq!(collector.try_next_frame(), None);
    }

    #[test]
    fn collector_reassembles_split_frames() {
        let frame = build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0xAA; 8]);
        let mut collector = FrameCollector::default();
        let (left, right) = frame.split_at(5);
        collector.push(left);
        assert_eq!(collector.try_next_frame(), None);
        collector.push(right);
        assert_eq!(collector.try_next_frame().as_deref(), Some(frame.as_slice()));
    }

    #[test]
    fn collector_resyncs_past_corruption() {
        let mut corrupted =
            build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x11, 0x22]);
        corrupted[7] ^= 0xFF; // break the CRC
        let valid = build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x33, 0x44]);
        let mut collector = FrameCollector::default();
        collector.push(&corrupted);
        collector.push(&valid);
        assert_eq!(collector.try_next_frame().as_deref(), Some(valid.as_slice()));
        assert_eq!(collector.try_next_frame(), None);
    }

    #[test]
    fn collector_skips_leading_garbage() {
        let frame = build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x55]);
        let mut collector = FrameCollector::default();
        collector.push(&[0x00, 0x12, 0xFD, 0x7F]);
        collector.push(&frame);
        assert_eq!(collector.try_next_frame().as_deref(), Some(frame.as_slice()));
    }

    #[test]
    fn collector_keeps_payload_embedded_tail_bytes() {
        // Payload bytes that look like a tail marker must not truncate the
        // frame.
        let frame =
            build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0xFD, 0xFD]);
        let mut collector = FrameCollector::default();
        collector.push(&frame);
        assert_eq!(collector.try_next_frame().as_deref(), Some(frame.as_slice()));
    }

    #[test]
    fn expected_reply_matching() {
        let request =
            build_read_frame(HOST_ADDRESS, 0x01, FUNC_READ_HOLDING_REGISTERS, 0x100, 1).unwrap();
        let expected = ExpectedReply::for_request(&request);
        // The device answers with the addresses swapped.
        assert_eq!(expected.source, 0x01);
        assert_eq!(expected.target, HOST_ADDRESS);

        let ok = build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x10, 0x04]);
        assert!(expected.matches(&parse_frame(&ok).unwrap()));

        let error = build_error_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, 0x03);
        assert!(expected.matches(&parse_frame(&error).unwrap()));

        let wrong_source =
            build_read_reply(0x02, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x10, 0x04]);
        assert!(!expected.matches(&parse_frame(&wrong_source).unwrap()));

        let wrong_function = build_write_ack(0x01, HOST_ADDRESS, FUNC_WRITE_MULTIPLE_REGISTERS, 0x100, 1);
        assert!(!expected.matches(&parse_frame(&wrong_function).unwrap()));
    }

    #[test]
    fn hex_codec() {
        assert_eq!(hex_upper(&[0x7F, 0x55, 0x01]), "7F5501");
        assert_eq!(hex_to_bytes("7F5501").unwrap(), vec![0x7F, 0x55, 0x01]);
        assert_eq!(hex_to_bytes("0x7f 55:01").unwrap(), vec![0x7F, 0x55, 0x01]);
        assert!(hex_to_bytes("7F5").is_err());
        assert!(hex_to_bytes("").is_err());
    }

    /// Channel-backed link for driving the worker from tests.
    struct TestLink {
        inbound: mpsc::UnboundedReceiver<StreamEvent>,
        outbound: mpsc::UnboundedSender<String>,
    }

    impl StreamLink for TestLink {
        async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            self.outbound
                .send(text.to_string())
                .map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Option<StreamEvent> {
            self.inbound.recv().await
        }
    }

    fn test_link() -> (
        TestLink,
        mpsc::UnboundedSender<StreamEvent>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        (
            TestLink {
                inbound: event_rx,
                outbound: text_tx,
            },
            event_tx,
            text_rx,
        )
    }

    #[tokio::test]
    async fn request_resolves_on_matching_frame() {
        let (link, events, mut sent) = test_link();
        let mut transport = StreamTransport::spawn(
            link,
            StreamOptions {
                min_frame_interval: Duration::ZERO,
                ..StreamOptions::default()
            },
        );

        let request =
            build_read_frame(HOST_ADDRESS, 0x01, FUNC_READ_HOLDING_REGISTERS, 0x100, 1).unwrap();
        let reply = build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x10, 0x04]);

        let request_task = tokio::spawn({
            let request = request.clone();
            async move { transport.request(&request).await }
        });

        // The frame goes out as uppercase hex.
        let wire = sent.recv().await.unwrap();
        assert_eq!(wire, hex_upper(&request));

        // A mismatched frame first: wrong source address, silently dropped.
        let mismatched =
            build_read_reply(0x07, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x00, 0x00]);
        events
            .send(StreamEvent::Text(format!("{{\"hex\":\"{}\"}}", hex_upper(&mismatched))))
            .unwrap();
        // Keepalives are ignored.
        events.send(StreamEvent::Text("pong".to_string())).unwrap();
        // Then the real response, still within the timeout.
        events
            .send(StreamEvent::Text(format!("{{\"hex\":\"{}\"}}", hex_upper(&reply))))
            .unwrap();

        let received = request_task.await.unwrap().unwrap();
        assert_eq!(received, reply);
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_frees_the_slot() {
        let (link, events, mut sent) = test_link();
        let options = StreamOptions {
            min_frame_interval: Duration::ZERO,
            request_timeout: Duration::from_millis(200),
            ..StreamOptions::default()
        };
        let mut transport = StreamTransport::spawn(link, options);

        let request =
            build_read_frame(HOST_ADDRESS, 0x01, FUNC_READ_HOLDING_REGISTERS, 0x100, 1).unwrap();
        let result = transport.request(&request).await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));

        // The slot is free again: a second request goes out and completes.
        let _ = sent.recv().await.unwrap();
        let reply = build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x00, 0x2A]);
        let request_task = tokio::spawn({
            let request = request.clone();
            async move { transport.request(&request).await }
        });
        let _ = sent.recv().await.unwrap();
        events
            .send(StreamEvent::Binary(reply.clone()))
            .unwrap();
        assert_eq!(request_task.await.unwrap().unwrap(), reply);
    }

    #[tokio::test]
    async fn link_closure_fails_pending_request() {
        let (link, events, mut sent) = test_link();
        let mut transport = StreamTransport::spawn(
            link,
            StreamOptions {
                min_frame_interval: Duration::ZERO,
                ..StreamOptions::default()
            },
        );
        let request =
            build_read_frame(HOST_ADDRESS, 0x01, FUNC_READ_HOLDING_REGISTERS, 0x100, 1).unwrap();
        let request_task = tokio::spawn(async move { transport.request(&request).await });
        let _ = sent.recv().await.unwrap();
        drop(events);
        assert!(matches!(
            request_task.await.unwrap(),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn handshake_goes_out_first() {
        let (link, _events, mut sent) = test_link();
        let options = StreamOptions {
            handshake: Some("{\"device_id\":\"pack-1\",\"token\":\"opaque\"}".to_string()),
            min_frame_interval: Duration::ZERO,
            ..StreamOptions::default()
        };
        let _transport = StreamTransport::spawn(link, options.clone());
        let first = sent.recv().await.unwrap();
        assert_eq!(first, options.handshake.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_spaced_by_the_minimum_interval() {
        let (link, events, mut sent) = test_link();
        let options = StreamOptions {
            min_frame_interval: Duration::from_millis(80),
            ..StreamOptions::default()
        };
        let mut transport = StreamTransport::spawn(link, options);

        let request =
            build_read_frame(HOST_ADDRESS, 0x01, FUNC_READ_HOLDING_REGISTERS, 0x100, 1).unwrap();
        let reply = build_read_reply(0x01, HOST_ADDRESS, FUNC_READ_HOLDING_REGISTERS, &[0x00, 0x01]);

        let started = tokio::time::Instant::now();
        let first = tokio::spawn({
            let request = request.clone();
            async move { (transport.request(&request).await, transport) }
        });
        let _ = sent.recv().await.unwrap();
        events.send(StreamEvent::Binary(reply.clone())).unwrap();
        let (result, mut transport) = first.await.unwrap();
        result.unwrap();

        // The second request must wait out the remaining interval before it
        // reaches the wire.
        let second = tokio::spawn({
            let request = request.clone();
            async move { transport.request(&request).await }
        });
        let _ = sent.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
        events.send(StreamEvent::Binary(reply.clone())).unwrap();
        second.await.unwrap().unwrap();
    }
}
