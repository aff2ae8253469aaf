use std::io;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::ble::constants::*;
use crate::ble::error::TransportError;
use crate::ble::frame::{is_initialization, Segments};
use crate::utils::be_u16;

/// Reply-buffer capacity used by [`BleTransport::exchange`].
pub const DEFAULT_REPLY_LIMIT: usize = MAX_MESSAGE_LENGTH;

/// The capability surface a platform BLE binding must provide.
///
/// `write_chunk` is a blocking write to the control-point characteristic,
/// `control_point_length` a read of the length-limit characteristic. Inbound
/// traffic is delivered by the platform calling
/// [`BleTransport::handle_notification`] once per characteristic-value-changed
/// event, from whatever thread the stack owns.
pub trait BleConnection: Send + Sync {
    fn write_chunk(&self, chunk: &[u8]) -> Result<(), io::Error>;
    fn control_point_length(&self) -> Result<u32, io::Error>;
}

/// Callback invoked with fragments that arrive outside any exchange.
pub type FragmentListener = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Reassembly state for the reply of the exchange in flight. Owned by the
/// transport and only ever touched under its lock.
struct Reassembly {
    in_progress: bool,
    expected: usize,
    received: usize,
    next_sequence: u8,
    reply_cmd: u8,
    limit: usize,
    buffer: Vec<u8>,
    outcome: Option<Result<(), TransportError>>,
}

impl Reassembly {
    fn idle() -> Self {
        Reassembly {
            in_progress: false,
            expected: 0,
            received: 0,
            next_sequence: 0,
            reply_cmd: 0,
            limit: 0,
            buffer: Vec::new(),
            outcome: None,
        }
    }
}

/// Segmentation/reassembly engine for the U2F BLE framing.
///
/// One thread drives [`exchange`](Self::exchange) while the platform
/// notification thread feeds [`handle_notification`](Self::handle_notification);
/// all shared state lives behind a single mutex and completion is signalled
/// through a condition variable, so the notification path never blocks on
/// I/O or on the exchanging thread.
pub struct BleTransport<C: BleConnection> {
    connection: C,
    state: Mutex<Reassembly>,
    done: Condvar,
    listeners: Mutex<Vec<FragmentListener>>,
}

impl<C: BleConnection> BleTransport<C> {
    pub fn new(connection: C) -> Self {
        BleTransport {
            connection,
            state: Mutex::new(Reassembly::idle()),
            done: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Direct access to the platform connection, for scenarios that write
    /// raw control-point frames.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Register a callback for fragments that arrive while no exchange is in
    /// flight (spontaneous device traffic, replies to raw writes).
    pub fn add_listener(&self, listener: FragmentListener) {
        self.listeners().push(listener);
    }

    /// Send `payload` under `cmd` and wait for the reassembled reply.
    ///
    /// `cmd` is the full command byte, initialization bit included. A zero
    /// `timeout` waits forever. The reply is bounded by
    /// [`DEFAULT_REPLY_LIMIT`]; use [`exchange_bounded`](Self::exchange_bounded)
    /// to exercise smaller reply buffers.
    pub fn exchange(
        &self,
        cmd: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(u8, Vec<u8>), TransportError> {
        self.exchange_bounded(cmd, payload, timeout, DEFAULT_REPLY_LIMIT)
    }

    pub fn exchange_bounded(
        &self,
        cmd: u8,
        payload: &[u8],
        timeout: Duration,
        reply_limit: usize,
    ) -> Result<(u8, Vec<u8>), TransportError> {
        if payload.len() > MAX_MESSAGE_LENGTH {
            return Err(TransportError::RequestTooLong);
        }

        let start = Instant::now();

        // Reset any abandoned exchange and open the new one.
        {
            let mut state = self.state();
            *state = Reassembly::idle();
            state.in_progress = true;
            state.limit = reply_limit;
        }

        let control_point_length = match self.connection.control_point_length() {
            Ok(l) => l,
            Err(e) => {
                self.abandon();
                return Err(e.into());
            }
        };
        if !(CONTROL_POINT_LENGTH_MIN..=CONTROL_POINT_LENGTH_MAX).contains(&control_point_length) {
            self.abandon();
            return Err(TransportError::InvalidControlPointLength(control_point_length));
        }

        log::debug!(
            "exchange cmd 0x{:02X}, {} payload bytes, control point length {}",
            cmd,
            payload.len(),
            control_point_length
        );

        for frame in Segments::new(cmd, payload, control_point_length as usize) {
            // Stop writing once the device already failed the exchange.
            if !self.state().in_progress {
                break;
            }
            if let Err(e) = self.connection.write_chunk(&frame) {
                self.abandon();
                return Err(e.into());
            }
        }

        let deadline = if timeout.is_zero() { None } else { Some(start + timeout) };

        let mut state = self.state();
        while state.in_progress {
            match deadline {
                None => {
                    state = self
                        .done
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // Abandon the exchange; stragglers are forwarded to
                        // listeners until the next exchange resets the state.
                        state.in_progress = false;
                        return Err(TransportError::Timeout);
                    }
                    let (guard, _) = self
                        .done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
            }
        }

        match state.outcome.take() {
            Some(Ok(())) => {
                log::debug!(
                    "exchange complete, {} reply bytes in {:?}",
                    state.received,
                    start.elapsed()
                );
                Ok((state.reply_cmd, mem::take(&mut state.buffer)))
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Timeout),
        }
    }

    /// Entry point for the platform notification callback. Never blocks on
    /// I/O; called once per received characteristic value, from any thread.
    pub fn handle_notification(&self, fragment: &[u8]) {
        let mut state = self.state();

        if !state.in_progress {
            drop(state);
            for listener in self.listeners().iter() {
                listener(fragment);
            }
            return;
        }

        if fragment.is_empty() {
            self.fail(&mut state, TransportError::BadReply("Empty notification".to_string()));
            return;
        }

        let data = if state.received == 0 {
            // First fragment of the reply.
            if !is_initialization(fragment[0]) {
                self.fail(
                    &mut state,
                    TransportError::BadReply("First fragment is not an initialization frame".to_string()),
                );
                return;
            }
            // A keep-alive before the reply proper leaves the exchange open.
            if fragment[0] == BLE_CMD_KEEPALIVE {
                log::debug!("keep-alive while waiting for the reply");
                return;
            }
            if fragment.len() < INIT_HEADER_SIZE {
                self.fail(
                    &mut state,
                    TransportError::BadReply("Truncated initialization frame".to_string()),
                );
                return;
            }

            state.expected = be_u16(fragment, 1) as usize;
            if state.expected > state.limit {
                self.fail(&mut state, TransportError::BufferTooSmall);
                return;
            }
            state.reply_cmd = fragment[0];
            state.next_sequence = 0;

            &fragment[INIT_HEADER_SIZE..]
        } else {
            // Continuation expected.
            if fragment[0] == BLE_CMD_KEEPALIVE {
                self.fail(
                    &mut state,
                    TransportError::BadReply("Keep-alive while a reply is in flight".to_string()),
                );
                return;
            }
            if is_initialization(fragment[0]) {
                self.fail(
                    &mut state,
                    TransportError::BadReply(
                        "Initialization frame while a continuation was expected".to_string(),
                    ),
                );
                return;
            }

            // The counter advances even on mismatch so later fragments of a
            // shifted stream keep reporting against the right position.
            let wanted = state.next_sequence;
            state.next_sequence = (wanted + 1) & SEQUENCE_MASK;
            if fragment[0] != wanted {
                self.fail(&mut state, TransportError::BadSequence);
                return;
            }

            &fragment[CONT_HEADER_SIZE..]
        };

        if data.len() > state.expected - state.received {
            self.fail(&mut state, TransportError::ReplyTooLong);
            return;
        }

        state.buffer.extend_from_slice(data);
        state.received += data.len();

        if state.received == state.expected {
            state.outcome = Some(Ok(()));
            state.in_progress = false;
            self.done.notify_all();
        }
    }

    fn fail(&self, state: &mut Reassembly, error: TransportError) {
        log::debug!("exchange failed: {}", error);
        state.outcome = Some(Err(error));
        state.in_progress = false;
        self.done.notify_all();
    }

    fn abandon(&self) {
        self.state().in_progress = false;
    }

    fn state(&self) -> MutexGuard<'_, Reassembly> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<FragmentListener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Captures the next out-of-band fragment delivered to a transport listener.
///
/// Raw-frame scenarios write protocol violations directly to the control
/// point and wait here for the spontaneous ERROR frame; keep-alives are
/// skipped.
pub struct FragmentInbox {
    shared: Arc<(Mutex<Option<Vec<u8>>>, Condvar)>,
}

impl FragmentInbox {
    pub fn new() -> Self {
        FragmentInbox {
            shared: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    /// The listener half, to be registered with
    /// [`BleTransport::add_listener`].
    pub fn listener(&self) -> FragmentListener {
        let shared = Arc::clone(&self.shared);
        Box::new(move |fragment| {
            if fragment.first() == Some(&BLE_CMD_KEEPALIVE) {
                return;
            }
            let mut slot = shared.0.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(fragment.to_vec());
                shared.1.notify_all();
            }
        })
    }

    pub fn clear(&self) {
        *self.shared.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Wait for one fragment. A zero `timeout` waits forever.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = if timeout.is_zero() { None } else { Some(Instant::now() + timeout) };
        let mut slot = self.shared.0.lock().unwrap_or_else(|e| e.into_inner());

        loop {
            if let Some(fragment) = slot.take() {
                return Ok(fragment);
            }
            match deadline {
                None => {
                    slot = self.shared.1.wait(slot).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    let (guard, _) = self
                        .shared
                        .1
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    slot = guard;
                }
            }
        }
    }
}

impl Default for FragmentInbox {
    fn default() -> Self {
        FragmentInbox::new()
    }
}

#[cfg(test)]
use std::sync::mpsc;
#[cfg(test)]
use std::thread;

#[cfg(test)]
struct ChannelConnection {
    written: mpsc::Sender<Vec<u8>>,
    control_point_length: u32,
}

#[cfg(test)]
impl BleConnection for ChannelConnection {
    fn write_chunk(&self, chunk: &[u8]) -> Result<(), io::Error> {
        self.written
            .send(chunk.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"))
    }

    fn control_point_length(&self) -> Result<u32, io::Error> {
        Ok(self.control_point_length)
    }
}

#[cfg(test)]
fn test_transport(
    control_point_length: u32,
) -> (Arc<BleTransport<ChannelConnection>>, mpsc::Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel();
    let transport = BleTransport::new(ChannelConnection {
        written: tx,
        control_point_length,
    });
    (Arc::new(transport), rx)
}

#[test]
fn test_round_trip_framing() {
    for &(control_point_length, size) in
        &[(20u32, 0usize), (20, 1), (20, 57), (57, 300), (512, 2048), (20, 65535)]
    {
        let (transport, rx) = test_transport(control_point_length);

        // Echo every written frame back as a notification, from another
        // thread, the way the platform stack delivers them.
        let weak = Arc::downgrade(&transport);
        let feeder = thread::spawn(move || {
            for frame in rx {
                if let Some(t) = weak.upgrade() {
                    t.handle_notification(&frame);
                }
            }
        });

        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let (cmd, reply) = transport
            .exchange(BLE_CMD_PING, &payload, Duration::from_secs(10))
            .unwrap();
        assert_eq!(cmd, BLE_CMD_PING);
        assert_eq!(reply, payload);

        drop(transport);
        feeder.join().unwrap();
    }
}

#[cfg(test)]
fn start_exchange(
    transport: &Arc<BleTransport<ChannelConnection>>,
    rx: &mpsc::Receiver<Vec<u8>>,
) -> thread::JoinHandle<Result<(u8, Vec<u8>), TransportError>> {
    let t = Arc::clone(transport);
    let worker = thread::spawn(move || t.exchange(BLE_CMD_PING, &[], Duration::from_secs(5)));
    // The single request frame has been written once this returns.
    rx.recv().unwrap();
    worker
}

#[test]
fn test_continuation_first_is_rejected() {
    let (transport, rx) = test_transport(20);
    let worker = start_exchange(&transport, &rx);

    transport.handle_notification(&[0x00, 0xAA, 0xBB]);

    match worker.join().unwrap() {
        Err(TransportError::BadReply(_)) => {}
        other => panic!("expected BadReply, got {:?}", other),
    }
}

#[test]
fn test_skipped_sequence_is_rejected() {
    let (transport, rx) = test_transport(20);
    let worker = start_exchange(&transport, &rx);

    let mut init = vec![BLE_CMD_PING, 0x00, 0x30];
    init.extend_from_slice(&[0u8; 17]);
    transport.handle_notification(&init);

    let mut cont = vec![0x01];
    cont.extend_from_slice(&[0u8; 19]);
    transport.handle_notification(&cont);

    match worker.join().unwrap() {
        Err(TransportError::BadSequence) => {}
        other => panic!("expected BadSequence, got {:?}", other),
    }
}

#[test]
fn test_in_order_sequence_is_accepted() {
    let (transport, rx) = test_transport(20);
    let worker = start_exchange(&transport, &rx);

    let mut init = vec![BLE_CMD_PING, 0x00, 55];
    init.extend_from_slice(&[0x11; 17]);
    transport.handle_notification(&init);
    let mut cont = vec![0x00];
    cont.extend_from_slice(&[0x22; 19]);
    transport.handle_notification(&cont);
    let mut cont = vec![0x01];
    cont.extend_from_slice(&[0x33; 19]);
    transport.handle_notification(&cont);

    let (_, reply) = worker.join().unwrap().unwrap();
    assert_eq!(reply.len(), 55);
    assert_eq!(&reply[..17], &[0x11; 17]);
    assert_eq!(&reply[17..36], &[0x22; 19]);
    assert_eq!(&reply[36..], &[0x33; 19]);
}

#[test]
fn test_init_mid_reassembly_is_rejected() {
    let (transport, rx) = test_transport(20);
    let worker = start_exchange(&transport, &rx);

    let mut init = vec![BLE_CMD_PING, 0x00, 0x30];
    init.extend_from_slice(&[0u8; 17]);
    transport.handle_notification(&init.clone());
    transport.handle_notification(&init);

    match worker.join().unwrap() {
        Err(TransportError::BadReply(_)) => {}
        other => panic!("expected BadReply, got {:?}", other),
    }
}

#[test]
fn test_overflowing_reply_is_rejected() {
    let (transport, rx) = test_transport(20);
    let worker = start_exchange(&transport, &rx);

    // Declares one byte but carries seventeen.
    let mut init = vec![BLE_CMD_PING, 0x00, 0x01];
    init.extend_from_slice(&[0u8; 17]);
    transport.handle_notification(&init);

    match worker.join().unwrap() {
        Err(TransportError::ReplyTooLong) => {}
        other => panic!("expected ReplyTooLong, got {:?}", other),
    }
}

#[test]
fn test_reply_larger_than_buffer_is_rejected() {
    let (transport, rx) = test_transport(20);
    let t = Arc::clone(&transport);
    let worker =
        thread::spawn(move || t.exchange_bounded(BLE_CMD_PING, &[], Duration::from_secs(5), 16));
    rx.recv().unwrap();

    transport.handle_notification(&[BLE_CMD_PING, 0x00, 0x20]);

    match worker.join().unwrap() {
        Err(TransportError::BufferTooSmall) => {}
        other => panic!("expected BufferTooSmall, got {:?}", other),
    }
}

#[test]
fn test_keepalive_dropped_before_reply() {
    let (transport, rx) = test_transport(20);
    let worker = start_exchange(&transport, &rx);

    transport.handle_notification(&[BLE_CMD_KEEPALIVE, 0x01]);
    transport.handle_notification(&[BLE_CMD_KEEPALIVE, 0x01]);
    transport.handle_notification(&[BLE_CMD_PING, 0x00, 0x02, 0xAB, 0xCD]);

    let (cmd, reply) = worker.join().unwrap().unwrap();
    assert_eq!(cmd, BLE_CMD_PING);
    assert_eq!(reply, vec![0xAB, 0xCD]);
}

#[test]
fn test_keepalive_mid_reassembly_fails() {
    let (transport, rx) = test_transport(20);
    let worker = start_exchange(&transport, &rx);

    let mut init = vec![BLE_CMD_PING, 0x00, 0x30];
    init.extend_from_slice(&[0u8; 17]);
    transport.handle_notification(&init);
    transport.handle_notification(&[BLE_CMD_KEEPALIVE, 0x01]);

    match worker.join().unwrap() {
        Err(TransportError::BadReply(_)) => {}
        other => panic!("expected BadReply, got {:?}", other),
    }
}

#[test]
fn test_timeout_and_recovery() {
    let (transport, rx) = test_transport(20);
    let t = Arc::clone(&transport);
    let worker =
        thread::spawn(move || t.exchange(BLE_CMD_PING, &[0x01], Duration::from_millis(50)));
    rx.recv().unwrap();

    match worker.join().unwrap() {
        Err(TransportError::Timeout) => {}
        other => panic!("expected Timeout, got {:?}", other),
    }

    // A straggler for the abandoned exchange lands with listeners instead of
    // a stale buffer.
    let inbox = FragmentInbox::new();
    transport.add_listener(inbox.listener());
    transport.handle_notification(&[BLE_CMD_PING, 0x00, 0x01, 0xFF]);
    assert_eq!(
        inbox.wait(Duration::from_secs(1)).unwrap(),
        vec![BLE_CMD_PING, 0x00, 0x01, 0xFF]
    );

    // And the next exchange starts clean.
    let worker = start_exchange(&transport, &rx);
    transport.handle_notification(&[BLE_CMD_PING, 0x00, 0x00]);
    let (cmd, reply) = worker.join().unwrap().unwrap();
    assert_eq!(cmd, BLE_CMD_PING);
    assert!(reply.is_empty());
}

#[test]
fn test_idle_fragments_reach_listeners() {
    let (transport, _rx) = test_transport(20);
    let inbox = FragmentInbox::new();
    transport.add_listener(inbox.listener());

    // Keep-alives are skipped by the inbox, error frames captured.
    transport.handle_notification(&[BLE_CMD_KEEPALIVE, 0x01]);
    transport.handle_notification(&[BLE_CMD_ERROR, 0x00, 0x01, ERR_INVALID_SEQ]);

    assert_eq!(
        inbox.wait(Duration::from_secs(1)).unwrap(),
        vec![BLE_CMD_ERROR, 0x00, 0x01, ERR_INVALID_SEQ]
    );
}

#[test]
fn test_control_point_length_bounds() {
    let (transport, _rx) = test_transport(600);
    match transport.exchange(BLE_CMD_PING, &[], Duration::from_secs(1)) {
        Err(TransportError::InvalidControlPointLength(600)) => {}
        other => panic!("expected InvalidControlPointLength, got {:?}", other),
    }

    let (transport, _rx) = test_transport(19);
    match transport.exchange(BLE_CMD_PING, &[], Duration::from_secs(1)) {
        Err(TransportError::InvalidControlPointLength(19)) => {}
        other => panic!("expected InvalidControlPointLength, got {:?}", other),
    }
}

#[test]
fn test_oversized_request_is_rejected() {
    let (transport, _rx) = test_transport(20);
    let payload = vec![0u8; MAX_MESSAGE_LENGTH + 1];
    match transport.exchange(BLE_CMD_PING, &payload, Duration::from_secs(1)) {
        Err(TransportError::RequestTooLong) => {}
        other => panic!("expected RequestTooLong, got {:?}", other),
    }
}
