use std::io;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::ble::constants::*;
use crate::ble::frame::{is_initialization, Segments};
use crate::ble::transport::{BleConnection, BleTransport};
use crate::u2f::error::Error;
use crate::u2f::token::SoftToken;
use crate::utils::be_u16;

pub const DEFAULT_CONTROL_POINT_LENGTH: u32 = 20;
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 2048;

struct InboundMessage {
    cmd: u8,
    expected: usize,
    payload: Vec<u8>,
    next_sequence: u8,
}

struct DeviceState {
    token: SoftToken,
    message: Option<InboundMessage>,
}

/// A software authenticator behind the [`BleConnection`] interface.
///
/// Control-point writes are reassembled with the behaviors certified
/// hardware exhibits: ERROR frames carrying INVALID_SEQ, INVALID_LEN or
/// INVALID_CMD on protocol violations, one answer per offending fragment.
/// PING is echoed and MSG routed into a [`SoftToken`]. Replies are
/// segmented per the framing rules and handed to a notification channel
/// which the harness pumps from its own thread, mirroring how a platform
/// stack delivers notifications.
pub struct VirtualAuthenticator {
    state: Mutex<DeviceState>,
    notifications: Sender<Vec<u8>>,
    control_point_length: u32,
    max_message_length: usize,
}

impl VirtualAuthenticator {
    pub fn new() -> Result<(Self, Receiver<Vec<u8>>), Error> {
        Self::with_limits(DEFAULT_CONTROL_POINT_LENGTH, DEFAULT_MAX_MESSAGE_LENGTH)
    }

    pub fn with_limits(
        control_point_length: u32,
        max_message_length: usize,
    ) -> Result<(Self, Receiver<Vec<u8>>), Error> {
        let (notifications, receiver) = channel();
        let device = VirtualAuthenticator {
            state: Mutex::new(DeviceState {
                token: SoftToken::new()?,
                message: None,
            }),
            notifications,
            control_point_length,
            max_message_length,
        };
        Ok((device, receiver))
    }

    /// Feed received frames into the transport from a dedicated thread, the
    /// way a platform notification thread would. The thread ends when the
    /// device (and with it the channel sender) is dropped.
    pub fn pump(
        transport: &Arc<BleTransport<VirtualAuthenticator>>,
        receiver: Receiver<Vec<u8>>,
    ) -> thread::JoinHandle<()> {
        let weak = Arc::downgrade(transport);
        thread::spawn(move || {
            for frame in receiver {
                if let Some(transport) = weak.upgrade() {
                    transport.handle_notification(&frame);
                }
            }
        })
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_reply(&self, cmd: u8, payload: &[u8]) {
        for frame in Segments::new(cmd, payload, self.control_point_length as usize) {
            // Best effort; the harness may already have hung up.
            let _ = self.notifications.send(frame);
        }
    }

    fn send_error(&self, code: u8) {
        self.send_reply(BLE_CMD_ERROR, &[code]);
    }

    fn process_frame(&self, state: &mut DeviceState, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }

        if state.message.is_none() {
            if !is_initialization(chunk[0]) {
                self.send_error(ERR_INVALID_SEQ);
                return;
            }
            if chunk.len() < INIT_HEADER_SIZE {
                self.send_error(ERR_INVALID_LEN);
                return;
            }

            let expected = be_u16(chunk, 1) as usize;
            let data = &chunk[INIT_HEADER_SIZE..];
            if expected > self.max_message_length || data.len() > expected {
                self.send_error(ERR_INVALID_LEN);
                return;
            }

            state.message = Some(InboundMessage {
                cmd: chunk[0],
                expected,
                payload: data.to_vec(),
                next_sequence: 0,
            });
        } else {
            // A message is being reassembled; only continuations may arrive.
            if is_initialization(chunk[0]) {
                state.message = None;
                self.send_error(ERR_INVALID_SEQ);
                return;
            }

            let fault = {
                let message = match state.message.as_mut() {
                    Some(message) => message,
                    None => return,
                };

                if chunk[0] != message.next_sequence {
                    Some(ERR_INVALID_SEQ)
                } else {
                    message.next_sequence = (message.next_sequence + 1) & SEQUENCE_MASK;
                    let data = &chunk[CONT_HEADER_SIZE..];
                    if data.len() > message.expected - message.payload.len() {
                        Some(ERR_INVALID_LEN)
                    } else {
                        message.payload.extend_from_slice(data);
                        None
                    }
                }
            };

            if let Some(code) = fault {
                state.message = None;
                self.send_error(code);
                return;
            }
        }

        let complete = state
            .message
            .as_ref()
            .map(|m| m.payload.len() == m.expected)
            .unwrap_or(false);
        if complete {
            if let Some(message) = state.message.take() {
                self.dispatch(state, message);
            }
        }
    }

    fn dispatch(&self, state: &mut DeviceState, message: InboundMessage) {
        match message.cmd {
            BLE_CMD_PING => self.send_reply(BLE_CMD_PING, &message.payload),
            BLE_CMD_MSG => {
                let response = state.token.handle_apdu(&message.payload);
                self.send_reply(BLE_CMD_MSG, &response);
            }
            _ => self.send_error(ERR_INVALID_CMD),
        }
    }
}

impl BleConnection for VirtualAuthenticator {
    fn write_chunk(&self, chunk: &[u8]) -> Result<(), io::Error> {
        if chunk.len() > self.control_point_length as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write larger than the control point length",
            ));
        }
        let mut state = self.state();
        self.process_frame(&mut state, chunk);
        Ok(())
    }

    fn control_point_length(&self) -> Result<u32, io::Error> {
        Ok(self.control_point_length)
    }
}

#[cfg(test)]
use crate::ble::transport::FragmentInbox;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn harness(
    control_point_length: u32,
    max_message_length: usize,
) -> (Arc<BleTransport<VirtualAuthenticator>>, thread::JoinHandle<()>) {
    let (device, receiver) =
        VirtualAuthenticator::with_limits(control_point_length, max_message_length).unwrap();
    let transport = Arc::new(BleTransport::new(device));
    let pump = VirtualAuthenticator::pump(&transport, receiver);
    (transport, pump)
}

#[test]
fn test_ping_round_trip() {
    for &control_point_length in &[20u32, 57, 512] {
        let (transport, pump) = harness(control_point_length, 2048);
        let payload: Vec<u8> = (0..600u16).map(|i| (i % 256) as u8).collect();

        let (cmd, reply) = transport
            .exchange(BLE_CMD_PING, &payload, Duration::from_secs(5))
            .unwrap();
        assert_eq!(cmd, BLE_CMD_PING);
        assert_eq!(reply, payload);

        drop(transport);
        pump.join().unwrap();
    }
}

#[test]
fn test_unknown_command_yields_error_frame() {
    let (transport, pump) = harness(20, 2048);

    let (cmd, reply) = transport
        .exchange(0x80 | 0x15, &[], Duration::from_secs(5))
        .unwrap();
    assert_eq!(cmd, BLE_CMD_ERROR);
    assert_eq!(reply, vec![ERR_INVALID_CMD]);

    drop(transport);
    pump.join().unwrap();
}

#[test]
fn test_oversized_message_yields_invalid_len() {
    let (transport, pump) = harness(20, 1024);

    let (cmd, reply) = transport
        .exchange(BLE_CMD_PING, &vec![0xA5; 1025], Duration::from_secs(5))
        .unwrap();
    assert_eq!(cmd, BLE_CMD_ERROR);
    assert_eq!(reply, vec![ERR_INVALID_LEN]);

    // Let the error replies for the remaining continuations drain before
    // the next message, the way the exerciser does after a limits probe.
    thread::sleep(Duration::from_millis(300));

    let (cmd, reply) = transport
        .exchange(BLE_CMD_PING, &[0x01], Duration::from_secs(5))
        .unwrap();
    assert_eq!(cmd, BLE_CMD_PING);
    assert_eq!(reply, vec![0x01]);

    drop(transport);
    pump.join().unwrap();
}

#[test]
fn test_raw_bad_sequence_yields_error_frame() {
    let (transport, pump) = harness(20, 2048);
    let inbox = FragmentInbox::new();
    transport.add_listener(inbox.listener());

    // A message longer than one frame, then a continuation with the wrong
    // sequence number.
    let mut init = vec![BLE_CMD_PING, 0x00, 40];
    init.extend_from_slice(&[0x00; 17]);
    transport.connection().write_chunk(&init).unwrap();
    let mut cont = vec![0x01];
    cont.extend_from_slice(&[0x00; 19]);
    transport.connection().write_chunk(&cont).unwrap();

    let frame = inbox.wait(Duration::from_secs(5)).unwrap();
    assert_eq!(frame[0], BLE_CMD_ERROR);
    assert_eq!(be_u16(&frame, 1), 1);
    assert_eq!(frame[3], ERR_INVALID_SEQ);

    drop(transport);
    pump.join().unwrap();
}

#[test]
fn test_raw_continuation_first_yields_error_frame() {
    let (transport, pump) = harness(20, 2048);
    let inbox = FragmentInbox::new();
    transport.add_listener(inbox.listener());

    let mut cont = vec![0x00];
    cont.extend_from_slice(&[0x00; 19]);
    transport.connection().write_chunk(&cont).unwrap();

    let frame = inbox.wait(Duration::from_secs(5)).unwrap();
    assert_eq!(frame[0], BLE_CMD_ERROR);
    assert_eq!(frame[3], ERR_INVALID_SEQ);

    drop(transport);
    pump.join().unwrap();
}

#[test]
fn test_raw_init_mid_message_yields_error_frame() {
    let (transport, pump) = harness(20, 2048);
    let inbox = FragmentInbox::new();
    transport.add_listener(inbox.listener());

    let mut init = vec![BLE_CMD_MSG, 0x00, 21];
    init.extend_from_slice(&[0x00; 17]);
    transport.connection().write_chunk(&init).unwrap();
    transport.connection().write_chunk(&init).unwrap();

    let frame = inbox.wait(Duration::from_secs(5)).unwrap();
    assert_eq!(frame[0], BLE_CMD_ERROR);
    assert_eq!(frame[3], ERR_INVALID_SEQ);

    drop(transport);
    pump.join().unwrap();
}

#[test]
fn test_raw_overfull_init_yields_error_frame() {
    let (transport, pump) = harness(20, 2048);
    let inbox = FragmentInbox::new();
    transport.add_listener(inbox.listener());

    // Declares one byte but the frame carries seventeen.
    let mut init = vec![BLE_CMD_PING, 0x00, 0x01];
    init.extend_from_slice(&[0x00; 17]);
    transport.connection().write_chunk(&init).unwrap();

    let frame = inbox.wait(Duration::from_secs(5)).unwrap();
    assert_eq!(frame[0], BLE_CMD_ERROR);
    assert_eq!(frame[3], ERR_INVALID_LEN);

    drop(transport);
    pump.join().unwrap();
}

#[test]
fn test_oversized_chunk_is_rejected() {
    let (device, _receiver) = VirtualAuthenticator::with_limits(20, 2048).unwrap();
    assert!(device.write_chunk(&[0u8; 21]).is_err());
}
