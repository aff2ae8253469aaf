//! Transport-level conformance scenarios: ping echo, length limits and the
//! raw-frame protocol violations a certified device must answer with ERROR
//! frames.

use std::time::{Duration, Instant};

use crate::ble::constants::*;
use crate::ble::frame::{classify_reply, ReplyKind};
use crate::ble::transport::{BleConnection, BleTransport, FragmentInbox};
use crate::scenarios::{ExerciserConfig, ScenarioError};
use crate::utils::{be_u16, rand_bytes};
use crate::{check, check_eq, warn_eq};

/// How long the limits probe waits for straggling error replies.
const LIMIT_DRAIN_DELAY: Duration = Duration::from_secs(2);

/// Echo a small random payload through the PING command.
pub fn ping_echo<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    exercise_ping(config, transport, 8)
}

/// Echo a payload spanning several continuation frames.
pub fn long_ping<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<(), ScenarioError> {
    exercise_ping(config, transport, 128)
}

fn exercise_ping<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    length: usize,
) -> Result<(), ScenarioError> {
    let mut payload = vec![0u8; length];
    rand_bytes(&mut payload)?;

    let start = Instant::now();
    let (cmd, reply) =
        transport.exchange_bounded(BLE_CMD_PING, &payload, config.timeout, config.reply_limit)?;
    log::info!("sent {} bytes in {:?}", length, start.elapsed());

    check_eq!(cmd, BLE_CMD_PING);
    check_eq!(reply.len(), payload.len());
    check!(reply == payload);
    Ok(())
}

/// An unknown command byte must be answered with an ERROR frame carrying
/// INVALID_CMD.
pub fn unknown_command<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    cmd: u8,
) -> Result<(), ScenarioError> {
    let cmd = cmd | TYPE_INIT;
    let (reply_cmd, reply) =
        transport.exchange_bounded(cmd, &[], config.timeout, config.reply_limit)?;

    check_eq!(reply_cmd, BLE_CMD_ERROR);
    warn_eq!(config, reply.len(), 1);
    if !reply.is_empty() {
        warn_eq!(config, reply[0], ERR_INVALID_CMD);
    }
    Ok(())
}

/// Probe the device's message length limit by doubling a PING payload until
/// the echo gives way to an INVALID_LEN error. Returns the first length the
/// device refused, or `None` if it echoed everything up to the 16-bit
/// maximum.
pub fn message_limits<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
) -> Result<Option<usize>, ScenarioError> {
    let mut payload = vec![0u8; MAX_MESSAGE_LENGTH];
    rand_bytes(&mut payload)?;

    let mut length = 256;
    loop {
        log::info!("testing with {} bytes", length);
        let start = Instant::now();
        let (cmd, reply) = transport.exchange_bounded(
            BLE_CMD_PING,
            &payload[..length],
            config.timeout,
            config.reply_limit,
        )?;

        match classify_reply(cmd) {
            ReplyKind::Ping => {
                check_eq!(reply.len(), length);
                check!(reply == payload[..length]);
                log::info!("  echoed {} bytes in {:?}", length, start.elapsed());
            }
            ReplyKind::Error => {
                check_eq!(reply.len(), 1);
                warn_eq!(config, reply[0], ERR_INVALID_LEN);
                log::info!("  limit is smaller than {} bytes", length);
                // The device answers every leftover continuation of the
                // refused message; let those error replies drain before the
                // next exchange.
                std::thread::sleep(LIMIT_DRAIN_DELAY);
                return Ok(Some(length));
            }
            _ => {
                return Err(ScenarioError::Check(format!(
                    "unexpected reply command 0x{:02X}",
                    cmd
                )))
            }
        }

        length = if length < 32768 {
            length * 2
        } else if length < MAX_MESSAGE_LENGTH {
            MAX_MESSAGE_LENGTH
        } else {
            return Ok(None);
        };
    }
}

/// Re-sending an initialization frame while the device still expects
/// continuations must fail the message with INVALID_SEQ.
pub fn init_resent_mid_message<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    inbox: &FragmentInbox,
) -> Result<(), ScenarioError> {
    let control_point_length = transport.connection().control_point_length()? as usize;
    inbox.clear();

    // Declares one byte more than the frame carries, so the message stays
    // incomplete and the repeated initialization frame arrives mid-message.
    let mut frame = vec![0u8; control_point_length];
    frame[0] = BLE_CMD_MSG;
    let declared = control_point_length + 1 - INIT_HEADER_SIZE;
    frame[1] = (declared >> 8) as u8;
    frame[2] = declared as u8;

    transport.connection().write_chunk(&frame)?;
    transport.connection().write_chunk(&frame)?;

    let reply = inbox.wait(config.timeout)?;
    expect_error_frame(config, &reply, ERR_INVALID_SEQ)
}

/// A continuation frame with a skipped sequence number must fail the
/// message with INVALID_SEQ.
pub fn bad_sequence<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    inbox: &FragmentInbox,
) -> Result<(), ScenarioError> {
    let control_point_length = transport.connection().control_point_length()? as usize;
    inbox.clear();

    let mut init = vec![0u8; control_point_length];
    init[0] = BLE_CMD_MSG;
    let declared = control_point_length; // needs one continuation
    init[1] = (declared >> 8) as u8;
    init[2] = declared as u8;
    transport.connection().write_chunk(&init)?;

    // First continuation must carry sequence 0; send 1.
    let mut cont = vec![0u8; control_point_length];
    cont[0] = 0x01;
    transport.connection().write_chunk(&cont)?;

    let reply = inbox.wait(config.timeout)?;
    expect_error_frame(config, &reply, ERR_INVALID_SEQ)
}

/// A continuation frame without a preceding initialization frame must be
/// answered with INVALID_SEQ.
pub fn continuation_first<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    inbox: &FragmentInbox,
) -> Result<(), ScenarioError> {
    let control_point_length = transport.connection().control_point_length()? as usize;
    inbox.clear();

    let cont = vec![0u8; control_point_length];
    transport.connection().write_chunk(&cont)?;

    let reply = inbox.wait(config.timeout)?;
    expect_error_frame(config, &reply, ERR_INVALID_SEQ)
}

/// An initialization frame carrying more payload than it declares must be
/// answered with INVALID_LEN.
pub fn init_overflow<C: BleConnection>(
    config: &ExerciserConfig,
    transport: &BleTransport<C>,
    inbox: &FragmentInbox,
) -> Result<(), ScenarioError> {
    let control_point_length = transport.connection().control_point_length()? as usize;
    inbox.clear();

    let mut frame = vec![0u8; control_point_length];
    frame[0] = BLE_CMD_PING;
    frame[1] = 0x00;
    frame[2] = 0x01;
    transport.connection().write_chunk(&frame)?;

    let reply = inbox.wait(config.timeout)?;
    expect_error_frame(config, &reply, ERR_INVALID_LEN)
}

fn expect_error_frame(
    config: &ExerciserConfig,
    frame: &[u8],
    code: u8,
) -> Result<(), ScenarioError> {
    check!(frame.len() >= INIT_HEADER_SIZE + 1);
    check_eq!(frame[0], BLE_CMD_ERROR);
    warn_eq!(config, frame.len(), INIT_HEADER_SIZE + 1);
    warn_eq!(config, be_u16(frame, 1), 1);
    warn_eq!(config, frame[3], code);
    Ok(())
}

#[cfg(test)]
use crate::virtual_device::VirtualAuthenticator;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
fn harness() -> (
    ExerciserConfig,
    Arc<BleTransport<VirtualAuthenticator>>,
    FragmentInbox,
) {
    let (device, receiver) = VirtualAuthenticator::with_limits(20, 1024).unwrap();
    let transport = Arc::new(BleTransport::new(device));
    VirtualAuthenticator::pump(&transport, receiver);
    let inbox = FragmentInbox::new();
    transport.add_listener(inbox.listener());
    (ExerciserConfig::default(), transport, inbox)
}

#[test]
fn test_ping_scenarios() {
    let (config, transport, _inbox) = harness();
    ping_echo(&config, &transport).unwrap();
    long_ping(&config, &transport).unwrap();
}

#[test]
fn test_unknown_command_scenario() {
    let (config, transport, _inbox) = harness();
    unknown_command(&config, &transport, 0x15).unwrap();
}

#[test]
fn test_message_limits_scenario() {
    let (config, transport, _inbox) = harness();
    // The virtual device caps messages at 1024 bytes, so the sweep must
    // stop at the 2048-byte probe.
    let limit = message_limits(&config, &transport).unwrap();
    assert_eq!(limit, Some(2048));
}

#[test]
fn test_raw_frame_scenarios() {
    let (config, transport, inbox) = harness();
    init_resent_mid_message(&config, &transport, &inbox).unwrap();
    bad_sequence(&config, &transport, &inbox).unwrap();
    continuation_first(&config, &transport, &inbox).unwrap();
    init_overflow(&config, &transport, &inbox).unwrap();

    // The device must come back clean after every violation.
    ping_echo(&config, &transport).unwrap();
}
