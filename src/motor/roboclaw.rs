// RoboClaw packet serial protocol
//
// Packet format: [Address, Command, Data..., CRC16 hi, CRC16 lo]
// Multi-byte fields are big-endian. The CRC is CRC16-CCITT (poly 0x1021,
// init 0) over every byte before it, including the reply for reads.

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::constants::VelocityPid;
use super::link::{Channel, MotorLink, SpeedReading};
use crate::error::LinkError;

/// Default serial configuration for a USB RoboClaw
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Wait after dropping the port before the device is reopened
pub const RESET_SETTLE: Duration = Duration::from_millis(500);

/// Reply byte acknowledging a write command
const ACK: u8 = 0xFF;

/// Instantaneous speed is reported in pulses per 1/125 s
const ISPEED_SCALE: i32 = 125;

/// Command set (the subset this runtime uses)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetM1VelocityPid = 28,
    SetM2VelocityPid = 29,
    ReadM1ISpeed = 30,
    ReadM2ISpeed = 31,
    M1SpeedAccel = 38,
    M2SpeedAccel = 39,
}

impl Command {
    fn velocity_pid(channel: Channel) -> Self {
        match channel {
            Channel::M1 => Command::SetM1VelocityPid,
            Channel::M2 => Command::SetM2VelocityPid,
        }
    }

    fn speed_accel(channel: Channel) -> Self {
        match channel {
            Channel::M1 => Command::M1SpeedAccel,
            Channel::M2 => Command::M2SpeedAccel,
        }
    }

    fn read_ispeed(channel: Channel) -> Self {
        match channel {
            Channel::M1 => Command::ReadM1ISpeed,
            Channel::M2 => Command::ReadM2ISpeed,
        }
    }
}

/// CRC16-CCITT as computed by the RoboClaw
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Build a write packet with trailing CRC
pub fn build_packet(address: u8, command: Command, data: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + data.len());
    packet.push(address);
    packet.push(command as u8);
    packet.extend_from_slice(data);
    let crc = crc16(&packet);
    packet.extend_from_slice(&crc.to_be_bytes());
    packet
}

fn velocity_pid_payload(pid: &VelocityPid) -> [u8; 16] {
    let mut data = [0u8; 16];
    data[0..4].copy_from_slice(&pid.d.to_be_bytes());
    data[4..8].copy_from_slice(&pid.p.to_be_bytes());
    data[8..12].copy_from_slice(&pid.i.to_be_bytes());
    data[12..16].copy_from_slice(&pid.qpps.to_be_bytes());
    data
}

fn speed_accel_payload(accel: u32, speed: i32) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&accel.to_be_bytes());
    data[4..8].copy_from_slice(&speed.to_be_bytes());
    data
}

/// Decode a read-speed reply: [value(4), status(1), crc(2)].
/// `header` is the [address, command] pair the CRC also covers.
pub fn decode_speed_reply(header: [u8; 2], reply: &[u8; 7]) -> SpeedReading {
    let mut checked = Vec::with_capacity(7);
    checked.extend_from_slice(&header);
    checked.extend_from_slice(&reply[..5]);
    let expected = crc16(&checked);
    let received = u16::from_be_bytes([reply[5], reply[6]]);

    let raw = i32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]);
    SpeedReading {
        pulses_per_sec: raw.saturating_mul(ISPEED_SCALE),
        status: reply[4],
        valid: expected == received,
    }
}

/// RoboClaw motor controller reached over a serial port
pub struct RoboclawLink {
    port_name: String,
    baudrate: u32,
    address: u8,
    port: Option<Box<dyn SerialPort>>,
}

impl RoboclawLink {
    /// Create an unopened link; call `open` (or let the controller do it)
    pub fn new(port_name: &str, address: u8) -> Self {
        Self::with_baudrate(port_name, address, DEFAULT_BAUDRATE)
    }

    pub fn with_baudrate(port_name: &str, address: u8, baudrate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baudrate,
            address,
            port: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, LinkError> {
        let name = &self.port_name;
        self.port.as_mut().ok_or_else(|| LinkError::NotOpen { port: name.clone() })
    }

    fn read_exact_or_timeout(&mut self, buf: &mut [u8], command: Command) -> Result<(), LinkError> {
        self.port()?.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                LinkError::Timeout {
                    command: command as u8,
                }
            } else {
                LinkError::Io(e)
            }
        })
    }

    /// Send a write command and wait for the single byte ack
    fn write_command(&mut self, command: Command, data: &[u8]) -> Result<(), LinkError> {
        let packet = build_packet(self.address, command, data);
        let port = self.port()?;
        port.write_all(&packet)?;
        port.flush()?;

        let mut ack = [0u8; 1];
        self.read_exact_or_timeout(&mut ack, command)?;
        if ack[0] != ACK {
            return Err(LinkError::BadAck {
                command: command as u8,
                got: ack[0],
            });
        }
        Ok(())
    }
}

impl MotorLink for RoboclawLink {
    fn name(&self) -> &str {
        &self.port_name
    }

    fn open(&mut self) -> Result<(), LinkError> {
        let port = serialport::new(&self.port_name, self.baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        // Stale bytes from before a reset would desync the first reply
        port.clear(serialport::ClearBuffer::All)?;
        self.port = Some(port);
        Ok(())
    }

    fn reset(&mut self) {
        if self.port.take().is_some() {
            info!("Closed {} for reset", self.port_name);
        }
        std::thread::sleep(RESET_SETTLE);
    }

    fn set_velocity_pid(&mut self, channel: Channel, pid: &VelocityPid) -> Result<(), LinkError> {
        debug!("Set {:?} velocity PID: {:?}", channel, pid);
        self.write_command(Command::velocity_pid(channel), &velocity_pid_payload(pid))
    }

    fn speed_accel(&mut self, channel: Channel, accel: u32, speed: i32) -> Result<(), LinkError> {
        debug!("{:?} speed={} accel={}", channel, speed, accel);
        self.write_command(Command::speed_accel(channel), &speed_accel_payload(accel, speed))
    }

    fn read_speed(&mut self, channel: Channel) -> Result<SpeedReading, LinkError> {
        let command = Command::read_ispeed(channel);
        let header = [self.address, command as u8];
        let port = self.port()?;
        port.write_all(&header)?;
        port.flush()?;

        let mut reply = [0u8; 7];
        self.read_exact_or_timeout(&mut reply, command)?;
        Ok(decode_speed_reply(header, &reply))
    }
}
