//! Bridge device implementation
//!
//! `BridgeDevice` frames commands for the cartridge bridge firmware and
//! implements `gbxflash_core::link::LinkPort` on top of any `Transport`.
//! Every exchange is host-driven: one command frame out, then either a
//! single acknowledge byte or data chunks released by continuation tokens.

use std::time::Duration;

use gbxflash_core::link::{
    EepromSize, FirmwareVersion, LinkPort, PortMode, Voltage, WritePin,
};
use gbxflash_core::Result as CoreResult;

use crate::error::{LinkError, Result};
use crate::protocol::*;
use crate::transport::Transport;

/// Default post-write settle delay in milliseconds. Some host serial
/// stacks drop bytes when writes follow each other back to back; this is
/// a transport policy knob, not part of the wire protocol.
pub const WRITE_SETTLE_MS: u32 = 0;

/// Cartridge bridge behind a byte transport
pub struct BridgeDevice<T: Transport> {
    transport: T,
    mode: Option<PortMode>,
    firmware: FirmwareVersion,
    write_settle_ms: u32,
}

impl<T: Transport> BridgeDevice<T> {
    /// Handshake with the bridge: drain stale bytes, query the firmware
    pub fn new(transport: T) -> Result<Self> {
        let mut dev = BridgeDevice {
            transport,
            mode: None,
            firmware: FirmwareVersion { major: 0, minor: 0 },
            write_settle_ms: WRITE_SETTLE_MS,
        };
        dev.transport.clear()?;
        let mut v = [0u8; 2];
        dev.read_response(Q_FIRMWARE, &[], &mut v)
            .map_err(|_| LinkError::NoFirmware)?;
        dev.firmware = FirmwareVersion {
            major: v[0],
            minor: v[1],
        };
        log::info!("Bridge firmware {}", dev.firmware);
        Ok(dev)
    }

    pub fn firmware(&self) -> FirmwareVersion {
        self.firmware
    }

    /// Adjust the post-write settle delay
    pub fn set_write_settle(&mut self, ms: u32) {
        self.write_settle_ms = ms;
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn settle(&self) {
        if self.write_settle_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.write_settle_ms as u64));
        }
    }

    fn frame(opcode: u8, operands: &[u8]) -> Vec<u8> {
        let mut f = Vec::with_capacity(1 + operands.len());
        f.push(opcode);
        f.extend_from_slice(operands);
        f
    }

    /// Fill `buf` from the transport; a stalled link is a short read
    fn read_full(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut got = 0usize;
        while got < buf.len() {
            let n = self
                .transport
                .read_nonblock(&mut buf[got..], ACK_TIMEOUT_MS)?;
            if n == 0 {
                return Err(LinkError::ShortRead {
                    wanted: buf.len(),
                    got,
                });
            }
            got += n;
        }
        Ok(())
    }

    /// Issue a state-changing command and wait for its acknowledge
    fn command(&mut self, opcode: u8, operands: &[u8]) -> Result<()> {
        let frame = Self::frame(opcode, operands);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let res = self.try_command(&frame);
            match res {
                Ok(()) => {
                    self.settle();
                    return Ok(());
                }
                Err(e) if attempt <= COMMAND_RETRIES => {
                    log::warn!("command {opcode:#04X} attempt {attempt} failed: {e}");
                    self.transport.flush()?;
                    self.transport.clear()?;
                }
                Err(_) => {
                    return Err(LinkError::RetriesExhausted {
                        opcode,
                        attempts: attempt,
                    })
                }
            }
        }
    }

    fn try_command(&mut self, frame: &[u8]) -> Result<()> {
        self.transport.write(frame)?;
        self.transport.flush()?;
        let mut ack = [0u8; 1];
        let n = self.transport.read_nonblock(&mut ack, ACK_TIMEOUT_MS)?;
        if n == 0 {
            return Err(LinkError::ShortRead { wanted: 1, got: 0 });
        }
        match ack[0] {
            ACK_OK | ACK_DONE => Ok(()),
            other => Err(LinkError::BadAck {
                opcode: frame[0],
                got: other,
            }),
        }
    }

    /// Issue a read command and collect `out.len()` bytes in chunks
    fn read_response(&mut self, opcode: u8, operands: &[u8], out: &mut [u8]) -> Result<()> {
        let frame = Self::frame(opcode, operands);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_read(&frame, out) {
                Ok(()) => return Ok(()),
                Err(e) if attempt <= COMMAND_RETRIES => {
                    log::warn!("read {opcode:#04X} attempt {attempt} failed: {e}");
                    self.transport.flush()?;
                    self.transport.clear()?;
                }
                Err(_) => {
                    return Err(LinkError::RetriesExhausted {
                        opcode,
                        attempts: attempt,
                    })
                }
            }
        }
    }

    fn try_read(&mut self, frame: &[u8], out: &mut [u8]) -> Result<()> {
        self.transport.write(frame)?;
        self.transport.flush()?;
        let chunks = out.chunks_mut(READ_CHUNK).count();
        let mut iter = out.chunks_mut(READ_CHUNK).enumerate();
        while let Some((i, chunk)) = iter.next() {
            self.read_full(chunk)?;
            if i + 1 < chunks {
                self.transport.write(&[CONTINUE])?;
            }
        }
        Ok(())
    }

    /// Send a frame carrying bulk payload, acknowledged once at the end
    fn command_with_payload(
        &mut self,
        opcode: u8,
        operands: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        let mut frame = Self::frame(opcode, operands);
        frame.extend_from_slice(payload);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_command(&frame) {
                Ok(()) => {
                    self.settle();
                    return Ok(());
                }
                Err(e) if attempt <= COMMAND_RETRIES => {
                    log::warn!("command {opcode:#04X} attempt {attempt} failed: {e}");
                    self.transport.flush()?;
                    self.transport.clear()?;
                }
                Err(_) => {
                    return Err(LinkError::RetriesExhausted {
                        opcode,
                        attempts: attempt,
                    })
                }
            }
        }
    }
}

fn mode_code(mode: PortMode) -> u8 {
    match mode {
        PortMode::Dmg => mode::DMG,
        PortMode::Agb => mode::AGB,
    }
}

fn voltage_code(v: Voltage) -> u8 {
    match v {
        Voltage::V5 => voltage::V5,
        Voltage::V3_3 => voltage::V3_3,
    }
}

fn pin_code(pin: WritePin) -> u8 {
    match pin {
        WritePin::Wr => write_pin::WR,
        WritePin::Audio => write_pin::AUDIO,
        WritePin::WrReset => write_pin::WR_RESET,
    }
}

fn eeprom_code(size: EepromSize) -> u8 {
    match size {
        EepromSize::E512 => eeprom::SIZE_512,
        EepromSize::E8K => eeprom::SIZE_8K,
    }
}

impl<T: Transport> LinkPort for BridgeDevice<T> {
    fn mode(&self) -> Option<PortMode> {
        self.mode
    }

    fn set_mode(&mut self, mode: PortMode) -> CoreResult<()> {
        self.command(SET_MODE, &[mode_code(mode)])?;
        self.mode = Some(mode);
        Ok(())
    }

    fn set_voltage(&mut self, voltage: Voltage) -> CoreResult<()> {
        self.command(SET_VOLTAGE, &[voltage_code(voltage)])?;
        Ok(())
    }

    fn set_write_pin(&mut self, pin: WritePin) -> CoreResult<()> {
        self.command(SET_WRITE_PIN, &[pin_code(pin)])?;
        Ok(())
    }

    fn dmg_read(&mut self, addr: u16, buf: &mut [u8]) -> CoreResult<()> {
        let mut pos = addr;
        for chunk in buf.chunks_mut(0x1000) {
            let mut operands = [0u8; 4];
            operands[..2].copy_from_slice(&pos.to_be_bytes());
            operands[2..].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
            self.read_response(DMG_READ, &operands, chunk)?;
            pos = pos.wrapping_add(chunk.len() as u16);
        }
        Ok(())
    }

    fn dmg_write(&mut self, addr: u16, value: u8) -> CoreResult<()> {
        let mut operands = [0u8; 3];
        operands[..2].copy_from_slice(&addr.to_be_bytes());
        operands[2] = value;
        self.command(DMG_WRITE, &operands)?;
        Ok(())
    }

    fn dmg_flash_write(&mut self, addr: u16, value: u8) -> CoreResult<()> {
        let mut operands = [0u8; 3];
        operands[..2].copy_from_slice(&addr.to_be_bytes());
        operands[2] = value;
        self.command(DMG_FLASH_WRITE, &operands)?;
        Ok(())
    }

    fn dmg_write_block(&mut self, addr: u16, data: &[u8]) -> CoreResult<()> {
        let mut pos = addr;
        for chunk in data.chunks(0x1000) {
            let mut operands = [0u8; 4];
            operands[..2].copy_from_slice(&pos.to_be_bytes());
            operands[2..].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
            self.command_with_payload(DMG_WRITE_BLOCK, &operands, chunk)?;
            pos = pos.wrapping_add(chunk.len() as u16);
        }
        Ok(())
    }

    fn agb_read(&mut self, addr: u32, buf: &mut [u8]) -> CoreResult<()> {
        let mut pos = addr;
        for chunk in buf.chunks_mut(0x1000) {
            let mut operands = [0u8; 6];
            operands[..4].copy_from_slice(&pos.to_be_bytes());
            operands[4..].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
            self.read_response(AGB_READ, &operands, chunk)?;
            pos += chunk.len() as u32;
        }
        Ok(())
    }

    fn agb_write(&mut self, addr: u32, value: u16) -> CoreResult<()> {
        let mut operands = [0u8; 6];
        operands[..4].copy_from_slice(&addr.to_be_bytes());
        operands[4..].copy_from_slice(&value.to_be_bytes());
        self.command(AGB_WRITE, &operands)?;
        Ok(())
    }

    fn agb_save_read(&mut self, addr: u32, buf: &mut [u8]) -> CoreResult<()> {
        let mut pos = addr;
        for chunk in buf.chunks_mut(0x1000) {
            let mut operands = [0u8; 6];
            operands[..4].copy_from_slice(&pos.to_be_bytes());
            operands[4..].copy_from_slice(&(chunk.len() as u16).to_be_bytes());
            self.read_response(AGB_SAVE_READ, &operands, chunk)?;
            pos += chunk.len() as u32;
        }
        Ok(())
    }

    fn agb_save_write(&mut self, addr: u32, value: u8) -> CoreResult<()> {
        let mut operands = [0u8; 5];
        operands[..4].copy_from_slice(&addr.to_be_bytes());
        operands[4] = value;
        self.command(AGB_SAVE_WRITE, &operands)?;
        Ok(())
    }

    fn agb_eeprom_read(&mut self, size: EepromSize, buf: &mut [u8]) -> CoreResult<()> {
        self.read_response(AGB_EEPROM_READ, &[eeprom_code(size)], buf)?;
        Ok(())
    }

    fn agb_eeprom_write(&mut self, size: EepromSize, data: &[u8]) -> CoreResult<()> {
        self.command_with_payload(AGB_EEPROM_WRITE, &[eeprom_code(size)], data)?;
        Ok(())
    }

    fn reset_cart(&mut self) -> CoreResult<()> {
        self.command(RESET_CART, &[])?;
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport: each queued buffer answers one
    /// `read_nonblock` call
    #[derive(Default)]
    struct MockTransport {
        reads: VecDeque<Vec<u8>>,
        writes: Vec<Vec<u8>>,
        clears: u32,
    }

    impl Transport for MockTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.writes.push(data.to_vec());
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            let wanted = buf.len();
            match self.read_nonblock(buf, 0)? {
                n if n == wanted => Ok(()),
                got => Err(LinkError::ShortRead { wanted, got }),
            }
        }

        fn read_nonblock(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
            let Some(mut chunk) = self.reads.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.reads.push_front(chunk.split_off(n));
            }
            Ok(n)
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn clear(&mut self) -> Result<()> {
            self.clears += 1;
            self.reads.clear();
            Ok(())
        }
    }

    fn device(transport: MockTransport) -> BridgeDevice<MockTransport> {
        BridgeDevice {
            transport,
            mode: None,
            firmware: FirmwareVersion { major: 1, minor: 0 },
            write_settle_ms: 0,
        }
    }

    fn frames_with_opcode(dev: &BridgeDevice<MockTransport>, opcode: u8) -> usize {
        dev.transport
            .writes
            .iter()
            .filter(|w| w.first() == Some(&opcode))
            .count()
    }

    #[test]
    fn handshake_reads_firmware_version() {
        let mut t = MockTransport::default();
        t.reads.push_back(vec![1, 12]);
        let dev = BridgeDevice::new(t).unwrap();
        assert_eq!(dev.firmware(), FirmwareVersion { major: 1, minor: 12 });
    }

    #[test]
    fn command_frames_are_big_endian() {
        let mut dev = device(MockTransport::default());
        dev.transport.reads.push_back(vec![ACK_OK]);
        dev.dmg_write(0x2100, 0x01).unwrap();
        assert_eq!(dev.transport.writes[0], vec![DMG_WRITE, 0x21, 0x00, 0x01]);

        dev.transport.reads.push_back(vec![ACK_OK]);
        dev.agb_write(0x0800_0AAA, 0x00A9).unwrap();
        assert_eq!(
            dev.transport.writes[1],
            vec![AGB_WRITE, 0x08, 0x00, 0x0A, 0xAA, 0x00, 0xA9]
        );
    }

    #[test]
    fn short_read_then_good_data_retries_exactly_once() {
        let mut dev = device(MockTransport::default());
        // First attempt: 3 of 8 bytes then silence. Second attempt: all 8.
        dev.transport.reads.push_back(vec![0xDE, 0xAD, 0xBE]);
        let mut buf = [0u8; 8];
        let frame = BridgeDevice::<MockTransport>::frame(DMG_READ, &[0, 0, 0, 8]);
        let first = dev.try_read(&frame, &mut buf);
        assert!(matches!(
            first,
            Err(LinkError::ShortRead { wanted: 8, got: 3 })
        ));

        dev.transport.clear().unwrap();
        dev.transport.reads.push_back((1..=8).collect());
        dev.try_read(&frame, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frames_with_opcode(&dev, DMG_READ), 2);
    }

    #[test]
    fn bad_ack_retries_then_succeeds() {
        let mut dev = device(MockTransport::default());
        dev.transport.reads.push_back(vec![0x42]);
        let res = dev.try_command(&[SET_VOLTAGE, voltage::V5]);
        assert!(matches!(
            res,
            Err(LinkError::BadAck {
                opcode: SET_VOLTAGE,
                got: 0x42
            })
        ));

        dev.transport.reads.push_back(vec![ACK_DONE]);
        dev.set_voltage(Voltage::V5).unwrap();
    }

    #[test]
    fn exhausted_retries_report_the_opcode() {
        let mut dev = device(MockTransport::default());
        // No acks queued at all: every attempt times out
        let err = dev.command(RESET_CART, &[]).unwrap_err();
        match err {
            LinkError::RetriesExhausted { opcode, attempts } => {
                assert_eq!(opcode, RESET_CART);
                assert_eq!(attempts, COMMAND_RETRIES + 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            frames_with_opcode(&dev, RESET_CART),
            (COMMAND_RETRIES + 1) as usize
        );
    }

    #[test]
    fn long_reads_send_continuation_tokens() {
        let mut dev = device(MockTransport::default());
        // 130 bytes = 3 chunks of 64/64/2
        dev.transport.reads.push_back(vec![0xAB; 130]);
        let mut buf = [0u8; 130];
        dev.read_response(AGB_READ, &[0, 0, 0, 0, 0, 130], &mut buf)
            .unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));

        let continuations = dev
            .transport
            .writes
            .iter()
            .filter(|w| w.as_slice() == [CONTINUE])
            .count();
        assert_eq!(continuations, 2);
    }
}
