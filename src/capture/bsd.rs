// BSD/macOS capture device: wraps BpfDevice from src/bpf/.

use std::io;

use crate::bpf::filter::bpf_insn;
use crate::bpf::{BpfDevice, BpfStats};

use super::{CaptureDevice, CaptureStats, DeviceOption};

impl From<BpfStats> for CaptureStats {
    fn from(s: BpfStats) -> Self {
        Self {
            received: s.received,
            dropped: s.dropped,
        }
    }
}

impl CaptureDevice for BpfDevice {
    fn unit(&self) -> u32 {
        BpfDevice::unit(self)
    }

    fn bind(&mut self, interface: &str) -> io::Result<()> {
        BpfDevice::bind(self, interface)
    }

    fn set_option(&mut self, option: DeviceOption) -> io::Result<()> {
        match option {
            DeviceOption::HeaderComplete(on) => self.set_header_complete(on),
            DeviceOption::SeeSent(on) => self.set_see_sent(on),
            DeviceOption::Immediate(on) => self.set_immediate(on),
            DeviceOption::ReadTimeout(timeout) => self.set_read_timeout(timeout),
        }
    }

    fn link_type(&mut self) -> io::Result<u32> {
        BpfDevice::link_type(self)
    }

    fn install_filter(&mut self, program: &[bpf_insn]) -> io::Result<()> {
        self.set_filter(program)
    }

    fn buffer_len(&mut self) -> io::Result<usize> {
        BpfDevice::buffer_len(self)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BpfDevice::read(self, buf)
    }

    fn stats(&mut self) -> io::Result<CaptureStats> {
        BpfDevice::stats(self).map(CaptureStats::from)
    }
}
