//! Text rendering of decoded frames.

use std::io::{self, Write};

use crate::bpf::packet::FrameRecord;

/// Writes one line per record: `src -> dst [type=0x0800] len=N`.
///
/// `len` is the number of captured bytes. When the wire length differs it is
/// appended as `/W`; records too short to hold an Ethernet header are marked.
pub fn write_record<W: Write>(out: &mut W, record: &FrameRecord) -> io::Result<()> {
    write!(
        out,
        "{} -> {} [type=0x{:04x}] len={}",
        record.source, record.destination, record.ethertype, record.payload_length
    )?;
    if record.wire_length as usize != record.payload_length {
        write!(out, "/{}", record.wire_length)?;
    }
    if record.is_truncated() {
        out.write_all(b" (truncated)")?;
    }
    out.write_all(b"\n")
}

/// Writes every record and returns how many were written.
pub fn write_records<W, I>(out: &mut W, records: I) -> io::Result<usize>
where
    W: Write,
    I: IntoIterator<Item = FrameRecord>,
{
    let mut n = 0;
    for record in records {
        write_record(out, &record)?;
        n += 1;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::packet::MacAddr;

    fn record(payload_length: usize, wire_length: u32) -> FrameRecord {
        FrameRecord {
            timestamp: 0,
            source: MacAddr([0x02, 0, 0, 0, 0, 0x01]),
            destination: MacAddr([0xff; 6]),
            ethertype: 0x0800,
            payload_offset: 18,
            payload_length,
            wire_length,
        }
    }

    fn render(r: &FrameRecord) -> String {
        let mut out = Vec::new();
        write_record(&mut out, r).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn full_capture_line() {
        assert_eq!(
            render(&record(60, 60)),
            "02:00:00:00:00:01 -> ff:ff:ff:ff:ff:ff [type=0x0800] len=60\n"
        );
    }

    #[test]
    fn snapped_frame_shows_wire_length() {
        assert!(render(&record(96, 1514)).ends_with("len=96/1514\n"));
    }

    #[test]
    fn short_frame_is_marked() {
        assert!(render(&record(1, 1)).ends_with("len=1 (truncated)\n"));
    }

    #[test]
    fn counts_written_records() {
        let mut out = Vec::new();
        let n = write_records(&mut out, [record(60, 60), record(60, 60)]).unwrap();
        assert_eq!(n, 2);
        assert_eq!(out.iter().filter(|&&b| b == b'\n').count(), 2);
    }
}
