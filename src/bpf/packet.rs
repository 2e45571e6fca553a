// Frame decoder for BPF read buffers.
//
// A read from /dev/bpfN returns zero or more records, each a `struct bpf_hdr`
// followed by the captured link-layer bytes, padded so the next record starts
// on a word boundary:
//
//   | bpf_hdr (bh_hdrlen) | frame (bh_caplen) | pad | bpf_hdr | frame | pad | ...
//
// The padding carries no marker. Decoding with an alignment other than the one
// the kernel used puts every following record at the wrong offset.

use std::fmt;

use crate::wire::{align_up, ne_int, ne_u16, ne_u32};

// ---------------------------------------------------------------------------
// Buffer layout
// ---------------------------------------------------------------------------

/// Shape of `struct bpf_hdr` and the record alignment for one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Size of `bh_tstamp`: two 4-byte fields (`timeval32`) or two 8-byte fields.
    pub timestamp_len: usize,
    /// `BPF_ALIGNMENT`, the word size records are padded to.
    pub alignment: usize,
}

impl BufferLayout {
    /// macOS: `timeval32` timestamp, `BPF_ALIGNMENT == sizeof(int32_t)`.
    pub const DARWIN: Self = Self {
        timestamp_len: 8,
        alignment: 4,
    };

    #[cfg(target_os = "macos")]
    pub const NATIVE: Self = Self::DARWIN;

    /// FreeBSD and friends: native `timeval`, `BPF_ALIGNMENT == sizeof(long)`.
    #[cfg(not(target_os = "macos"))]
    pub const NATIVE: Self = Self {
        timestamp_len: size_of::<libc::timeval>(),
        alignment: size_of::<libc::c_long>(),
    };

    /// Bytes of `bpf_hdr` that carry fields (`SIZEOF_BPF_HDR`), before padding.
    pub const fn header_len(&self) -> usize {
        self.timestamp_len + 4 + 4 + 2
    }

    fn caplen_offset(&self) -> usize {
        self.timestamp_len
    }

    fn datalen_offset(&self) -> usize {
        self.timestamp_len + 4
    }

    fn hdrlen_offset(&self) -> usize {
        self.timestamp_len + 8
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const ETH_HLEN: usize = 14;
const ETH_ALEN: usize = 6;
const ETH_DST_OFFSET: usize = 0;
const ETH_SRC_OFFSET: usize = 6;
const ETH_TYPE_OFFSET: usize = 12;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// IEEE 802 hardware address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; ETH_ALEN]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// One `bpf_hdr` as found in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Capture time in microseconds since the epoch.
    pub timestamp: u64,
    /// Bytes of the frame present in the buffer (`bh_caplen`).
    pub capture_length: u32,
    /// Length of the frame on the wire (`bh_datalen`).
    pub wire_length: u32,
    /// Offset from the start of the header to the frame (`bh_hdrlen`).
    pub header_length: u16,
}

impl FrameHeader {
    /// Reads the header at the start of `buf`, or `None` if it does not fit.
    pub fn parse(buf: &[u8], layout: BufferLayout) -> Option<Self> {
        let half = layout.timestamp_len / 2;
        let secs = ne_int(buf, 0, half)?;
        let usecs = ne_int(buf, half, half)?;
        Some(Self {
            timestamp: (secs.max(0) as u64)
                .saturating_mul(1_000_000)
                .saturating_add(usecs.max(0) as u64),
            capture_length: ne_u32(buf, layout.caplen_offset())?,
            wire_length: ne_u32(buf, layout.datalen_offset())?,
            header_length: ne_u16(buf, layout.hdrlen_offset())?,
        })
    }

    /// Bytes this record occupies before padding.
    pub fn record_len(&self) -> usize {
        usize::from(self.header_length) + self.capture_length as usize
    }
}

/// One decoded Ethernet frame.
///
/// Only the link-layer header is copied out. `payload_offset` and
/// `payload_length` locate the captured frame in the buffer it was decoded
/// from, which the next read overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub timestamp: u64,
    pub source: MacAddr,
    pub destination: MacAddr,
    pub ethertype: u16,
    pub payload_offset: usize,
    pub payload_length: usize,
    pub wire_length: u32,
}

impl FrameRecord {
    /// Builds a record from the captured bytes of one frame. Fields the
    /// capture does not reach are left zero.
    fn from_frame(header: &FrameHeader, frame: &[u8], payload_offset: usize) -> Self {
        let mut destination = MacAddr::default();
        let mut source = MacAddr::default();
        copy_prefix(&mut destination.0, frame, ETH_DST_OFFSET);
        copy_prefix(&mut source.0, frame, ETH_SRC_OFFSET);
        let ethertype = frame
            .get(ETH_TYPE_OFFSET..ETH_HLEN)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .unwrap_or(0);

        Self {
            timestamp: header.timestamp,
            source,
            destination,
            ethertype,
            payload_offset,
            payload_length: frame.len(),
            wire_length: header.wire_length,
        }
    }

    /// True when fewer than 14 bytes were captured, so the addresses or
    /// EtherType are incomplete.
    pub fn is_truncated(&self) -> bool {
        self.payload_length < ETH_HLEN
    }

    /// The captured frame bytes inside `buf`, the buffer this record came from.
    pub fn frame<'a>(&self, buf: &'a [u8]) -> Option<&'a [u8]> {
        buf.get(self.payload_offset..self.payload_offset + self.payload_length)
    }
}

fn copy_prefix(dst: &mut [u8; ETH_ALEN], frame: &[u8], start: usize) {
    if let Some(avail) = frame.get(start..) {
        let n = avail.len().min(ETH_ALEN);
        dst[..n].copy_from_slice(&avail[..n]);
    }
}

// ---------------------------------------------------------------------------
// Buffer parsing
// ---------------------------------------------------------------------------

/// Lazy iterator over the records of one BPF read buffer.
///
/// Stops at the end of the filled region, or at the first record whose header
/// is malformed or whose frame runs past the end of the slice.
pub struct Frames<'a> {
    buf: &'a [u8],
    pos: usize,
    layout: BufferLayout,
}

impl<'a> Frames<'a> {
    pub fn new(buf: &'a [u8], layout: BufferLayout) -> Self {
        Self {
            buf,
            pos: 0,
            layout,
        }
    }

    /// An iterator that yields nothing, for read cycles that timed out.
    pub fn empty(layout: BufferLayout) -> Self {
        Self::new(&[], layout)
    }

    /// Cursor position: the offset of the next record.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// True once the cursor has reached the end of the filled region.
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn stop(&mut self, reason: &str) -> Option<FrameRecord> {
        log::warn!(
            "BPF buffer: {} at offset {} of {}, dropping remainder",
            reason,
            self.pos,
            self.buf.len()
        );
        self.pos = self.buf.len();
        None
    }
}

impl Iterator for Frames<'_> {
    type Item = FrameRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_exhausted() {
            return None;
        }

        let rest = &self.buf[self.pos..];
        let Some(header) = FrameHeader::parse(rest, self.layout) else {
            return self.stop("short bpf_hdr");
        };
        if usize::from(header.header_length) < self.layout.header_len() {
            return self.stop("bh_hdrlen smaller than bpf_hdr");
        }
        let record_len = header.record_len();
        if record_len > rest.len() {
            return self.stop("truncated record");
        }

        let start = usize::from(header.header_length);
        let record = FrameRecord::from_frame(&header, &rest[start..record_len], self.pos + start);
        self.pos += align_up(record_len, self.layout.alignment);
        Some(record)
    }
}

// ===========================================================================
// Unit tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const HDRLEN: u16 = 18;

    /// Appends one Darwin-layout record (header + frame + padding) to `buf`.
    fn push_record(buf: &mut Vec<u8>, hdrlen: u16, frame: &[u8], secs: i32, usecs: i32) {
        let start = buf.len();
        buf.extend_from_slice(&secs.to_ne_bytes());
        buf.extend_from_slice(&usecs.to_ne_bytes());
        buf.extend_from_slice(&(frame.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&(frame.len() as u32 + 4).to_ne_bytes());
        buf.extend_from_slice(&hdrlen.to_ne_bytes());
        buf.resize(start + usize::from(hdrlen), 0);
        buf.extend_from_slice(frame);
        buf.resize(start + align_up(usize::from(hdrlen) + frame.len(), 4), 0);
    }

    fn frame_of(len: usize, tag: u8) -> Vec<u8> {
        let mut frame = vec![0u8; len];
        for (i, b) in frame.iter_mut().enumerate().take(ETH_HLEN.min(len)) {
            *b = match i {
                0..=5 => tag,
                6..=11 => tag.wrapping_add(0x10),
                12 => 0x08,
                _ => 0x00,
            };
        }
        frame
    }

    #[test]
    fn header_len_matches_darwin_bpf_hdr() {
        assert_eq!(BufferLayout::DARWIN.header_len(), 18);
    }

    #[test]
    fn decodes_empty_slice_to_nothing() {
        assert_eq!(Frames::new(&[], BufferLayout::DARWIN).count(), 0);
        assert_eq!(Frames::empty(BufferLayout::DARWIN).count(), 0);
    }

    #[test]
    fn decodes_three_records_at_aligned_cursors() {
        let lengths = [14usize, 60, 1];
        let mut buf = Vec::new();
        for (i, len) in lengths.iter().enumerate() {
            push_record(&mut buf, HDRLEN, &frame_of(*len, i as u8 + 1), 0, 0);
        }

        // Cursor positions computed by hand: 18+14=32, 18+60=78 -> 80, 18+1=19 -> 20.
        let cursors = [0usize, 32, 112];
        assert_eq!(buf.len(), 132);

        let records: Vec<_> = Frames::new(&buf, BufferLayout::DARWIN).collect();
        assert_eq!(records.len(), 3);
        for ((record, cursor), len) in records.iter().zip(cursors).zip(lengths) {
            assert_eq!(record.payload_offset, cursor + usize::from(HDRLEN));
            assert_eq!(record.payload_length, len);
        }
    }

    #[test]
    fn extracts_addresses_and_ethertype() {
        let mut frame = vec![0u8; 60];
        frame[0..6].copy_from_slice(&[0xff; 6]);
        frame[6..12].copy_from_slice(&[0x00, 0x1c, 0x42, 0x0a, 0x0b, 0x0c]);
        frame[12..14].copy_from_slice(&[0x86, 0xdd]);
        let mut buf = Vec::new();
        push_record(&mut buf, HDRLEN, &frame, 1_700_000_000, 250);

        let record = Frames::new(&buf, BufferLayout::DARWIN).next().unwrap();
        assert_eq!(record.destination, MacAddr([0xff; 6]));
        assert_eq!(record.source.to_string(), "00:1c:42:0a:0b:0c");
        assert_eq!(record.ethertype, 0x86dd);
        assert_eq!(record.wire_length, 64);
        assert_eq!(record.timestamp, 1_700_000_000_000_250);
        assert!(!record.is_truncated());
        assert_eq!(record.frame(&buf), Some(&frame[..]));
    }

    #[test]
    fn aligned_record_gets_no_padding() {
        // 18 + 14 = 32: already on a 4-byte boundary.
        let mut buf = Vec::new();
        push_record(&mut buf, HDRLEN, &frame_of(14, 1), 0, 0);
        push_record(&mut buf, HDRLEN, &frame_of(14, 2), 0, 0);

        let mut frames = Frames::new(&buf, BufferLayout::DARWIN);
        frames.next().unwrap();
        assert_eq!(frames.position(), 32);
        assert_eq!(frames.next().unwrap().payload_offset, 32 + 18);
    }

    #[test]
    fn unaligned_record_is_padded_to_word() {
        // 18 + 15 = 33 -> 36.
        let mut buf = Vec::new();
        push_record(&mut buf, HDRLEN, &frame_of(15, 1), 0, 0);
        push_record(&mut buf, HDRLEN, &frame_of(14, 2), 0, 0);

        let mut frames = Frames::new(&buf, BufferLayout::DARWIN);
        frames.next().unwrap();
        assert_eq!(frames.position(), 36);
        let second = frames.next().unwrap();
        assert_eq!(second.payload_offset, 36 + 18);
        assert_eq!(second.destination, MacAddr([2; 6]));
        assert!(frames.next().is_none());
    }

    #[test]
    fn wrong_alignment_desynchronizes() {
        let mut buf = Vec::new();
        push_record(&mut buf, HDRLEN, &frame_of(15, 1), 0, 0);
        push_record(&mut buf, HDRLEN, &frame_of(14, 2), 0, 0);

        let wide = BufferLayout {
            alignment: 8,
            ..BufferLayout::DARWIN
        };
        let records: Vec<_> = Frames::new(&buf, wide).collect();
        // 33 rounds to 40 instead of 36; the second record is never found.
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn short_frame_yields_truncated_record() {
        let mut buf = Vec::new();
        push_record(&mut buf, HDRLEN, &[0xaa, 0xbb, 0xcc], 0, 0);

        let record = Frames::new(&buf, BufferLayout::DARWIN).next().unwrap();
        assert!(record.is_truncated());
        assert_eq!(record.destination, MacAddr([0xaa, 0xbb, 0xcc, 0, 0, 0]));
        assert_eq!(record.source, MacAddr::default());
        assert_eq!(record.ethertype, 0);
    }

    #[test]
    fn header_only_record_is_yielded_empty() {
        let mut buf = Vec::new();
        push_record(&mut buf, HDRLEN, &[], 0, 0);
        push_record(&mut buf, HDRLEN, &frame_of(60, 0x01), 0, 0);

        let records: Vec<_> = Frames::new(&buf, BufferLayout::DARWIN).collect();
        assert_eq!(records.len(), 2);

        let empty = &records[0];
        assert!(empty.is_truncated());
        assert_eq!(empty.payload_offset, 18);
        assert_eq!(empty.payload_length, 0);
        assert_eq!(empty.wire_length, 4);
        assert_eq!(empty.source, MacAddr::default());
        assert_eq!(empty.destination, MacAddr::default());
        assert_eq!(empty.ethertype, 0);
        assert_eq!(empty.frame(&buf), Some(&[][..]));

        // 18 bytes pad to 20, so the next record starts there.
        assert_eq!(records[1].payload_offset, 20 + 18);
        assert!(!records[1].is_truncated());
    }

    #[test]
    fn stops_at_truncated_final_record() {
        let mut buf = Vec::new();
        push_record(&mut buf, HDRLEN, &frame_of(14, 1), 0, 0);
        push_record(&mut buf, HDRLEN, &frame_of(60, 2), 0, 0);
        buf.truncate(32 + 18 + 30);

        let mut frames = Frames::new(&buf, BufferLayout::DARWIN);
        assert!(frames.next().is_some());
        assert!(frames.next().is_none());
        assert!(frames.is_exhausted());
    }

    #[test]
    fn stops_at_partial_header() {
        let mut buf = Vec::new();
        push_record(&mut buf, HDRLEN, &frame_of(14, 1), 0, 0);
        buf.extend_from_slice(&[0u8; 6]);
        assert_eq!(Frames::new(&buf, BufferLayout::DARWIN).count(), 1);
    }

    #[test]
    fn rejects_header_length_below_bpf_hdr() {
        // A zero bh_hdrlen would never advance the cursor.
        let mut buf = Vec::new();
        push_record(&mut buf, HDRLEN, &frame_of(14, 1), 0, 0);
        buf[16..18].copy_from_slice(&0u16.to_ne_bytes());
        assert_eq!(Frames::new(&buf, BufferLayout::DARWIN).count(), 0);
    }

    #[test]
    fn honours_larger_header_length() {
        // Kernels may pad bpf_hdr further so the network header is aligned.
        let mut buf = Vec::new();
        push_record(&mut buf, 20, &frame_of(14, 7), 0, 0);
        push_record(&mut buf, 20, &frame_of(14, 8), 0, 0);

        let records: Vec<_> = Frames::new(&buf, BufferLayout::DARWIN).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload_offset, 20);
        assert_eq!(records[1].payload_offset, 36 + 20);
        assert_eq!(records[1].destination, MacAddr([8; 6]));
    }

    #[test]
    fn decodes_wide_timestamp_layout() {
        let layout = BufferLayout {
            timestamp_len: 16,
            alignment: 8,
        };
        let frame = frame_of(14, 3);
        let mut buf = Vec::new();
        buf.extend_from_slice(&5i64.to_ne_bytes());
        buf.extend_from_slice(&7i64.to_ne_bytes());
        buf.extend_from_slice(&14u32.to_ne_bytes());
        buf.extend_from_slice(&14u32.to_ne_bytes());
        buf.extend_from_slice(&28u16.to_ne_bytes());
        buf.resize(28, 0);
        buf.extend_from_slice(&frame);

        let record = Frames::new(&buf, layout).next().unwrap();
        assert_eq!(record.timestamp, 5_000_007);
        assert_eq!(record.payload_offset, 28);
        assert_eq!(record.destination, MacAddr([3; 6]));
    }

    #[test]
    fn mac_display_is_hex_colon() {
        let mac = MacAddr([0x00, 0x0a, 0xbc, 0xde, 0xf0, 0x01]);
        assert_eq!(mac.to_string(), "00:0a:bc:de:f0:01");
    }
}
