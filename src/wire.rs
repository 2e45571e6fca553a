// Helpers for walking kernel buffers: alignment rounding and bounds-checked
// native-endian field reads. Kernel records (bpf_hdr, rt_msghdr, sockaddr_dl)
// are laid out in host byte order.

/// Rounds `x` up to the next multiple of `align`, which must be a power of two.
///
/// With `align == 4` this is the Darwin `BPF_WORDALIGN` macro.
#[inline]
pub const fn align_up(x: usize, align: usize) -> usize {
    (x + (align - 1)) & !(align - 1)
}

#[inline]
pub fn ne_u16(buf: &[u8], off: usize) -> Option<u16> {
    let bytes = buf.get(off..off.checked_add(2)?)?;
    Some(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn ne_u32(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off.checked_add(4)?)?;
    Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reads a signed native-endian integer of `width` bytes (4 or 8), widened to `i64`.
pub fn ne_int(buf: &[u8], off: usize, width: usize) -> Option<i64> {
    let bytes = buf.get(off..off.checked_add(width)?)?;
    match width {
        4 => Some(i64::from(i32::from_ne_bytes(bytes.try_into().ok()?))),
        8 => Some(i64::from_ne_bytes(bytes.try_into().ok()?)),
        _ => None,
    }
}
