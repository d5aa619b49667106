//! Wire format of the exec error channel.
//!
//! The channel is a close-on-exec pipe. A forked child that fails before or
//! during `exec` writes its errno exactly once as a native-endian `i32`; a
//! child that execs successfully writes nothing and the kernel closes the
//! write end, so the parent observes EOF after zero bytes.

use std::io::{self, ErrorKind, Read};

/// Number of bytes the child writes on failure.
pub const ERRNO_WIDTH: usize = std::mem::size_of::<i32>();

/// What the parent learned from draining the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelReport {
    /// EOF without data: the program image replaced the child.
    Started,
    /// The child reported this errno and exited without running the program.
    Failed(i32),
}

/// Encode an errno for the channel. Allocation-free so it is usable between
/// `fork` and `exec`.
#[inline]
pub fn encode_errno(code: i32) -> [u8; ERRNO_WIDTH] {
    code.to_ne_bytes()
}

/// Decode a complete channel payload.
pub fn decode(bytes: &[u8]) -> io::Result<ChannelReport> {
    match bytes.len() {
        0 => Ok(ChannelReport::Started),
        ERRNO_WIDTH => {
            let mut buf = [0u8; ERRNO_WIDTH];
            buf.copy_from_slice(bytes);
            Ok(ChannelReport::Failed(i32::from_ne_bytes(buf)))
        }
        n => Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("error channel: expected 0 or {ERRNO_WIDTH} bytes, got {n}"),
        )),
    }
}

/// Drain the read end until EOF (or a full errno), retrying on `EINTR`.
pub fn read_report<R: Read>(mut r: R) -> io::Result<ChannelReport> {
    let mut buf = [0u8; ERRNO_WIDTH + 1];
    let mut filled = 0;
    loop {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    decode(&buf[..filled])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that yields one byte per call and an EINTR in between.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        interrupt_next: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.interrupt_next {
                self.interrupt_next = false;
                return Err(io::Error::from(ErrorKind::Interrupted));
            }
            self.interrupt_next = true;
            if self.pos == self.data.len() || out.is_empty() {
                return Ok(0);
            }
            out[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn empty_channel_means_started() {
        let report = read_report(Cursor::new(Vec::<u8>::new())).unwrap();
        assert_eq!(report, ChannelReport::Started);
    }

    #[test]
    fn errno_survives_short_reads_and_eintr() {
        let r = Trickle {
            data: encode_errno(2).to_vec(),
            pos: 0,
            interrupt_next: true,
        };
        assert_eq!(read_report(r).unwrap(), ChannelReport::Failed(2));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let err = read_report(Cursor::new(vec![1u8, 2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().contains("got 2"), "got: {err}");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut bytes = encode_errno(13).to_vec();
        bytes.extend_from_slice(&[0, 0, 0]);
        let err = read_report(Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}

#[cfg(test)]
mod prop {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn any_errno_is_recovered(code in any::<i32>()) {
            let report = read_report(&encode_errno(code)[..]).unwrap();
            prop_assert_eq!(report, ChannelReport::Failed(code));
        }

        #[test]
        fn odd_lengths_never_decode(bytes in proptest::collection::vec(any::<u8>(), 1..16)
            .prop_filter("not an errno", |v| v.len() != ERRNO_WIDTH))
        {
            prop_assert!(decode(&bytes).is_err());
        }
    }
}
