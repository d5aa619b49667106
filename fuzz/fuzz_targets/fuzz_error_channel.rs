#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::io::{self, Read};
use subspawn_ipc::{ChannelReport, decode, read_report};

/// Payload delivered in arbitrary chunks, with interruptions in between, the
/// way a pipe read can come back short or with EINTR.
#[derive(Arbitrary, Debug)]
struct Delivery {
    payload: Vec<u8>,
    chunks: Vec<u8>,
    interrupt_every: u8,
}

struct Chunked {
    d: Delivery,
    pos: usize,
    calls: usize,
}

impl Read for Chunked {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.calls += 1;
        let every = usize::from(self.d.interrupt_every);
        if every > 1 && self.calls % every == 0 {
            return Err(io::ErrorKind::Interrupted.into());
        }
        let want = self
            .d
            .chunks
            .get(self.calls % self.d.chunks.len().max(1))
            .map_or(buf.len(), |&c| usize::from(c).max(1));
        let rest = &self.d.payload[self.pos..];
        let n = want.min(buf.len()).min(rest.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

fuzz_target!(|d: Delivery| {
    let whole = decode(&d.payload);
    let len = d.payload.len();
    let chunked = read_report(Chunked { d, pos: 0, calls: 0 });
    match (len, chunked) {
        (0, Ok(ChannelReport::Started)) => {}
        (4, Ok(ChannelReport::Failed(code))) => {
            assert!(matches!(whole, Ok(ChannelReport::Failed(c)) if c == code))
        }
        (_, Err(_)) => assert!(len != 0 && len != 4),
        (n, other) => panic!("{n} bytes decoded as {other:?}"),
    }
});
