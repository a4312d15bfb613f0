// ABOUTME: Relay pairs: one local socket bound to one remote channel.
// ABOUTME: PairSet removes in O(1) by swapping with the last pair; order is not meaningful.

use crate::transport::ChannelId;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

/// Local end of a pair.
#[derive(Debug)]
pub enum LocalStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl LocalStream {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            LocalStream::Tcp(s) => s.set_nonblocking(nonblocking),
            LocalStream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LocalStream::Tcp(s) => s.read(buf),
            LocalStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LocalStream::Tcp(s) => s.write(buf),
            LocalStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LocalStream::Tcp(s) => s.flush(),
            LocalStream::Unix(s) => s.flush(),
        }
    }
}

impl AsFd for LocalStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            LocalStream::Tcp(s) => s.as_fd(),
            LocalStream::Unix(s) => s.as_fd(),
        }
    }
}

/// Bytes read from a channel that the local socket has not accepted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOutput {
    data: Vec<u8>,
    cursor: usize,
}

impl PendingOutput {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, cursor: 0 }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    /// Write as much as the sink takes.
    ///
    /// Returns `Ok(true)` once everything is written and `Ok(false)` when the
    /// sink would block; the unwritten tail stays for the next attempt.
    pub fn flush_into<W: Write>(&mut self, sink: &mut W) -> io::Result<bool> {
        while self.cursor < self.data.len() {
            match sink.write(&self.data[self.cursor..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.cursor += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

#[derive(Debug)]
pub struct Pair<S> {
    pub channel: ChannelId,
    pub socket: S,
    /// At most one buffer of channel output waiting for the socket.
    pub pending: Option<PendingOutput>,
    /// Marked during a pass; swept at the end of the iteration.
    pub disconnected: bool,
}

impl<S> Pair<S> {
    pub fn new(channel: ChannelId, socket: S) -> Self {
        Self {
            channel,
            socket,
            pending: None,
            disconnected: false,
        }
    }
}

/// Live pairs of a tunnel, owned by its worker thread.
#[derive(Debug)]
pub struct PairSet<S> {
    pairs: Vec<Pair<S>>,
}

impl<S> Default for PairSet<S> {
    fn default() -> Self {
        Self { pairs: Vec::new() }
    }
}

impl<S> PairSet<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, channel: ChannelId, socket: S) {
        self.pairs.push(Pair::new(channel, socket));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Remove pair `index` by moving the last pair into its slot.
    pub fn swap_remove(&mut self, index: usize) -> Pair<S> {
        self.pairs.swap_remove(index)
    }

    /// Remove every pair flagged disconnected and return them.
    pub fn sweep(&mut self) -> Vec<Pair<S>> {
        let mut removed = Vec::new();
        let mut index = self.pairs.len();
        while index > 0 {
            index -= 1;
            if self.pairs[index].disconnected {
                removed.push(self.swap_remove(index));
            }
        }
        removed
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Pair<S>> + '_ {
        self.pairs.drain(..)
    }

    #[cfg(test)]
    pub fn iter(&self) -> std::slice::Iter<'_, Pair<S>> {
        self.pairs.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Pair<S>> {
        self.pairs.iter_mut()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.pairs.iter().map(|p| p.channel).collect()
    }
}

impl<S: AsFd> PairSet<S> {
    pub fn fds(&self) -> Vec<BorrowedFd<'_>> {
        self.pairs.iter().map(|p| p.socket.as_fd()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Sink accepting at most `chunk` bytes per write and blocking every other call.
    struct Choppy {
        out: Vec<u8>,
        chunk: usize,
        calls: usize,
    }

    impl Write for Choppy {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn would_block_keeps_remainder() {
        let mut pending = PendingOutput::new(b"hello world".to_vec());
        let mut sink = Choppy {
            out: Vec::new(),
            chunk: 4,
            calls: 0,
        };
        assert!(!pending.flush_into(&mut sink).unwrap());
        assert_eq!(pending.remaining(), b"o world");
        assert_eq!(sink.out, b"hell");
    }

    #[test]
    fn zero_write_is_an_error() {
        let mut pending = PendingOutput::new(b"x".to_vec());
        let mut sink: &mut [u8] = &mut [];
        assert!(pending.flush_into(&mut sink).is_err());
    }

    #[test]
    fn sweep_removes_only_flagged() {
        let mut set = PairSet::new();
        for i in 0..5 {
            set.push(ChannelId(i), i);
        }
        set.iter_mut()
            .filter(|p| p.channel.0 % 2 == 0)
            .for_each(|p| p.disconnected = true);

        let removed: Vec<u32> = set.sweep().iter().map(|p| p.channel.0).collect();
        assert_eq!(removed.len(), 3);
        let mut left: Vec<u32> = set.iter().map(|p| p.channel.0).collect();
        left.sort();
        assert_eq!(left, vec![1, 3]);
    }

    proptest! {
        #[test]
        fn flush_delivers_every_byte_once(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            chunk in 1usize..64,
        ) {
            let mut pending = PendingOutput::new(data.clone());
            let mut sink = Choppy { out: Vec::new(), chunk, calls: 0 };
            let mut rounds = 0;
            while !pending.flush_into(&mut sink).unwrap() {
                rounds += 1;
                prop_assert!(rounds < 10_000);
            }
            prop_assert_eq!(sink.out, data);
        }

        #[test]
        fn swap_remove_keeps_channel_and_socket_aligned(
            count in 1usize..40,
            removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..40),
        ) {
            let mut set = PairSet::new();
            for i in 0..count as u32 {
                set.push(ChannelId(i), i * 10);
            }
            let mut expected: Vec<u32> = (0..count as u32).collect();
            for r in removals {
                if set.is_empty() {
                    break;
                }
                let index = r.index(set.len());
                let removed = set.swap_remove(index);
                prop_assert_eq!(removed.socket, removed.channel.0 * 10);
                expected.retain(|c| *c != removed.channel.0);
            }
            prop_assert_eq!(set.len(), expected.len());
            for pair in set.iter() {
                prop_assert_eq!(pair.socket, pair.channel.0 * 10);
            }
            let mut live: Vec<u32> = set.iter().map(|p| p.channel.0).collect();
            live.sort();
            prop_assert_eq!(live, expected);
        }
    }
}
