// ABOUTME: Bounded combined wait over local descriptors and transport channels.
// ABOUTME: Sliced so the session mutex is only taken for individual channel polls.

use super::{ChannelId, ChannelPoll, Result, StreamKind};
use crate::ssh::SessionLink;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::BorrowedFd;
use std::time::{Duration, Instant};

const SLICE: Duration = Duration::from_millis(20);

/// Outcome of a combined wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// One flag per descriptor, in the order they were given.
    pub sockets: Vec<bool>,
    /// One flag per channel: data or EOF is pending on any requested stream.
    pub channels: Vec<bool>,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.sockets.iter().chain(self.channels.iter()).any(|r| *r)
    }
}

/// A descriptor to wait on. `writable` also wakes the wait once it can take output.
#[derive(Debug, Clone, Copy)]
pub struct Watch<'fd> {
    pub fd: BorrowedFd<'fd>,
    pub writable: bool,
}

impl<'fd> Watch<'fd> {
    pub fn read(fd: BorrowedFd<'fd>) -> Self {
        Self { fd, writable: false }
    }
}

/// Wait until a descriptor is readable, a channel has input, or `timeout` passes.
pub fn wait(
    link: &SessionLink,
    fds: &[BorrowedFd<'_>],
    channels: &[ChannelId],
    kinds: &[StreamKind],
    timeout: Duration,
) -> Result<Readiness> {
    let watches: Vec<Watch<'_>> = fds.iter().map(|fd| Watch::read(*fd)).collect();
    wait_watches(link, &watches, channels, kinds, timeout)
}

/// Like [`wait`], with per-descriptor interest.
pub fn wait_watches(
    link: &SessionLink,
    fds: &[Watch<'_>],
    channels: &[ChannelId],
    kinds: &[StreamKind],
    timeout: Duration,
) -> Result<Readiness> {
    let deadline = Instant::now() + timeout;
    loop {
        let channel_ready = poll_channels(link, channels, kinds)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = if channel_ready.iter().any(|r| *r) {
            Duration::ZERO
        } else {
            remaining.min(SLICE)
        };
        let sockets = poll_fds(fds, slice)?;

        let readiness = Readiness {
            sockets,
            channels: channel_ready,
        };
        if readiness.any() || Instant::now() >= deadline {
            return Ok(readiness);
        }
    }
}

fn poll_channels(
    link: &SessionLink,
    channels: &[ChannelId],
    kinds: &[StreamKind],
) -> Result<Vec<bool>> {
    let mut ready = Vec::with_capacity(channels.len());
    for channel in channels {
        let mut hit = false;
        for kind in kinds {
            let state = link.call(|t| t.poll(*channel, *kind));
            // A vanished channel counts as ready so the caller reads and tears it down.
            if !matches!(state, Ok(ChannelPoll::Empty)) {
                hit = true;
                break;
            }
        }
        ready.push(hit);
    }
    Ok(ready)
}

fn poll_fds(fds: &[Watch<'_>], slice: Duration) -> Result<Vec<bool>> {
    let mut pollfds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|watch| {
            let mut flags = PollFlags::POLLIN;
            if watch.writable {
                flags |= PollFlags::POLLOUT;
            }
            PollFd::new(watch.fd, flags)
        })
        .collect();
    let millis = u16::try_from(slice.as_millis()).unwrap_or(u16::MAX);

    if pollfds.is_empty() {
        std::thread::sleep(slice);
        return Ok(Vec::new());
    }

    loop {
        match poll(&mut pollfds, PollTimeout::from(millis)) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from(e).into()),
        }
    }

    let ready = PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(pollfds
        .iter()
        .map(|p| p.revents().is_some_and(|r| r.intersects(ready)))
        .collect())
}
