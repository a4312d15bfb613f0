// ABOUTME: Pseudo-terminal allocation for the shell bridge.
// ABOUTME: The slave side is switched to raw mode so it carries bytes untouched.

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{Winsize, openpty};
use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

/// Master and slave ends of a freshly opened pty.
#[derive(Debug)]
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: File,
}

/// Open a pty pair with the slave in raw mode: no echo, no line buffering,
/// no signal keys and no output post-processing.
pub fn open_raw() -> io::Result<PtyPair> {
    let pty = openpty(None::<&Winsize>, None::<&Termios>).map_err(io::Error::from)?;

    let mut termios = tcgetattr(&pty.slave).map_err(io::Error::from)?;
    cfmakeraw(&mut termios);
    tcsetattr(&pty.slave, SetArg::TCSANOW, &termios).map_err(io::Error::from)?;

    Ok(PtyPair {
        master: pty.master,
        slave: File::from(pty.slave),
    })
}

/// Switch `file` to non-blocking reads and writes.
pub fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn raw_slave_passes_bytes_through() {
        let pty = open_raw().unwrap();
        let mut master = File::from(pty.master);
        let mut slave = pty.slave;

        // In raw mode there is no line discipline: no echo and no CR/LF mapping.
        master.write_all(b"ab\r").unwrap();
        let mut buf = [0u8; 3];
        slave.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ab\r");

        slave.write_all(b"x\n").unwrap();
        let mut out = [0u8; 2];
        master.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"x\n");
    }

    #[test]
    fn nonblocking_slave_reports_would_block() {
        let pty = open_raw().unwrap();
        let mut slave = pty.slave;
        set_nonblocking(&slave).unwrap();

        let mut buf = [0u8; 8];
        let err = slave.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
