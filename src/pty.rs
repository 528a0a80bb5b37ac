//! Pseudo-terminal plumbing for interactive shell sessions.
//!
//! The master side is wrapped in a non-blocking [`AsyncFd`] so reads and
//! writes suspend instead of blocking a worker thread. The slave side is
//! handed to the child as its controlling terminal.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::ptr;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::process::{Child, Command};

/// Async handle to the PTY master.
///
/// Methods take `&self`, so one task can read while another writes or
/// resizes through a shared reference.
pub struct PtyMaster {
    inner: AsyncFd<OwnedFd>,
}

/// Open a PTY pair with the window size already set.
///
/// Sizing the PTY before the child spawns matters: TUI programs read the
/// terminal size once at startup, and a resize-after-spawn repaints wrong.
pub fn open_pty(rows: u16, cols: u16) -> io::Result<(PtyMaster, OwnedFd)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let mut ws = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: openpty writes two valid fds on success; name is unused.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut ws,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: both fds are freshly opened and owned by us now.
    let master = unsafe { OwnedFd::from_raw_fd(master) };
    let slave = unsafe { OwnedFd::from_raw_fd(slave) };

    set_nonblocking(master.as_raw_fd())?;

    Ok((
        PtyMaster {
            inner: AsyncFd::with_interest(master, Interest::READABLE | Interest::WRITABLE)?,
        },
        slave,
    ))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an owned, open fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

impl PtyMaster {
    /// Read available output from the child.
    ///
    /// Returns `Err` with `EIO` once the child side is gone; callers treat
    /// that as end-of-session.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: reading into a caller-provided buffer on our fd.
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(read) => return read,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all bytes to the child's input.
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.inner.writable().await?;
            let result = guard.try_io(|inner| {
                // SAFETY: writing from a caller-provided buffer on our fd.
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Apply a new window size; the kernel sends SIGWINCH to the child.
    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: TIOCSWINSZ reads the winsize struct we pass.
        let rc = unsafe { libc::ioctl(self.inner.get_ref().as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Current window size, mostly for tests.
    pub fn window_size(&self) -> io::Result<(u16, u16)> {
        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        // SAFETY: TIOCGWINSZ fills the struct.
        let rc = unsafe { libc::ioctl(self.inner.get_ref().as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((ws.ws_row, ws.ws_col))
    }
}

/// Spawn a command with the PTY slave as its stdio and controlling terminal.
///
/// Consumes the slave fd: the parent must not keep a copy open, or the
/// master would never observe EOF when the child exits.
pub fn spawn_on_pty(cmd: &mut Command, slave: OwnedFd) -> io::Result<Child> {
    cmd.stdin(Stdio::from(slave.try_clone()?));
    cmd.stdout(Stdio::from(slave.try_clone()?));
    cmd.stderr(Stdio::from(slave));
    cmd.kill_on_drop(true);

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            // Adopt the PTY (now on fd 0) as the controlling terminal.
            if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn()
}
