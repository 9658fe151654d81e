// The readiness loop in this file follows the splice(2) based copier
// from <https://github.com/saiko-tech/mmproxy-rs/blob/9fdd5ed9d532dee9b62dafb592acecc6da33dc5f/src/listener/tcp.rs#L129>
// which is provided under the MIT License and is
// Copyright (c) 2022 Saiko Technology Ltd.
use async_trait::async_trait;
use std::fs::File;
use std::io::{Error as IoError, ErrorKind as IoErrorKind, Result as IoResult};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};

/// Upper bound on a single sendfile(2) call
const CHUNK_SIZE: usize = 1024 * 1024;

/// A socket whose write readiness can be awaited and whose raw fd can
/// be written to while tokio tracks readiness
#[async_trait]
pub trait ReadyWrite: AsRawFd + Sync {
    async fn ready_writable(&self) -> IoResult<()>;
    fn try_write_with<R>(&self, f: impl FnOnce() -> IoResult<R>) -> IoResult<R>;
}

#[async_trait]
impl ReadyWrite for TcpStream {
    async fn ready_writable(&self) -> IoResult<()> {
        self.writable().await
    }

    fn try_write_with<R>(&self, f: impl FnOnce() -> IoResult<R>) -> IoResult<R> {
        self.try_io(Interest::WRITABLE, f)
    }
}

#[async_trait]
impl ReadyWrite for UnixStream {
    async fn ready_writable(&self) -> IoResult<()> {
        self.writable().await
    }

    fn try_write_with<R>(&self, f: impl FnOnce() -> IoResult<R>) -> IoResult<R> {
        self.try_io(Interest::WRITABLE, f)
    }
}

/// This linux specific function uses the sendfile(2) syscall to move
/// `size` bytes from the start of `src` to `dst` inside the kernel,
/// without copying the message through userspace.
/// The file offset of `src` is left untouched.
/// Fails with `TimedOut` if `dst` stays unwritable for `idle_timeout`.
pub async fn sendfile_copy<S: ReadyWrite>(
    dst: &S,
    src: &File,
    size: u64,
    idle_timeout: Duration,
) -> IoResult<u64> {
    let dst_fd = dst.as_raw_fd();
    let src_fd = src.as_raw_fd();
    let mut offset: libc::off_t = 0;
    let mut remaining = size;

    while remaining > 0 {
        tokio::time::timeout(idle_timeout, dst.ready_writable())
            .await
            .map_err(|_| {
                IoError::new(
                    IoErrorKind::TimedOut,
                    format!("peer stopped reading after {} of {size} bytes", size - remaining),
                )
            })??;

        let ret = dst.try_write_with(|| {
            while remaining > 0 {
                let want = remaining.min(CHUNK_SIZE as u64) as usize;
                let sent = sendfile(dst_fd, src_fd, &mut offset, want)?;
                if sent == 0 {
                    return Err(IoError::new(
                        IoErrorKind::UnexpectedEof,
                        format!("file ended after {} of {size} bytes", size - remaining),
                    ));
                }
                remaining -= sent as u64;
            }
            Ok(())
        });

        if let Err(err) = ret {
            if err.kind() != IoErrorKind::WouldBlock {
                return Err(err);
            }
        }
    }

    Ok(size)
}

fn sendfile(out_fd: RawFd, in_fd: RawFd, offset: &mut libc::off_t, n: usize) -> IoResult<usize> {
    let result = unsafe { libc::sendfile(out_fd, in_fd, offset, n) };

    if result >= 0 {
        return Ok(result as usize);
    }

    let err = IoError::last_os_error();

    // Normalize EAGAIN to WouldBlock
    let errno = err.raw_os_error().unwrap_or(0);
    if (errno == libc::EWOULDBLOCK || errno == libc::EAGAIN)
        && err.kind() != IoErrorKind::WouldBlock
    {
        Err(IoError::new(IoErrorKind::WouldBlock, "EWOULDBLOCK"))
    } else {
        Err(err)
    }
}
