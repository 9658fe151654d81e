use std::fmt::Arguments;
use std::io::Write;

/// Session scoped scratch space for building protocol lines.
///
/// Buffers handed out by [ScratchPool::line] are returned to the pool
/// with [ScratchPool::recycle]; everything the pool holds is released
/// in one go by [ScratchPool::destroy].
#[derive(Debug, Default)]
pub struct ScratchPool {
    free: Vec<Vec<u8>>,
    allocated: usize,
}

impl ScratchPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formats `args` followed by CRLF into a pooled buffer
    pub fn line(&mut self, args: Arguments) -> Vec<u8> {
        let mut buf = match self.free.pop() {
            Some(buf) => buf,
            None => {
                self.allocated += 1;
                Vec::with_capacity(128)
            }
        };
        buf.clear();
        // Writing into a Vec cannot fail
        let _ = buf.write_fmt(args);
        buf.extend_from_slice(b"\r\n");
        buf
    }

    pub fn recycle(&mut self, buf: Vec<u8>) {
        self.free.push(buf);
    }

    /// Number of buffers this pool has had to allocate
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Releases the pool, returning the number of buffers it allocated
    pub fn destroy(self) -> usize {
        self.allocated
    }
}
