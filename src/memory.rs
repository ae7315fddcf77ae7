use crate::{*, error::*};
use std::{mem::MaybeUninit, ffi::c_void};
use libc::pid_t;

// Read access to the inspected process's memory. We never write to it.
pub trait TargetMemory {
    // Fails with UnmappedMemory if any part of the range is not readable.
    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<()>;

    fn read_vec(&mut self, addr: usize, len: usize) -> Result<Vec<u8>> {
        let mut v = vec![0u8; len];
        self.read(addr, &mut v)?;
        Ok(v)
    }

    fn read_usize(&mut self, addr: usize) -> Result<usize> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(usize::from_le_bytes(buf))
    }
}

impl<T: TargetMemory + ?Sized> TargetMemory for &mut T {
    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<()> { (**self).read(addr, buf) }
}

// Reads from another process using process_vm_readv. Doesn't require ptrace-stopping the process, but the caller
// is expected to have it stopped, otherwise values may be torn.
#[derive(Clone, Copy)]
pub struct PidMemReader {
    pub pid: pid_t,
}

impl PidMemReader {
    pub fn new(pid: pid_t) -> Self { Self {pid} }

    pub fn read_uninit<'a>(&self, addr: usize, buf: &'a mut [MaybeUninit<u8>]) -> Result<&'a mut [u8]> {
        unsafe {
            let local_iov = libc::iovec {iov_base: buf.as_mut_ptr() as *mut c_void, iov_len: buf.len()};
            let remote_iov = libc::iovec {iov_base: addr as *mut c_void, iov_len: buf.len()};
            let r = libc::process_vm_readv(self.pid, &local_iov as *const libc::iovec, 1, &remote_iov as *const libc::iovec, 1, 0);
            if r < 0 {
                if *libc::__errno_location() == libc::EFAULT {
                    return err!(UnmappedMemory, "bad address: 0x{:x}", addr);
                } else {
                    return errno_err!("process_vm_readv failed");
                }
            }
            if r != buf.len() as isize {
                return err!(UnmappedMemory, "unmapped memory in 0x{:x}..0x{:x}", addr, addr + buf.len());
            }
            Ok(std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, buf.len()))
        }
    }
}

impl TargetMemory for PidMemReader {
    fn read(&mut self, addr: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        unsafe {self.read_uninit(addr, std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len()))}?;
        Ok(())
    }
}

pub const PAGE_SIZE: usize = 4096;

// Caches the last read page. Good for sequential small reads, like elements of an array one by one.
// Must be dropped (or invalidated) whenever the target runs.
pub struct CachedMemReader<M: TargetMemory> {
    pub mem: M,
    addr: Option<usize>,
    page: Box<[u8; PAGE_SIZE]>,
}

impl<M: TargetMemory> CachedMemReader<M> {
    pub fn new(mem: M) -> Self { Self {mem, addr: None, page: Box::new([0u8; PAGE_SIZE])} }

    pub fn invalidate(&mut self) { self.addr = None; }
}

impl<M: TargetMemory> TargetMemory for CachedMemReader<M> {
    fn read(&mut self, mut offset: usize, mut buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if buf.len() > usize::MAX - offset {
            return err!(UnmappedMemory, "bad memory range: 0x{:x} + 0x{:x}", offset, buf.len());
        }
        let last_page = (offset + buf.len() - 1) & !(PAGE_SIZE - 1);
        // Read non-last pages without populating cache.
        while offset & !(PAGE_SIZE - 1) < last_page {
            let start = offset & (PAGE_SIZE - 1);
            let len = PAGE_SIZE - start;
            if self.addr == Some(offset & !(PAGE_SIZE - 1)) {
                buf[..len].copy_from_slice(&self.page[start..start+len]);
            } else {
                self.mem.read(offset, &mut buf[..len])?;
            }
            buf = &mut buf[len..];
            offset += len;
        }
        // Read last page through cache. If the whole page isn't readable (e.g. the value is at the end of a mapping),
        // fall back to reading just the requested bytes.
        if self.addr != Some(last_page) {
            self.addr = None;
            if self.mem.read(last_page, &mut self.page[..]).is_err() {
                return self.mem.read(offset, buf);
            }
            self.addr = Some(last_page);
        }
        let start = offset & (PAGE_SIZE - 1);
        buf.copy_from_slice(&self.page[start..start + buf.len()]);
        Ok(())
    }
}
