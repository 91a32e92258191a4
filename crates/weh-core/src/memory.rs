//! Bounds-checked access to guest linear memory.
//!
//! A [`MemoryView`] borrows the engine's memory bytes for the duration of one
//! host call. Every access is checked against the length of that borrow, so
//! growth between calls is always observed. Out-of-range accesses become
//! [`GuestTrap::OutOfBounds`] and are never clipped.

use weh_common::GuestTrap;

/// A window over one instance's linear memory.
#[derive(Debug)]
pub struct MemoryView<'a> {
    data: &'a mut [u8],
}

impl<'a> MemoryView<'a> {
    /// Wrap the raw memory bytes of an instance.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    /// Current memory size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Validate that `len` bytes starting at `addr` are in bounds.
    ///
    /// Arithmetic is done in `u64` so `addr + len` cannot wrap.
    pub fn check(&self, addr: u32, len: u32) -> Result<(), GuestTrap> {
        self.range(addr, len).map(|_| ())
    }

    /// Validate an array of `count` elements of `elem_size` bytes at `addr`.
    pub fn check_array(&self, addr: u32, count: u32, elem_size: u32) -> Result<(), GuestTrap> {
        let len = u64::from(count) * u64::from(elem_size);
        if u64::from(addr) + len > self.data.len() as u64 {
            return Err(GuestTrap::OutOfBounds {
                addr: u64::from(addr),
                len,
                size: self.data.len(),
            });
        }
        Ok(())
    }

    fn range(&self, addr: u32, len: u32) -> Result<std::ops::Range<usize>, GuestTrap> {
        let start = u64::from(addr);
        let end = start + u64::from(len);
        if end > self.data.len() as u64 {
            return Err(GuestTrap::OutOfBounds {
                addr: start,
                len: u64::from(len),
                size: self.data.len(),
            });
        }
        // Both bounds fit in usize: end <= data.len().
        Ok(start as usize..end as usize)
    }

    /// Borrow `len` bytes at `addr`.
    pub fn slice(&self, addr: u32, len: u32) -> Result<&[u8], GuestTrap> {
        let range = self.range(addr, len)?;
        Ok(&self.data[range])
    }

    /// Borrow `len` bytes at `addr` mutably.
    pub fn slice_mut(&mut self, addr: u32, len: u32) -> Result<&mut [u8], GuestTrap> {
        let range = self.range(addr, len)?;
        Ok(&mut self.data[range])
    }

    /// Copy `len` bytes out of guest memory.
    pub fn read_bytes(&self, addr: u32, len: u32) -> Result<Vec<u8>, GuestTrap> {
        self.slice(addr, len).map(<[u8]>::to_vec)
    }

    /// Read a NUL-terminated string, replacing invalid UTF-8.
    ///
    /// A string that runs to the end of memory without a terminator traps.
    pub fn read_c_string(&self, addr: u32) -> Result<String, GuestTrap> {
        let size = self.data.len();
        let start = addr as usize;
        let tail = self.data.get(start..).ok_or(GuestTrap::OutOfBounds {
            addr: u64::from(addr),
            len: 1,
            size,
        })?;
        let len = tail.iter().position(|b| *b == 0).ok_or(GuestTrap::OutOfBounds {
            addr: u64::from(addr),
            len: tail.len() as u64 + 1,
            size,
        })?;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    /// Copy `bytes` into guest memory at `addr`.
    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), GuestTrap> {
        let len = u32::try_from(bytes.len()).map_err(|_| GuestTrap::OutOfBounds {
            addr: u64::from(addr),
            len: bytes.len() as u64,
            size: self.data.len(),
        })?;
        self.slice_mut(addr, len)?.copy_from_slice(bytes);
        Ok(())
    }

    fn read_array<const N: usize>(&self, addr: u32) -> Result<[u8; N], GuestTrap> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(addr, N as u32)?);
        Ok(out)
    }

    /// Read a byte.
    pub fn read_u8(&self, addr: u32) -> Result<u8, GuestTrap> {
        self.read_array::<1>(addr).map(|b| b[0])
    }

    /// Read a little-endian `u16`.
    pub fn read_u16(&self, addr: u32) -> Result<u16, GuestTrap> {
        self.read_array(addr).map(u16::from_le_bytes)
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&self, addr: u32) -> Result<u32, GuestTrap> {
        self.read_array(addr).map(u32::from_le_bytes)
    }

    /// Read a little-endian `u64`.
    pub fn read_u64(&self, addr: u32) -> Result<u64, GuestTrap> {
        self.read_array(addr).map(u64::from_le_bytes)
    }

    /// Write a byte.
    pub fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), GuestTrap> {
        self.write_bytes(addr, &[value])
    }

    /// Write a little-endian `u16`.
    pub fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), GuestTrap> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), GuestTrap> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Write a little-endian `u64`.
    pub fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), GuestTrap> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Write a little-endian `i32`.
    pub fn write_i32(&mut self, addr: u32, value: i32) -> Result<(), GuestTrap> {
        self.write_bytes(addr, &value.to_le_bytes())
    }
}
