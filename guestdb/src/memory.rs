//! Bounds-checked access to a guest's linear memory.

use wasmtime::{Memory, Store};

use crate::error::{Error, Result};
use crate::runtime::GuestState;

/// Converts a guest pointer argument or result to an unsigned address.
#[allow(clippy::cast_sign_loss)]
pub(crate) const fn from_ptr(ptr: i32) -> u32 {
    ptr as u32
}

/// Converts an unsigned address to the `i32` the wasm32 ABI passes.
#[allow(clippy::cast_possible_wrap)]
pub(crate) const fn to_ptr(addr: u32) -> i32 {
    addr as i32
}

/// View of one instance's exported memory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GuestMemory(Memory);

impl GuestMemory {
    pub const fn new(memory: Memory) -> Self {
        Self(memory)
    }

    /// Borrows `len` bytes at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the range is not inside the memory. A guest handing out such
    /// a range does not follow the ABI the bridge was built against.
    pub fn read<'a>(&self, store: &'a Store<GuestState>, addr: u32, len: usize) -> &'a [u8] {
        let data = self.0.data(store);
        let start = addr as usize;
        match start.checked_add(len).filter(|&end| end <= data.len()) {
            Some(end) => &data[start..end],
            None => panic!(
                "guest memory read out of range: {addr:#x}+{len} exceeds {} bytes",
                data.len()
            ),
        }
    }

    /// Reads a NUL-terminated string starting at `addr`, without the NUL.
    pub fn read_cstring(&self, store: &Store<GuestState>, addr: u32) -> Result<String> {
        let data = self.0.data(store);
        let tail = data.get(addr as usize..).ok_or(Error::NoNul)?;
        let len = tail.iter().position(|&b| b == 0).ok_or(Error::NoNul)?;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    /// Reads a little-endian `u32` at `addr`.
    pub fn read_u32(&self, store: &Store<GuestState>, addr: u32) -> u32 {
        let bytes = self.read(store, addr, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Copies `bytes` to `addr`.
    pub fn write(&self, store: &mut Store<GuestState>, addr: u32, bytes: &[u8]) -> Result<()> {
        self.0
            .write(store, addr as usize, bytes)
            .map_err(|_| Error::assertion())
    }
}
