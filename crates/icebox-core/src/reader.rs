use std::cell::Cell;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::{
    arch::{self, PagingMode},
    Channel, Dtb, Pa, Va, Vm, VmError,
};

#[derive(Clone, Copy)]
struct TlbSlot {
    va_page: Va,
    pa_page: Pa,
    generation: u64,
}

/// A virtual-memory reader bound to one guest address space.
///
/// A reader pairs a [`Vm`] with a directory table and a paging mode; every
/// read walks the page tables (through the shared translation cache) and
/// assembles the result across page boundaries. A read touching an unmapped
/// page fails with a translation error naming the faulting address.
///
/// The reader keeps a one-slot TLB for the last translated page to amortize
/// linear scans. Readers are only meaningful within a single paused window;
/// the slot self-invalidates when the guest resumes.
pub struct Reader<'a, C>
where
    C: Channel,
{
    vm: &'a Vm<C>,
    dtb: Dtb,
    mode: PagingMode,
    width: usize,
    tlb: Cell<Option<TlbSlot>>,
}

impl<'a, C> Reader<'a, C>
where
    C: Channel,
{
    /// Creates a reader over the address space rooted at `dtb`.
    pub fn new(vm: &'a Vm<C>, dtb: Dtb, mode: PagingMode) -> Self {
        Self {
            vm,
            dtb,
            mode,
            width: mode.address_width(),
            tlb: Cell::new(None),
        }
    }

    /// Overrides the pointer width used by [`read_ptr`].
    ///
    /// A 32-bit process on a 64-bit kernel reads 4-byte pointers even though
    /// the paging mode is long mode.
    ///
    /// [`read_ptr`]: Self::read_ptr
    pub fn with_address_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Returns the directory table this reader walks from.
    pub fn dtb(&self) -> Dtb {
        self.dtb
    }

    /// Returns the pointer width of this address space in bytes.
    pub fn address_width(&self) -> usize {
        self.width
    }

    /// Translates a virtual address to a physical address.
    pub fn translate(&self, va: Va) -> Result<Pa, VmError> {
        let va_page = arch::va_align_down(va);
        let offset = arch::va_offset(va);
        let generation = self.vm.translation_generation();

        if let Some(slot) = self.tlb.get()
            && slot.generation == generation
            && slot.va_page == va_page
        {
            return Ok(slot.pa_page + offset);
        }

        let pa = self.vm.translate(va, self.dtb, self.mode)?;

        self.tlb.set(Some(TlbSlot {
            va_page,
            pa_page: pa & arch::PAGE_MASK,
            generation,
        }));

        Ok(pa)
    }

    /// Reads virtual memory, assembling the result across page boundaries.
    pub fn read(&self, va: Va, buffer: &mut [u8]) -> Result<(), VmError> {
        let mut position = 0usize;
        let mut remaining = buffer.len();

        while remaining > 0 {
            let address = va + position as u64;
            let pa = self.translate(address)?;

            let in_page = (arch::PAGE_SIZE - arch::pa_offset(pa)) as usize;
            let size = std::cmp::min(remaining, in_page);

            self.vm
                .read_physical(pa, &mut buffer[position..position + size])?;

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Writes virtual memory, splitting the buffer across page boundaries.
    pub fn write(&self, va: Va, buffer: &[u8]) -> Result<(), VmError> {
        let mut position = 0usize;
        let mut remaining = buffer.len();

        while remaining > 0 {
            let address = va + position as u64;
            let pa = self.translate(address)?;

            let in_page = (arch::PAGE_SIZE - arch::pa_offset(pa)) as usize;
            let size = std::cmp::min(remaining, in_page);

            self.vm
                .write_physical(pa, &buffer[position..position + size])?;

            position += size;
            remaining -= size;
        }

        Ok(())
    }

    /// Reads a single byte.
    pub fn read_u8(&self, va: Va) -> Result<u8, VmError> {
        let mut buffer = [0u8; 1];
        self.read(va, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Reads a 16-bit unsigned integer (little-endian).
    pub fn read_u16(&self, va: Va) -> Result<u16, VmError> {
        let mut buffer = [0u8; 2];
        self.read(va, &mut buffer)?;
        Ok(u16::from_le_bytes(buffer))
    }

    /// Reads a 32-bit unsigned integer (little-endian).
    pub fn read_u32(&self, va: Va) -> Result<u32, VmError> {
        let mut buffer = [0u8; 4];
        self.read(va, &mut buffer)?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a 64-bit unsigned integer (little-endian).
    pub fn read_u64(&self, va: Va) -> Result<u64, VmError> {
        let mut buffer = [0u8; 8];
        self.read(va, &mut buffer)?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads an unsigned integer of the given size (1, 2, 4 or 8 bytes).
    pub fn read_uint(&self, va: Va, size: usize) -> Result<u64, VmError> {
        match size {
            1 => self.read_u8(va).map(u64::from),
            2 => self.read_u16(va).map(u64::from),
            4 => self.read_u32(va).map(u64::from),
            8 => self.read_u64(va),
            _ => Err(VmError::InvalidAddressWidth),
        }
    }

    /// Reads a guest pointer, using this address space's pointer width.
    pub fn read_ptr(&self, va: Va) -> Result<Va, VmError> {
        Ok(Va(self.read_uint(va, self.width)?))
    }

    /// Reads a null-terminated UTF-16 string, bounded by `max_chars`.
    pub fn read_utf16(&self, va: Va, max_chars: usize) -> Result<String, VmError> {
        let mut units = Vec::new();

        while units.len() < max_chars {
            let unit = self.read_u16(va + (units.len() * 2) as u64)?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }

        Ok(String::from_utf16_lossy(&units))
    }

    /// Reads a null-terminated byte string, bounded by `max_len`.
    pub fn read_cstring(&self, va: Va, max_len: usize) -> Result<String, VmError> {
        let mut bytes = Vec::new();

        while bytes.len() < max_len {
            let byte = self.read_u8(va + bytes.len() as u64)?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }

        Ok(String::from_utf8_lossy(&bytes).into())
    }

    /// Reads a plain-data struct.
    pub fn read_struct<T>(&self, va: Va) -> Result<T, VmError>
    where
        T: FromBytes + IntoBytes,
    {
        let mut result = T::new_zeroed();
        self.read(va, result.as_mut_bytes())?;
        Ok(result)
    }

    /// Writes a plain-data struct.
    pub fn write_struct<T>(&self, va: Va, value: T) -> Result<(), VmError>
    where
        T: IntoBytes + Immutable,
    {
        self.write(va, value.as_bytes())
    }

    /// Writes a 64-bit unsigned integer (little-endian).
    pub fn write_u64(&self, va: Va, value: u64) -> Result<(), VmError> {
        self.write(va, &value.to_le_bytes())
    }

    /// Writes a 32-bit unsigned integer (little-endian).
    pub fn write_u32(&self, va: Va, value: u32) -> Result<(), VmError> {
        self.write(va, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{testkit::MockChannel, Gfn};

    fn vm_with_mapping() -> (Vm<MockChannel>, Dtb) {
        let channel = MockChannel::new();
        let dtb = channel.new_dtb();
        (Vm::new(channel), dtb)
    }

    #[test]
    fn read_assembles_across_page_boundaries() {
        let (vm, dtb) = vm_with_mapping();
        let first = Gfn(0x100);
        let second = Gfn(0x200);

        vm.channel().map_page(dtb, Va(0x1000), first);
        vm.channel().map_page(dtb, Va(0x2000), second);

        vm.channel().write_bytes(arch::pa_from_gfn(first) + 0xffc, &[1, 2, 3, 4]);
        vm.channel().write_bytes(arch::pa_from_gfn(second), &[5, 6, 7, 8]);

        let reader = Reader::new(&vm, dtb, PagingMode::Ia32e);
        let mut buffer = [0u8; 8];
        reader.read(Va(0x1ffc), &mut buffer).unwrap();

        assert_eq!(buffer, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn read_equals_per_byte_physical_reads() {
        let (vm, dtb) = vm_with_mapping();
        let gfn = Gfn(0x100);
        vm.channel().map_page(dtb, Va(0x1000), gfn);
        vm.channel()
            .write_bytes(arch::pa_from_gfn(gfn), &[0xaa, 0xbb, 0xcc, 0xdd]);

        let reader = Reader::new(&vm, dtb, PagingMode::Ia32e);

        for i in 0..4u64 {
            let pa = reader.translate(Va(0x1000 + i)).unwrap();
            let mut byte = [0u8; 1];
            vm.read_physical(pa, &mut byte).unwrap();
            assert_eq!(reader.read_u8(Va(0x1000 + i)).unwrap(), byte[0]);
        }
    }

    #[test]
    fn read_through_an_unmapped_page_fails_with_the_address() {
        let (vm, dtb) = vm_with_mapping();
        vm.channel().map_page(dtb, Va(0x1000), Gfn(0x100));

        let reader = Reader::new(&vm, dtb, PagingMode::Ia32e);
        let mut buffer = [0u8; 16];

        match reader.read(Va(0x1ff8), &mut buffer).unwrap_err() {
            VmError::Translation(pfs) => assert_eq!(pfs[0].address, Va(0x2000)),
            other => panic!("expected a translation error, got {other:?}"),
        }
    }

    #[test]
    fn utf16_read_stops_at_the_terminator() {
        let (vm, dtb) = vm_with_mapping();
        let gfn = Gfn(0x100);
        vm.channel().map_page(dtb, Va(0x1000), gfn);

        let mut bytes = Vec::new();
        for unit in "notepad.exe".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&[0, 0, b'x', 0]);
        vm.channel().write_bytes(arch::pa_from_gfn(gfn), &bytes);

        let reader = Reader::new(&vm, dtb, PagingMode::Ia32e);
        assert_eq!(reader.read_utf16(Va(0x1000), 260).unwrap(), "notepad.exe");
        // The bound also terminates unterminated strings.
        assert_eq!(reader.read_utf16(Va(0x1000), 3).unwrap(), "not");
    }

    #[test]
    fn pointer_width_follows_the_address_space() {
        let (vm, dtb) = vm_with_mapping();
        let gfn = Gfn(0x100);
        vm.channel().map_page(dtb, Va(0x1000), gfn);
        vm.channel()
            .write_bytes(arch::pa_from_gfn(gfn), &0x1122_3344_5566_7788u64.to_le_bytes());

        let reader = Reader::new(&vm, dtb, PagingMode::Ia32e);
        assert_eq!(reader.read_ptr(Va(0x1000)).unwrap(), Va(0x1122_3344_5566_7788));

        let narrow = Reader::new(&vm, dtb, PagingMode::Ia32e).with_address_width(4);
        assert_eq!(narrow.read_ptr(Va(0x1000)).unwrap(), Va(0x5566_7788));
    }

    #[test]
    fn cached_translations_drop_on_flush() {
        let (vm, dtb) = vm_with_mapping();
        let before = Gfn(0x100);
        let after = Gfn(0x200);

        vm.channel().map_page(dtb, Va(0x1000), before);
        vm.channel().write_bytes(arch::pa_from_gfn(before), &[1]);
        vm.channel().write_bytes(arch::pa_from_gfn(after), &[2]);

        let reader = Reader::new(&vm, dtb, PagingMode::Ia32e);
        assert_eq!(reader.read_u8(Va(0x1000)).unwrap(), 1);

        // The guest remaps the page; a stale translation must not survive a
        // resume boundary.
        vm.channel().unmap_page(dtb, Va(0x1000));
        vm.channel().map_page(dtb, Va(0x1000), after);

        assert_eq!(reader.read_u8(Va(0x1000)).unwrap(), 1);

        vm.flush_translation_cache();
        assert_eq!(reader.read_u8(Va(0x1000)).unwrap(), 2);
    }
}
