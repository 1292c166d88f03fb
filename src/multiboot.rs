//! Multiboot v1 information structure.
//! See <https://www.gnu.org/software/grub/manual/multiboot/multiboot.html>
//! for the field definitions. The kernel consumes the memory bounds, the
//! module list (at most one module: the initrd), and the framebuffer
//! fields; everything else is carried only for layout fidelity.

use bitflags::bitflags;

use crate::boot::MULTIBOOT_BOOTLOADER_MAGIC;

bitflags! {
    /// Validity bits in [`BootInfo::flags`].
    #[derive(Debug, Clone, Copy)]
    pub struct BootFlags: u32 {
        /// `mem_lower`/`mem_upper` are valid.
        const MEMORY = 1 << 0;
        /// `mods_count`/`mods_addr` are valid.
        const MODULES = 1 << 3;
        /// The `framebuffer_*` fields are valid.
        const FRAMEBUFFER = 1 << 12;
    }
}

/// The information structure the bootloader leaves in low memory.
// Most fields exist only to keep the layout faithful to the handoff.
#[allow(dead_code)]
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct BootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
    boot_device: u32,
    cmdline: u32,
    mods_count: u32,
    mods_addr: u32,
    syms: [u32; 4],
    mmap_length: u32,
    mmap_addr: u32,
    drives_length: u32,
    drives_addr: u32,
    config_table: u32,
    boot_loader_name: u32,
    apm_table: u32,
    vbe_control_info: u32,
    vbe_mode_info: u32,
    vbe_mode: u16,
    vbe_interface_seg: u16,
    vbe_interface_off: u16,
    vbe_interface_len: u16,
    framebuffer_addr: u64,
    framebuffer_pitch: u32,
    framebuffer_width: u32,
    framebuffer_height: u32,
    framebuffer_bpp: u8,
    framebuffer_type: u8,
}

const _: () = assert!(
    core::mem::size_of::<BootInfo>() == 110,
    "BootInfo layout drifted from the multiboot v1 specification"
);

/// One entry of the bootloader's module list.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct ModuleInfo {
    mod_start: u32,
    mod_end: u32,
    cmdline: u32,
    padding: u32,
}

const _: () = assert!(core::mem::size_of::<ModuleInfo>() == 16);

impl ModuleInfo {
    /// Physical address range `[start, end)` of the module bytes.
    #[must_use]
    pub fn range(&self) -> (u32, u32) {
        (self.mod_start, self.mod_end)
    }

    /// Size of the module in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        (self.mod_end - self.mod_start) as usize
    }
}

impl BootInfo {
    /// Copy the info structure out of low memory and sanity-check it.
    ///
    /// Must be called before paging is enabled, while the bootloader's
    /// data in the first physical page is still reachable.
    ///
    /// # Panics
    /// If `magic` is not the multiboot handoff value or the structure
    /// fails validation.
    ///
    /// # Safety
    /// `info` must point to the structure the bootloader handed over.
    #[must_use]
    pub unsafe fn read(magic: u32, info: *const Self) -> Self {
        assert_eq!(
            magic, MULTIBOOT_BOOTLOADER_MAGIC,
            "not booted by a multiboot-compliant loader"
        );
        assert!(!info.is_null(), "bootloader passed a null info pointer");

        let copied = *info;
        copied.verify();
        copied
    }

    fn verify(&self) {
        assert!(
            self.flags().contains(BootFlags::MEMORY),
            "bootloader did not report memory bounds"
        );

        if self.flags().contains(BootFlags::FRAMEBUFFER) {
            let addr = self.framebuffer_addr;
            assert!(
                addr <= u64::from(u32::MAX),
                "framebuffer address cannot fit in 32 bits"
            );
        }
    }

    /// Validity bits of this structure.
    #[must_use]
    pub fn flags(&self) -> BootFlags {
        BootFlags::from_bits_truncate(self.flags)
    }

    /// Kilobytes of memory above 1 MiB.
    #[must_use]
    pub fn mem_upper_kb(&self) -> u32 {
        self.mem_upper
    }

    /// Number of modules the bootloader loaded.
    #[must_use]
    pub fn module_count(&self) -> usize {
        if self.flags().contains(BootFlags::MODULES) {
            self.mods_count as usize
        } else {
            0
        }
    }

    /// Physical range of the first module (the initrd), if any.
    ///
    /// The returned addresses are only dereferencable before paging is
    /// enabled or under a temporary identity mapping of low memory.
    #[must_use]
    pub fn first_module(&self) -> Option<ModuleInfo> {
        if self.module_count() == 0 {
            return None;
        }

        // SAFETY:
        // The MODULES flag guarantees mods_addr points at mods_count
        // ModuleInfo records; we only read the first.
        let module = unsafe { *(self.mods_addr as *const ModuleInfo) };
        Some(module)
    }

    /// Log the fields the kernel cares about.
    pub fn log_summary(&self) {
        let flags = self.flags;
        let mem_lower = self.mem_lower;
        let mem_upper = self.mem_upper;
        let mods_count = self.mods_count;
        let fb_type = self.framebuffer_type;
        log::debug!("multiboot flags: {flags:#x}");
        log::debug!("lower memory: {mem_lower} kB, upper memory: {mem_upper} kB");
        log::debug!("mods_count: {mods_count}");
        log::debug!("framebuffer type: {fb_type:#x}");
    }
}
