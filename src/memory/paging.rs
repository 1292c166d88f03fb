//! Page directories over 4 MiB pages.
//!
//! One kernel page directory identity-maps the kernel image and the
//! PD-region; per-task directories are clones of it, allocated from fixed
//! 4 KiB slots inside the PD-region. Because that region is itself
//! identity-mapped in every directory, any address space can observe and
//! edit any other directory, which is what makes kernel-range propagation
//! and CR3 switching (physical base == virtual base) work.
//!
//! Every mutation runs with interrupts disabled; the structures here are
//! process-wide singletons on a single CPU.

use core::cell::UnsafeCell;

use bitflags::bitflags;
use spin::Mutex;

use super::frame::{frame_map, FrameMapError};
use super::{
    is_kernel_code, is_kernel_heap, is_kernel_range, is_page_aligned, is_user, page_addr,
    page_index, KERNEL_START, NUM_FRAMES, PAGE_DIR_REGION_END, PAGE_DIR_REGION_START, PAGE_MASK_4M,
};
use crate::interrupts::{
    self, register_interrupt_handler, without_interrupts, Registers, PAGE_FAULT_VECTOR,
};

/// Size of one page directory; also its required alignment.
pub const PAGE_DIR_SIZE: usize = 4096;

/// Number of directory slots in the PD-region.
pub const NUM_PAGE_DIRS: usize =
    (PAGE_DIR_REGION_END - PAGE_DIR_REGION_START) as usize / PAGE_DIR_SIZE;

/// Frames covering the first 128 MiB, permanently reserved at boot.
pub const RESERVED_LOW_FRAMES: usize = 32;

bitflags! {
    /// PDE flag bits. `PRESENT | WRITABLE | HUGE` is OR-ed into every
    /// mapping; callers only choose `USER`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// The entry maps a page.
        const PRESENT = 1 << 0;
        /// The page is writable.
        const WRITABLE = 1 << 1;
        /// The page is accessible from ring 3.
        const USER = 1 << 2;
        /// The entry maps a 4 MiB page (requires PSE).
        const HUGE = 1 << 7;
    }
}

bitflags! {
    /// Page-fault error code bits as pushed by the CPU.
    #[derive(Debug, Clone, Copy)]
    pub struct PageFaultErrorCode: u32 {
        /// Fault caused by a protection violation (page was present).
        const PRESENT = 1 << 0;
        /// Fault caused by a write access.
        const WRITE = 1 << 1;
        /// CPU was in user mode.
        const USER = 1 << 2;
        /// A reserved PDE bit was set.
        const RESERVED = 1 << 3;
        /// Fault caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Contract violations and exhaustion conditions of the paging layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// A virtual or physical address was not 4 MiB aligned.
    Unaligned,
    /// The PDE for the virtual address is already present.
    AlreadyMapped,
    /// The PDE for the virtual address is absent.
    NotMapped,
    /// The physical frame already has a mapping and reuse was not allowed.
    DoublePhysical,
    /// No physical frame with a zero refcount is left.
    NoFreeFrame,
    /// Every slot in the PD-region is occupied.
    PdRegionFull,
}

impl From<FrameMapError> for PagingError {
    fn from(err: FrameMapError) -> Self {
        match err {
            FrameMapError::OutOfMemory => Self::NoFreeFrame,
            FrameMapError::UnderflowFree => Self::NotMapped,
        }
    }
}

/// A 1024-entry page directory backing one virtual address space.
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [u32; 1024],
}

const _: () = assert!(core::mem::size_of::<PageDirectory>() == PAGE_DIR_SIZE);

struct KernelPdCell(UnsafeCell<PageDirectory>);

// SAFETY:
// Accessed only on a single CPU with interrupts disabled around mutation.
unsafe impl Sync for KernelPdCell {}

static KERNEL_PD: KernelPdCell = KernelPdCell(UnsafeCell::new(PageDirectory::zeroed()));

/// The kernel page directory.
///
/// Single-CPU kernel: exclusive access is guaranteed by interrupt gating,
/// not the borrow checker, so callers must not hold the reference across
/// a point where interrupts get re-enabled.
pub fn kernel_page_directory() -> &'static mut PageDirectory {
    // SAFETY:
    // See the function contract above.
    unsafe { &mut *KERNEL_PD.0.get() }
}

/// Occupancy bitmap for the PD-region slots.
struct PdRegionBitmap {
    bits: [u8; NUM_PAGE_DIRS / 8],
}

impl PdRegionBitmap {
    const fn new() -> Self {
        Self {
            bits: [0; NUM_PAGE_DIRS / 8],
        }
    }

    fn clear(&mut self) {
        self.bits = [0; NUM_PAGE_DIRS / 8];
    }

    fn is_live(&self, slot: usize) -> bool {
        self.bits[slot / 8] & (1 << (slot % 8)) != 0
    }

    fn allocate(&mut self) -> Option<usize> {
        let slot = (0..NUM_PAGE_DIRS).find(|&slot| !self.is_live(slot))?;
        self.bits[slot / 8] |= 1 << (slot % 8);
        Some(slot)
    }

    fn release(&mut self, pd_addr: u32) {
        let offset = pd_addr - PAGE_DIR_REGION_START;
        assert!(
            offset as usize % PAGE_DIR_SIZE == 0,
            "page directory address not slot-aligned"
        );
        let slot = offset as usize / PAGE_DIR_SIZE;
        assert!(self.is_live(slot), "releasing a free PD-region slot");
        self.bits[slot / 8] &= !(1 << (slot % 8));
    }
}

static PD_REGION: Mutex<PdRegionBitmap> = Mutex::new(PdRegionBitmap::new());

/// Pointer to the directory stored in PD-region slot `slot`.
fn slot_pd(slot: usize) -> *mut PageDirectory {
    (PAGE_DIR_REGION_START as usize + slot * PAGE_DIR_SIZE) as *mut PageDirectory
}

/// Run `f` on every live directory in the PD-region.
fn for_each_live_pd(region: &PdRegionBitmap, mut f: impl FnMut(&mut PageDirectory)) {
    for slot in 0..NUM_PAGE_DIRS {
        if region.is_live(slot) {
            // SAFETY:
            // Live slots hold initialized directories; the region is
            // identity-mapped in the current address space.
            f(unsafe { &mut *slot_pd(slot) });
        }
    }
}

impl PageDirectory {
    const fn zeroed() -> Self {
        Self { entries: [0; 1024] }
    }

    /// Drop every entry. Only used during paging bring-up.
    pub fn clear(&mut self) {
        self.entries = [0; 1024];
    }

    /// Whether this is the kernel page directory.
    #[must_use]
    pub fn is_kernel_pd(&self) -> bool {
        core::ptr::eq(self, KERNEL_PD.0.get())
    }

    /// Physical base of this directory, loadable into CR3. Equals the
    /// virtual address because both the kernel image and the PD-region
    /// are identity-mapped.
    #[must_use]
    pub fn physical_base(&self) -> u32 {
        core::ptr::from_ref(self) as u32
    }

    /// Map the 4 MiB page at `vaddr` to the frame at `paddr`.
    ///
    /// `flags` is OR-ed with `PRESENT | WRITABLE | HUGE`. With
    /// `allow_reuse` the physical frame may already be mapped elsewhere
    /// (its refcount grows either way). Kernel-range mappings added to
    /// the kernel directory propagate to every live directory.
    ///
    /// # Errors
    /// [`PagingError::Unaligned`], [`PagingError::AlreadyMapped`] or
    /// [`PagingError::DoublePhysical`].
    pub fn add_page(
        &mut self,
        vaddr: u32,
        paddr: u32,
        flags: PageFlags,
        allow_reuse: bool,
    ) -> Result<(), PagingError> {
        without_interrupts(|| {
            if !is_page_aligned(vaddr) || !is_page_aligned(paddr) {
                return Err(PagingError::Unaligned);
            }

            let frame = page_index(paddr);
            let mut map = frame_map().lock();

            if !allow_reuse && map.is_used(frame) {
                return Err(PagingError::DoublePhysical);
            }

            let index = page_index(vaddr);
            if self.entries[index] & PageFlags::PRESENT.bits() != 0 {
                return Err(PagingError::AlreadyMapped);
            }

            let pde = (paddr & PAGE_MASK_4M)
                | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE | flags).bits();
            self.entries[index] = pde;
            map.mark_used(frame);
            invlpg(vaddr);

            if self.is_kernel_pd() && is_kernel_range(vaddr) {
                // Keep kernel mappings identical across every address
                // space, each clone holding its own frame reference.
                let region = PD_REGION.lock();
                for_each_live_pd(&region, |pd| {
                    assert!(
                        pd.entries[index] & PageFlags::PRESENT.bits() == 0,
                        "a task directory already maps a kernel-range page"
                    );
                    pd.entries[index] = pde;
                    map.mark_used(frame);
                });
            }

            Ok(())
        })
    }

    /// Undo [`Self::add_page`] for the present entry at `vaddr`,
    /// releasing one frame reference. Kernel-range removals on the kernel
    /// directory propagate to every live directory.
    ///
    /// # Errors
    /// [`PagingError::Unaligned`] or [`PagingError::NotMapped`].
    pub fn remove_page(&mut self, vaddr: u32) -> Result<(), PagingError> {
        without_interrupts(|| {
            if !is_page_aligned(vaddr) {
                return Err(PagingError::Unaligned);
            }

            let index = page_index(vaddr);
            let pde = self.entries[index];
            if pde & PageFlags::PRESENT.bits() == 0 {
                return Err(PagingError::NotMapped);
            }

            self.entries[index] = 0;
            invlpg(vaddr);

            let frame = page_index(pde & PAGE_MASK_4M);
            let mut map = frame_map().lock();
            map.mark_free(frame)
                .unwrap_or_else(|_| panic!("unmapping {vaddr:#x}: frame had no references"));

            if self.is_kernel_pd() && is_kernel_range(vaddr) {
                let region = PD_REGION.lock();
                for_each_live_pd(&region, |pd| {
                    assert!(
                        pd.entries[index] & PageFlags::PRESENT.bits() != 0,
                        "a task directory lost a shared kernel-range page"
                    );
                    pd.entries[index] = 0;
                    map.mark_free(frame).unwrap_or_else(|_| {
                        panic!("propagated unmap {vaddr:#x}: frame had no references")
                    });
                });
            }

            Ok(())
        })
    }

    /// Physical frame address the page at `vaddr` maps to.
    ///
    /// # Errors
    /// [`PagingError::Unaligned`] or [`PagingError::NotMapped`].
    pub fn get_physical(&self, vaddr: u32) -> Result<u32, PagingError> {
        if !is_page_aligned(vaddr) {
            return Err(PagingError::Unaligned);
        }

        let pde = self.entries[page_index(vaddr)];
        if pde & PageFlags::PRESENT.bits() == 0 {
            return Err(PagingError::NotMapped);
        }
        Ok(pde & PAGE_MASK_4M)
    }

    /// Whether the page containing `vaddr` is mapped.
    #[must_use]
    pub fn is_virtual_mapped(&self, vaddr: u32) -> bool {
        self.entries[page_index(vaddr)] & PageFlags::PRESENT.bits() != 0
    }

    /// Whether the frame at `frame_index` is unreferenced.
    #[must_use]
    pub fn is_physical_free(frame_index: usize) -> bool {
        without_interrupts(|| !frame_map().lock().is_used(frame_index))
    }

    /// Copy this directory into a fresh PD-region slot, taking one extra
    /// frame reference for every present entry.
    ///
    /// The returned directory lives until [`Self::reclaim`].
    ///
    /// # Errors
    /// [`PagingError::PdRegionFull`] when no slot is free.
    pub fn clone_into_region(&self) -> Result<&'static mut PageDirectory, PagingError> {
        without_interrupts(|| {
            let slot = PD_REGION
                .lock()
                .allocate()
                .ok_or(PagingError::PdRegionFull)?;

            // SAFETY:
            // The slot was just allocated, is 4 KiB aligned by region
            // layout, and the region is identity-mapped everywhere.
            let pd = unsafe {
                let pd = slot_pd(slot);
                (*pd).entries = self.entries;
                &mut *pd
            };

            let mut map = frame_map().lock();
            for pde in pd.entries.iter().filter(|pde| **pde & 1 != 0) {
                map.mark_used(page_index(pde & PAGE_MASK_4M));
            }

            Ok(pd)
        })
    }

    /// Release one frame reference per present entry, then free this
    /// directory's PD-region slot. The directory must not be used again.
    pub fn reclaim(&mut self) {
        without_interrupts(|| {
            assert!(
                !self.is_kernel_pd(),
                "the kernel page directory is never reclaimed"
            );

            let mut map = frame_map().lock();
            for pde in self.entries.iter().filter(|pde| **pde & 1 != 0) {
                map.mark_free(page_index(pde & PAGE_MASK_4M))
                    .unwrap_or_else(|_| panic!("reclaim: frame had no references"));
            }
            drop(map);

            self.entries = [0; 1024];
            PD_REGION.lock().release(self.physical_base());
        });
    }

    /// First unmapped 4 MiB page in the user range, if any.
    #[must_use]
    pub fn next_free_virtual_user(&self) -> Option<u32> {
        (page_index(super::USER_START)..NUM_FRAMES)
            .find(|&index| self.entries[index] & PageFlags::PRESENT.bits() == 0)
            .map(page_addr)
    }
}

/// Invalidate the TLB entry for the page containing `vaddr`.
fn invlpg(vaddr: u32) {
    // SAFETY:
    // invlpg only drops a TLB entry; harmless even before paging is on.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
    }
}

/// Load `pd` into CR3, switching the active address space.
pub fn switch_page_directory(pd: &PageDirectory) {
    // SAFETY:
    // Every directory keeps the kernel ranges mapped, so the kernel keeps
    // executing across the switch.
    unsafe {
        core::arch::asm!(
            "mov cr3, {}",
            in(reg) pd.physical_base(),
            options(nostack, preserves_flags)
        );
    }
}

/// Turn paging on: install the page-fault handler, reserve low RAM, cap
/// the map at the end of physical RAM, identity-map the kernel image and
/// the PD-region, load CR3, and enable PSE + PG.
pub fn init(mem_upper_kb: u32) {
    register_interrupt_handler(PAGE_FAULT_VECTOR, page_fault_handler);

    let total_mem = u64::from(mem_upper_kb) * 1024;
    let total_frames = (total_mem / super::PAGE_SIZE_4M as u64 + 1) as usize;
    log::debug!("total 4 MiB frame count: {total_frames}");
    assert!(
        total_frames >= RESERVED_LOW_FRAMES,
        "expected at least 128 MiB of memory"
    );

    interrupts::without_interrupts(|| {
        let mut map = frame_map().lock();
        map.clear();
        map.reserve(RESERVED_LOW_FRAMES);
        if total_frames < NUM_FRAMES {
            map.cap_physical(total_frames);
        }
        drop(map);

        let kernel_pd = kernel_page_directory();
        kernel_pd.clear();
        PD_REGION.lock().clear();

        // The identity maps target frames inside the permanent low
        // reservation, hence allow_reuse.
        kernel_pd
            .add_page(KERNEL_START, KERNEL_START, PageFlags::empty(), true)
            .unwrap_or_else(|err| panic!("mapping the kernel image failed: {err:?}"));
        kernel_pd
            .add_page(
                PAGE_DIR_REGION_START,
                PAGE_DIR_REGION_START,
                PageFlags::empty(),
                true,
            )
            .unwrap_or_else(|err| panic!("mapping the PD-region failed: {err:?}"));

        // The VGA text buffer (0xb8000) sits in the first page; the
        // terminal needs it for the kernel lifetime. Not a kernel-range
        // page, so clones inherit it from the copy, not via propagation.
        kernel_pd
            .add_page(0, 0, PageFlags::empty(), true)
            .unwrap_or_else(|err| panic!("mapping the video page failed: {err:?}"));

        switch_page_directory(kernel_pd);

        // SAFETY:
        // CR3 now points at a directory mapping the code being executed.
        // PSE must be set before PG for 4 MiB entries to be legal.
        unsafe {
            core::arch::asm!(
                "mov eax, cr4",
                "or eax, 0x10",
                "mov cr4, eax",
                "mov eax, cr0",
                "or eax, 0x80000000",
                "mov cr0, eax",
                out("eax") _,
                options(nostack)
            );
        }
    });
}

/// Fatal page-fault handler: classify, dump, halt. There is no demand
/// paging in this kernel, so any fault is a bug or a misbehaving task.
fn page_fault_handler(regs: &mut Registers) {
    interrupts::disable_interrupts();

    let faulting_addr: u32;
    // SAFETY:
    // CR2 holds the faulting linear address after a page fault.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) faulting_addr, options(nomem, nostack));
    }

    let code = PageFaultErrorCode::from_bits_truncate(regs.err_code);
    let action = if code.contains(PageFaultErrorCode::WRITE) {
        "write to"
    } else {
        "read from"
    };
    log::error!(
        "page fault: {action} {faulting_addr:#010x} at eip {:#010x}",
        regs.eip
    );
    log::error!(
        "- the page was {}",
        if code.contains(PageFaultErrorCode::PRESENT) {
            "present"
        } else {
            "not present"
        }
    );
    if code.contains(PageFaultErrorCode::RESERVED) {
        log::error!("- reserved bit was set");
    }
    if code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
        log::error!("- caused by an instruction fetch");
    }
    log::error!(
        "- CPU was in {}",
        if code.contains(PageFaultErrorCode::USER) {
            "user mode"
        } else {
            "supervisor mode"
        }
    );

    if is_kernel_code(faulting_addr) {
        log::error!("- accessing the kernel image mapping");
    }
    if super::is_page_dir_region(faulting_addr) {
        log::error!("- accessing the page-directory region");
    }
    if is_kernel_heap(faulting_addr) {
        log::error!("- accessing the kernel heap");
    }
    if is_user(faulting_addr) {
        log::error!("- accessing user memory");
    }

    interrupts::dump_registers(regs);

    crate::hlt_loop()
}

/// Scoped identity mapping in the kernel page directory.
///
/// The mapping is added on construction and removed when the guard goes
/// out of scope, on every exit path.
pub struct IdentityMapping {
    page: usize,
}

impl IdentityMapping {
    /// Identity-map the page containing `addr` with `flags`.
    ///
    /// # Errors
    /// Any error of [`PageDirectory::add_page`].
    pub fn new(addr: u32, flags: PageFlags) -> Result<Self, PagingError> {
        Self::map(addr, flags, false)
    }

    /// Like [`Self::new`], but permits a frame that is already mapped or
    /// reserved elsewhere (e.g. the multiboot data in frame 0).
    ///
    /// # Errors
    /// Any error of [`PageDirectory::add_page`].
    pub fn reusing(addr: u32, flags: PageFlags) -> Result<Self, PagingError> {
        Self::map(addr, flags, true)
    }

    fn map(addr: u32, flags: PageFlags, allow_reuse: bool) -> Result<Self, PagingError> {
        let base = addr & PAGE_MASK_4M;
        kernel_page_directory().add_page(base, base, flags, allow_reuse)?;
        Ok(Self {
            page: page_index(base),
        })
    }
}

impl Drop for IdentityMapping {
    fn drop(&mut self) {
        kernel_page_directory()
            .remove_page(page_addr(self.page))
            .unwrap_or_else(|err| panic!("removing identity mapping failed: {err:?}"));
    }
}
