//! User address spaces.
//!
//! The kernel manipulates user memory through a two-level view: a page directory whose
//! entries each cover [`DIRECTORY_SPAN`] bytes, and the page tables below it. x86-64 walks
//! four levels, so every [`AddressSpace`] also owns the two upper levels that lead the
//! hardware to its directory. Those are held as named fields rather than hidden in spare
//! directory slots; the last [`RESERVED_DIRECTORY_SLOTS`] directory entries stay unmapped.

use crate::hal::Hal;
use crate::param::NTAGS;
use crate::tlb::{TagAllocator, TagLease};
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::vec::Vec;
use bitfield::bitfield;
use bitflags::bitflags;
use core::mem::size_of;
use core::ptr::NonNull;
use spin::once::Once;

/// The size of pages used in xv64
pub const PAGE_SIZE: usize = 4096;
const ENTRIES: usize = PAGE_SIZE / size_of::<PageTableEntry>();
/// Bytes covered by one page-directory entry
pub const DIRECTORY_SPAN: usize = PAGE_SIZE * ENTRIES;
/// Top directory slots that never map user memory
pub const RESERVED_DIRECTORY_SLOTS: usize = 2;
/// One beyond the highest user virtual address
pub const USER_TOP: usize = (ENTRIES - RESERVED_DIRECTORY_SLOTS) * DIRECTORY_SPAN;
/// First root slot of the kernel half, shared by every address space
const KERNEL_HALF: usize = ENTRIES / 2;

/// Flags of entries that point at a lower level; leaves decide the real permissions.
const TABLE_FLAGS: PteFlags = PteFlags::WRITABLE.union(PteFlags::USER);
/// Flags of ordinary user data pages
pub const USER_DATA: PteFlags = PteFlags::WRITABLE.union(PteFlags::USER);

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

static DIRECT_MAP_OFFSET: Once<usize> = Once::new();
static KERNEL_ROOT: Once<PhysAddr> = Once::new();

/// Records where all of physical memory is mapped in the kernel half.
pub fn set_direct_map_offset(offset: usize) {
    DIRECT_MAP_OFFSET.call_once(|| offset);
}

fn direct_map_offset() -> usize {
    DIRECT_MAP_OFFSET.get().copied().unwrap_or(0)
}

#[must_use]
pub fn phys_to_virt(address: PhysAddr) -> *mut u8 {
    (address.0 + direct_map_offset()) as *mut u8
}

#[must_use]
pub fn virt_to_phys(pointer: *const u8) -> PhysAddr {
    PhysAddr(pointer as usize - direct_map_offset())
}

/// Records the page-table root whose upper half every address space shares.
/// Must run before the first [`AddressSpace::create_empty`].
pub fn kvm_init(root: PhysAddr) {
    KERNEL_ROOT.call_once(|| root);
}

/// The kernel's own page-table root, loaded whenever no process runs.
#[must_use]
pub fn kernel_root() -> Option<PhysAddr> {
    KERNEL_ROOT.get().copied()
}


/// Allocates `count` zeroed, page-aligned pages in one block.
pub(crate) fn alloc_pages(count: usize) -> Option<NonNull<u8>> {
    #[cfg(test)]
    if !budget::take(count) {
        return None;
    }
    let layout = Layout::from_size_align(count * PAGE_SIZE, PAGE_SIZE).ok()?;
    NonNull::new(unsafe { alloc_zeroed(layout) })
}

/// # Safety
/// `pages` must come from [`alloc_pages`] with the same `count` and must not be used again.
pub(crate) unsafe fn free_pages(pages: NonNull<u8>, count: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(count * PAGE_SIZE, PAGE_SIZE) };
    unsafe { dealloc(pages.as_ptr(), layout) };
}

fn alloc_page() -> Option<NonNull<u8>> {
    alloc_pages(1)
}

/// One page worth of entries, at any level
#[repr(C, align(4096))]
pub(crate) struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

impl PageTable {
    /// Allocates a zeroed table, `None` when memory is exhausted
    fn new() -> Option<NonNull<PageTable>> {
        alloc_page().map(NonNull::cast)
    }

    /// # Safety
    /// `table` must come from [`PageTable::new`] and no entry may still point at it.
    unsafe fn free(table: NonNull<PageTable>) {
        unsafe { free_pages(table.cast(), 1) };
    }

    fn physical(table: NonNull<PageTable>) -> PhysAddr {
        virt_to_phys(table.as_ptr().cast())
    }

    /// # Safety
    /// `address` must hold a page table.
    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn at(address: PhysAddr) -> NonNull<PageTable> {
        unsafe { NonNull::new_unchecked(phys_to_virt(address).cast::<PageTable>()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableWalkError {
    PageTableUnallocated,
    UnableToAllocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No page left for the memory or the tables that map it
    OutOfMemory,
    /// The range is not user memory of this space
    BadAddress,
}

impl From<PageTableWalkError> for VmError {
    fn from(value: PageTableWalkError) -> Self {
        match value {
            PageTableWalkError::PageTableUnallocated => Self::BadAddress,
            PageTableWalkError::UnableToAllocate => Self::OutOfMemory,
        }
    }
}

/// A user address space
pub struct AddressSpace {
    /// Hardware root. Slot 0 leads to `pdpt`, the upper half is shared with the kernel.
    pml4: NonNull<PageTable>,
    /// Slot 0 leads to `directory`
    pdpt: NonNull<PageTable>,
    /// Top of the two-level view
    directory: NonNull<PageTable>,
    /// Bytes of user memory, starting at address 0
    size: usize,
}

// The tables are owned exclusively by this value.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    /// Creates a space with no user memory whose kernel half matches [`kernel_root`].
    pub fn create_empty() -> Result<Self, VmError> {
        let directory = PageTable::new().ok_or(VmError::OutOfMemory)?;
        let Some(pdpt) = PageTable::new() else {
            unsafe { PageTable::free(directory) };
            return Err(VmError::OutOfMemory);
        };
        let Some(mut pml4) = PageTable::new() else {
            unsafe {
                PageTable::free(pdpt);
                PageTable::free(directory);
            }
            return Err(VmError::OutOfMemory);
        };

        let mut space = Self {
            pml4,
            pdpt,
            directory,
            size: 0,
        };
        unsafe { space.pdpt.as_mut() }.entries[0]
            .set_mapping(PageTable::physical(directory), TABLE_FLAGS);
        let root = unsafe { pml4.as_mut() };
        root.entries[0].set_mapping(PageTable::physical(pdpt), TABLE_FLAGS);
        if let Some(kernel) = kernel_root() {
            let kernel = unsafe { PageTable::at(kernel).as_ref() };
            root.entries[KERNEL_HALF..].copy_from_slice(&kernel.entries[KERNEL_HALF..]);
        }
        Ok(space)
    }

    /// Physical address of the hardware root, for loading into the MMU
    #[must_use]
    pub fn root(&self) -> PhysAddr {
        PageTable::physical(self.pml4)
    }

    /// Bytes of user memory
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    fn directory(&self) -> &PageTable {
        unsafe { self.directory.as_ref() }
    }

    fn directory_mut(&mut self) -> &mut PageTable {
        unsafe { self.directory.as_mut() }
    }

    /// Runs `pte_edit` on the leaf entry for `virtual_address`, creating the page table that
    /// holds it if `should_allocate`.
    pub(crate) fn walk_mut<T>(
        &mut self,
        virtual_address: usize,
        should_allocate: bool,
        pte_edit: impl FnOnce(&mut PageTableEntry) -> T,
    ) -> Result<T, PageTableWalkError> {
        assert!(virtual_address < USER_TOP, "walk_mut");

        let directory_entry = &mut self.directory_mut().entries[directory_index(virtual_address)];
        let mut page_table = if directory_entry.present() {
            unsafe { PageTable::at(directory_entry.address()) }
        } else if !should_allocate {
            return Err(PageTableWalkError::PageTableUnallocated);
        } else {
            let page_table = PageTable::new().ok_or(PageTableWalkError::UnableToAllocate)?;
            directory_entry.set_mapping(PageTable::physical(page_table), TABLE_FLAGS);
            page_table
        };

        Ok(pte_edit(
            &mut unsafe { page_table.as_mut() }.entries[table_index(virtual_address)],
        ))
    }

    pub(crate) fn walk_const<T>(
        &self,
        virtual_address: usize,
        pte_lookup: impl FnOnce(&PageTableEntry) -> T,
    ) -> Result<T, PageTableWalkError> {
        assert!(virtual_address < USER_TOP, "walk");

        let directory_entry = &self.directory().entries[directory_index(virtual_address)];
        if !directory_entry.present() {
            return Err(PageTableWalkError::PageTableUnallocated);
        }
        let page_table = unsafe { PageTable::at(directory_entry.address()).as_ref() };
        Ok(pte_lookup(&page_table.entries[table_index(virtual_address)]))
    }

    /// Map a contiguous region of virtual addresses to a contiguous region of physical
    /// addresses. `virtual_base` and `region_size` need not be page aligned.
    ///
    /// Pages mapped before a failure stay mapped; the caller unwinds them.
    pub fn map_pages(
        &mut self,
        virtual_base: usize,
        region_size: usize,
        physical_base: PhysAddr,
        flags: PteFlags,
    ) -> Result<(), VmError> {
        assert!(region_size != 0, "map_pages: size");

        let virtual_page_start = PGROUNDDOWN!(virtual_base);
        let virtual_page_last = virtual_base
            .checked_add(region_size - 1)
            .map(|last| PGROUNDDOWN!(last))
            .filter(|&last| last < USER_TOP)
            .ok_or(VmError::BadAddress)?;
        for virtual_addr in (virtual_page_start..=virtual_page_last).step_by(PAGE_SIZE) {
            self.walk_mut(virtual_addr, true, |pte| {
                assert!(!pte.present(), "map_pages: remap");
                pte.set_mapping(
                    PhysAddr(virtual_addr - virtual_page_start + physical_base.0),
                    flags,
                );
            })?;
        }
        Ok(())
    }

    /// Grows user memory to `new_size` bytes of zeroed, user-writable pages.
    /// On failure the space is left exactly as it was.
    pub fn grow(&mut self, new_size: usize) -> Result<usize, VmError> {
        if new_size > USER_TOP {
            return Err(VmError::BadAddress);
        }
        if new_size <= self.size {
            return Ok(self.size);
        }

        let old_size = self.size;
        for virtual_addr in (PGROUNDUP!(old_size)..new_size).step_by(PAGE_SIZE) {
            let mapped = alloc_page().ok_or(VmError::OutOfMemory).and_then(|page| {
                self.map_pages(virtual_addr, PAGE_SIZE, virt_to_phys(page.as_ptr()), USER_DATA)
                    .inspect_err(|_| unsafe { free_pages(page, 1) })
            });
            if let Err(error) = mapped {
                self.size = virtual_addr;
                self.shrink(old_size);
                return Err(error);
            }
        }
        self.size = new_size;
        Ok(new_size)
    }

    /// Shrinks user memory to `new_size` bytes, freeing the pages beyond it.
    pub fn shrink(&mut self, new_size: usize) -> usize {
        if new_size >= self.size {
            return self.size;
        }

        for virtual_addr in (PGROUNDUP!(new_size)..PGROUNDUP!(self.size)).step_by(PAGE_SIZE) {
            let page = self.walk_mut(virtual_addr, false, |pte| {
                let page = pte.present().then(|| pte.address());
                *pte = PageTableEntry::default();
                page
            });
            if let Ok(Some(page)) = page {
                unsafe { free_pages(NonNull::new_unchecked(phys_to_virt(page)), 1) };
            }
        }
        self.size = new_size;
        new_size
    }

    /// Copies all user memory into `child`, which must be empty. On failure `child` holds
    /// part of the copy and dropping it releases everything.
    pub fn copy_into(&self, child: &mut AddressSpace) -> Result<(), VmError> {
        assert_eq!(child.size, 0, "copy_into: child not empty");

        for virtual_addr in (0..self.size).step_by(PAGE_SIZE) {
            let (source, flags) = self
                .walk_const(virtual_addr, |pte| {
                    pte.present().then(|| (pte.address(), pte.flags()))
                })
                .ok()
                .flatten()
                .expect("copy_into: page not present");
            let page = alloc_page().ok_or(VmError::OutOfMemory)?;
            unsafe {
                core::ptr::copy_nonoverlapping(phys_to_virt(source), page.as_ptr(), PAGE_SIZE);
            }
            child
                .map_pages(virtual_addr, PAGE_SIZE, virt_to_phys(page.as_ptr()), flags)
                .inspect_err(|_| unsafe { free_pages(page, 1) })?;
            child.size = (virtual_addr + PAGE_SIZE).min(self.size);
        }
        child.size = self.size;
        Ok(())
    }

    fn check_range(&self, virtual_address: usize, len: usize) -> Result<(), VmError> {
        match virtual_address.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VmError::BadAddress),
        }
    }

    /// Frame behind a user-accessible page
    fn user_page(&self, page: usize) -> Result<PhysAddr, VmError> {
        self.walk_const(page, |pte| {
            (pte.present() && pte.user_accessible()).then(|| pte.address())
        })?
        .ok_or(VmError::BadAddress)
    }

    /// Calls `f(page_frame, offset, range_within_buffer)` for each page piece of the range.
    fn for_each_piece(
        &self,
        virtual_address: usize,
        len: usize,
        mut f: impl FnMut(PhysAddr, usize, core::ops::Range<usize>),
    ) -> Result<(), VmError> {
        self.check_range(virtual_address, len)?;
        let mut done = 0;
        while done < len {
            let address = virtual_address + done;
            let page = PGROUNDDOWN!(address);
            let offset = address - page;
            let n = (PAGE_SIZE - offset).min(len - done);
            f(self.user_page(page)?, offset, done..done + n);
            done += n;
        }
        Ok(())
    }

    /// Fails unless all of `len` bytes at `virtual_address` are user-accessible memory.
    pub fn check_user(&self, virtual_address: usize, len: usize) -> Result<(), VmError> {
        self.for_each_piece(virtual_address, len, |_, _, _| {})
    }

    /// Copies `source` to user address `virtual_address`.
    pub fn copy_out(&mut self, virtual_address: usize, source: &[u8]) -> Result<(), VmError> {
        self.for_each_piece(virtual_address, source.len(), |frame, offset, range| unsafe {
            core::ptr::copy_nonoverlapping(
                source[range.clone()].as_ptr(),
                phys_to_virt(frame).add(offset),
                range.len(),
            );
        })
    }

    /// Fills `destination` from user address `virtual_address`.
    pub fn copy_in(&self, virtual_address: usize, destination: &mut [u8]) -> Result<(), VmError> {
        self.for_each_piece(virtual_address, destination.len(), |frame, offset, range| unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(frame).add(offset),
                destination[range.clone()].as_mut_ptr(),
                range.len(),
            );
        })
    }

    pub fn read_u64(&self, virtual_address: usize) -> Result<u64, VmError> {
        let mut word = [0; size_of::<u64>()];
        self.copy_in(virtual_address, &mut word)?;
        Ok(u64::from_ne_bytes(word))
    }

    /// Copies in the NUL-terminated string at `virtual_address`, without the terminator.
    /// Fails if no terminator shows up within `max` bytes or before the end of user memory.
    pub fn fetch_str(&self, virtual_address: usize, max: usize) -> Result<Vec<u8>, VmError> {
        let mut string = Vec::new();
        let mut address = virtual_address;
        while string.len() < max {
            if address >= self.size {
                return Err(VmError::BadAddress);
            }
            let n = (PAGE_SIZE - address % PAGE_SIZE)
                .min(self.size - address)
                .min(max - string.len());
            let mut chunk = [0; PAGE_SIZE];
            self.copy_in(address, &mut chunk[..n])?;
            if let Some(end) = chunk[..n].iter().position(|&byte| byte == 0) {
                string.extend_from_slice(&chunk[..end]);
                return Ok(string);
            }
            string.extend_from_slice(&chunk[..n]);
            address += n;
        }
        Err(VmError::BadAddress)
    }

    /// Makes the page at `virtual_address` unreachable from user mode, as for a stack guard.
    pub fn clear_user(&mut self, virtual_address: usize) -> Result<(), VmError> {
        self.walk_mut(virtual_address, false, |pte| {
            if pte.present() {
                pte.set_user_accessible(false);
                Ok(())
            } else {
                Err(VmError::BadAddress)
            }
        })?
    }

    /// Installs this space on the calling core. The tag decision is left to `tags`;
    /// `kernel_stack` becomes the stack user-mode traps on this core arrive on.
    pub(crate) fn activate<H: Hal>(
        &self,
        hal: &H,
        tags: &TagAllocator,
        lease: &mut Option<TagLease>,
        seen: &mut [Option<u64>; NTAGS],
        kernel_stack: usize,
    ) {
        hal.set_kernel_stack(kernel_stack);
        let switch = tags.select(lease, seen);
        hal.load_address_space(self.root(), switch);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.shrink(0);
        for entry in &self.directory().entries[..] {
            if entry.present() {
                unsafe { PageTable::free(PageTable::at(entry.address())) };
            }
        }
        unsafe {
            PageTable::free(self.directory);
            PageTable::free(self.pdpt);
            PageTable::free(self.pml4);
        }
    }
}

fn directory_index(virtual_address: usize) -> usize {
    (virtual_address >> 21) & 0x1FF
}

fn table_index(virtual_address: usize) -> usize {
    (virtual_address >> 12) & 0x1FF
}

/// Resolves a user address the way the MMU does, through all four levels from `root`.
#[cfg(test)]
pub(crate) fn hardware_translate(root: PhysAddr, virtual_address: usize) -> Option<PhysAddr> {
    let mut page_table = root;
    for level in (1..=3).rev() {
        let page_index = (virtual_address >> (12 + (9 * level))) & 0x1FF;
        let entry = unsafe { PageTable::at(page_table).as_ref() }.entries[page_index];
        if !entry.present() || !entry.user_accessible() {
            return None;
        }
        page_table = entry.address();
    }
    let entry = unsafe { PageTable::at(page_table).as_ref() }.entries[table_index(virtual_address)];
    (entry.present() && entry.user_accessible())
        .then(|| PhysAddr(entry.address().0 + virtual_address % PAGE_SIZE))
}

bitfield! {
    /// A wrapper around an x86-64 page-table entry; all four levels share the layout
    #[derive(PartialEq, Eq, Copy, Clone, Default)]
    #[repr(transparent)]
    pub struct PageTableEntry(u64);
    impl Debug;
    /// Is the entry in use?
    pub present, set_present: 0;
    /// Can the memory be written?
    pub writable, set_writable: 1;
    /// Can user code reach the memory?
    pub user_accessible, set_user_accessible: 2;
    /// Has the hardware used this entry since the last reset?
    pub accessed, _: 5;
    /// Has the page been written since the last reset?
    pub dirty, _: 6;
    /// Survives address-space switches
    pub global, set_global: 8;
    /// Physical frame number
    frame, set_frame: 51, 12;
    pub no_execute, set_no_execute: 63;
}

impl PageTableEntry {
    /// The physical address this entry points to
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::trivially_copy_pass_by_ref)]
    pub fn address(&self) -> PhysAddr {
        PhysAddr((self.frame() << 12) as usize)
    }

    /// Point this entry at `physical_address` with `flags`, marking it present
    pub fn set_mapping(&mut self, physical_address: PhysAddr, flags: PteFlags) {
        *self = PageTableEntry(flags.bits());
        self.set_frame(physical_address.0 as u64 >> 12);
        self.set_present(true);
    }

    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

impl From<PageTableEntry> for u64 {
    fn from(value: PageTableEntry) -> Self {
        value.0
    }
}

impl From<u64> for PageTableEntry {
    fn from(value: u64) -> Self {
        PageTableEntry(value)
    }
}

bitflags! {
    /// Permissions of a leaf mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

macro_rules! PGROUNDUP {
    ($e:expr) => {
        ($e as usize + $crate::vm::PAGE_SIZE - 1) & !($crate::vm::PAGE_SIZE - 1)
    };
}

macro_rules! PGROUNDDOWN {
    ($e:expr) => {
        $e as usize & !($crate::vm::PAGE_SIZE - 1)
    };
}

pub(crate) use PGROUNDDOWN;
pub(crate) use PGROUNDUP;

#[cfg(test)]
mod tests {
    use super::*;

    fn space_with(bytes: usize) -> AddressSpace {
        let mut space = AddressSpace::create_empty().unwrap();
        space.grow(bytes).unwrap();
        space
    }

    #[test]
    fn hardware_walk_reaches_pages_mapped_through_the_directory() {
        let mut space = space_with(3 * PAGE_SIZE);
        space.copy_out(PAGE_SIZE + 8, b"xv64").unwrap();

        let physical = hardware_translate(space.root(), PAGE_SIZE + 8).unwrap();
        let seen = unsafe { core::slice::from_raw_parts(phys_to_virt(physical), 4) };
        assert_eq!(seen, b"xv64");
        assert_eq!(hardware_translate(space.root(), 3 * PAGE_SIZE), None);
    }

    #[test]
    fn reserved_directory_slots_stay_unmapped() {
        let mut space = space_with(PAGE_SIZE);
        assert_eq!(USER_TOP, 510 * DIRECTORY_SPAN);
        assert!(space.grow(USER_TOP + 1).is_err());
        let reserved = &space.directory().entries[ENTRIES - RESERVED_DIRECTORY_SLOTS..];
        assert!(reserved.iter().all(|entry| !entry.present()));
        assert_eq!(
            space.map_pages(USER_TOP, PAGE_SIZE, PhysAddr(0), USER_DATA),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn copies_cross_page_boundaries() {
        let mut space = space_with(2 * PAGE_SIZE);
        let message = [7u8; 64];
        space.copy_out(PAGE_SIZE - 32, &message).unwrap();

        let mut back = [0u8; 64];
        space.copy_in(PAGE_SIZE - 32, &mut back).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn copies_outside_user_memory_are_refused() {
        let mut space = space_with(PAGE_SIZE);
        assert_eq!(space.copy_out(PAGE_SIZE - 2, b"abc"), Err(VmError::BadAddress));
        assert_eq!(space.copy_in(usize::MAX - 1, &mut [0; 4]), Err(VmError::BadAddress));
        assert_eq!(space.read_u64(PAGE_SIZE), Err(VmError::BadAddress));
    }

    #[test]
    fn guard_pages_are_not_user_memory() {
        let mut space = space_with(2 * PAGE_SIZE);
        space.clear_user(0).unwrap();
        assert_eq!(space.copy_in(16, &mut [0; 4]), Err(VmError::BadAddress));
        assert!(space.copy_in(PAGE_SIZE, &mut [0; 4]).is_ok());
    }

    #[test]
    fn fetch_str_stops_at_the_terminator() {
        let mut space = space_with(PAGE_SIZE);
        space.copy_out(100, b"/init\0junk").unwrap();
        assert_eq!(space.fetch_str(100, 64).unwrap(), b"/init");
        assert_eq!(space.fetch_str(100, 3), Err(VmError::BadAddress));

        space.copy_out(PAGE_SIZE - 3, b"abc").unwrap();
        assert_eq!(space.fetch_str(PAGE_SIZE - 3, 64), Err(VmError::BadAddress));
    }

    #[test]
    fn shrink_unmaps_the_tail() {
        let mut space = space_with(4 * PAGE_SIZE);
        assert_eq!(space.shrink(PAGE_SIZE + 1), PAGE_SIZE + 1);
        assert!(space.walk_const(PAGE_SIZE, |pte| pte.present()).unwrap());
        assert!(!space.walk_const(2 * PAGE_SIZE, |pte| pte.present()).unwrap());
        assert!(!space.walk_const(3 * PAGE_SIZE, |pte| pte.present()).unwrap());
    }

    #[test]
    fn failed_grow_leaves_the_space_untouched() {
        let mut space = space_with(PAGE_SIZE);
        budget::limit(Some(2));
        let result = space.grow(8 * PAGE_SIZE);
        budget::limit(None);

        assert_eq!(result, Err(VmError::OutOfMemory));
        assert_eq!(space.size(), PAGE_SIZE);
        assert!(!space.walk_const(PAGE_SIZE, |pte| pte.present()).unwrap());
    }

    #[test]
    fn create_empty_reports_exhaustion() {
        budget::limit(Some(2));
        let result = AddressSpace::create_empty();
        budget::limit(None);
        assert!(matches!(result, Err(VmError::OutOfMemory)));
    }

    #[test]
    fn copy_into_duplicates_contents_independently() {
        let mut parent = space_with(2 * PAGE_SIZE);
        parent.copy_out(PAGE_SIZE + 1, b"parent").unwrap();

        let mut child = AddressSpace::create_empty().unwrap();
        parent.copy_into(&mut child).unwrap();
        assert_eq!(child.size(), parent.size());

        child.copy_out(PAGE_SIZE + 1, b"child!").unwrap();
        let mut seen = [0; 6];
        parent.copy_in(PAGE_SIZE + 1, &mut seen).unwrap();
        assert_eq!(&seen, b"parent");
        child.copy_in(PAGE_SIZE + 1, &mut seen).unwrap();
        assert_eq!(&seen, b"child!");
    }

    #[test]
    fn copy_into_can_be_abandoned_midway() {
        let parent = space_with(6 * PAGE_SIZE);
        let mut child = AddressSpace::create_empty().unwrap();
        budget::limit(Some(3));
        let result = parent.copy_into(&mut child);
        budget::limit(None);

        assert_eq!(result, Err(VmError::OutOfMemory));
        assert!(child.size() < parent.size());
        drop(child);
    }

    #[test]
    #[should_panic(expected = "map_pages: remap")]
    fn remapping_a_live_page_panics() {
        let mut space = space_with(PAGE_SIZE);
        space.map_pages(0, PAGE_SIZE, PhysAddr(0x1000), USER_DATA).unwrap();
    }

    #[test]
    fn entries_keep_frame_and_flags_apart() {
        let mut entry = PageTableEntry::default();
        entry.set_mapping(PhysAddr(0x1234_5000), PteFlags::USER | PteFlags::NO_EXECUTE);
        assert!(entry.present());
        assert!(entry.user_accessible());
        assert!(!entry.writable());
        assert!(entry.no_execute());
        assert_eq!(entry.address(), PhysAddr(0x1234_5000));
        assert_eq!(entry.flags(), PteFlags::USER | PteFlags::NO_EXECUTE);
    }
}
