//! The kernel heap.
//!
//! Physical memory handed over by the bootloader is carved into pages, tracked by a one
//! byte per page use map stored at the start of the region itself. Requests of a page or
//! more take whole runs of pages; smaller ones are packed into pages by the tiny
//! allocator.

use crate::vm::{self, PhysAddr, PAGE_SIZE, PGROUNDDOWN, PGROUNDUP};
use alloc::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};
use log::debug;
use spin::mutex::Mutex;

const FREE: u8 = 0;
const IN_USE: u8 = 1;

/// Pages handed out by [`KernelPageAllocator`]
struct PageMap {
    /// Address of the first allocatable page, in the direct map
    base: usize,
    use_map: &'static mut [u8],
}

impl PageMap {
    fn index_of(&self, address: usize) -> Option<usize> {
        let index = address.checked_sub(self.base)? / PAGE_SIZE;
        (address % PAGE_SIZE == 0 && index < self.use_map.len()).then_some(index)
    }

    /// First run of `count` free pages
    fn find_run(&self, count: usize) -> Option<usize> {
        let mut start = 0;
        let mut length = 0;
        for (index, &state) in self.use_map.iter().enumerate() {
            if state == FREE {
                if length == 0 {
                    start = index;
                }
                length += 1;
                if length == count {
                    return Some(start);
                }
            } else {
                length = 0;
            }
        }
        None
    }
}

pub(crate) struct KernelPageAllocator {
    pages: Mutex<Option<PageMap>>,
}

#[repr(C, align(16))]
struct TinyHeader {
    next: Option<NonNull<TinyHeader>>,
    /// Bytes of payload following the header
    size: usize,
}

/// Free tiny blocks, most recently freed first
struct TinyList(Option<NonNull<TinyHeader>>);

// Only reachable through the allocator's lock.
unsafe impl Send for TinyList {}

pub(crate) struct KernelAllocator {
    page_allocator: KernelPageAllocator,
    tiny_list: Mutex<TinyList>,
}

#[global_allocator]
pub(crate) static ALLOCATOR: KernelAllocator = KernelAllocator {
    page_allocator: KernelPageAllocator {
        pages: Mutex::new(None),
    },
    tiny_list: Mutex::new(TinyList(None)),
};

unsafe impl GlobalAlloc for KernelPageAllocator {
    /// Allocates a run of whole pages. Alignments beyond a page are refused.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return ptr::null_mut();
        }
        let count = PGROUNDUP!(layout.size().max(1)) / PAGE_SIZE;

        let mut pages = self.pages.lock();
        let Some(map) = pages.as_mut() else {
            return ptr::null_mut();
        };
        let Some(start) = map.find_run(count) else {
            return ptr::null_mut();
        };
        map.use_map[start..start + count].fill(IN_USE);
        let page = (map.base + start * PAGE_SIZE) as *mut u8;
        drop(pages);

        // Junk, to catch use of uninitialized memory
        unsafe { ptr::write_bytes(page, 5, count * PAGE_SIZE) };
        page
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let count = PGROUNDUP!(layout.size().max(1)) / PAGE_SIZE;
        let mut pages = self.pages.lock();
        let map = pages.as_mut().expect("KPA_dealloc: allocator not initialized");
        let start = map
            .index_of(ptr as usize)
            .filter(|&start| start + count <= map.use_map.len())
            .expect("KPA_dealloc: Out of bounds");
        let run = &mut map.use_map[start..start + count];
        assert!(run.iter().all(|&state| state == IN_USE), "KPA_dealloc: page not in use");

        // Junk, to catch dangling references
        unsafe { ptr::write_bytes(ptr, 1, count * PAGE_SIZE) };
        run.fill(FREE);
    }
}

impl KernelPageAllocator {
    /// Hands the `length` bytes of physical memory at `start` to the allocator.
    fn init(&self, start: PhysAddr, length: usize) {
        let first = PGROUNDUP!(start.0);
        let last = PGROUNDDOWN!(start.0 + length);
        let total = last.saturating_sub(first) / PAGE_SIZE;
        // The use map takes one byte per page from the front of the region.
        let map_pages = PGROUNDUP!(total) / PAGE_SIZE;
        let page_count = total.saturating_sub(map_pages);

        let map_address = vm::phys_to_virt(PhysAddr(first));
        unsafe { ptr::write_bytes(map_address, FREE, page_count) };
        let use_map = unsafe { core::slice::from_raw_parts_mut(map_address, page_count) };
        let base = map_address as usize + map_pages * PAGE_SIZE;
        debug!("page allocator: {page_count} pages at {base:#x}");

        *self.pages.lock() = Some(PageMap { base, use_map });
    }

    fn free_pages(&self) -> usize {
        self.pages.lock().as_ref().map_or(0, |map| {
            map.use_map.iter().filter(|&&state| state == FREE).count()
        })
    }
}

impl KernelAllocator {
    const MAX_ALIGNMENT: usize = 16;
    const HEADER: usize = size_of::<TinyHeader>();

    /// Gives the heap the usable physical region at `start`. Must run before the first
    /// allocation.
    pub(crate) fn init(&self, start: PhysAddr, length: usize) {
        self.page_allocator.init(start, length);
        debug!("kernel heap: {} KiB free", self.free_bytes() / 1024);
    }

    /// Free bytes across whole pages and tiny blocks
    pub(crate) fn free_bytes(&self) -> usize {
        let mut tiny = 0;
        let list = self.tiny_list.lock();
        let mut next = list.0;
        while let Some(header) = next {
            let header = unsafe { header.as_ref() };
            tiny += header.size;
            next = header.next;
        }
        tiny + self.page_allocator.free_pages() * PAGE_SIZE
    }

    fn is_tiny(layout: Layout) -> bool {
        layout.size() < PAGE_SIZE - 2 * Self::HEADER && layout.align() <= Self::MAX_ALIGNMENT
    }

    /// Takes the first free block of at least `size` bytes, splitting off the rest when
    /// it can hold another block.
    fn take_block(list: &mut TinyList, size: usize) -> Option<NonNull<TinyHeader>> {
        let mut link: *mut Option<NonNull<TinyHeader>> = &mut list.0;
        while let Some(mut block) = unsafe { *link } {
            let header = unsafe { block.as_mut() };
            if header.size >= size {
                unsafe { *link = header.next };
                if header.size >= size + 2 * Self::HEADER {
                    let rest = unsafe { block.as_ptr().cast::<u8>().add(Self::HEADER + size) }
                        .cast::<TinyHeader>();
                    unsafe {
                        rest.write(TinyHeader {
                            next: list.0,
                            size: header.size - size - Self::HEADER,
                        });
                    }
                    list.0 = NonNull::new(rest);
                    header.size = size;
                }
                return Some(block);
            }
            link = &mut header.next;
        }
        None
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !Self::is_tiny(layout) {
            return unsafe { self.page_allocator.alloc(layout) };
        }
        let size = (layout.size() + Self::MAX_ALIGNMENT - 1) & !(Self::MAX_ALIGNMENT - 1);

        let mut list = self.tiny_list.lock();
        if let Some(block) = Self::take_block(&mut list, size) {
            return unsafe { block.as_ptr().add(1) }.cast();
        }

        // Carve a fresh page: the block asked for, then the rest of the page as free space.
        let page_layout = unsafe { Layout::from_size_align_unchecked(PAGE_SIZE, PAGE_SIZE) };
        let page = unsafe { self.page_allocator.alloc(page_layout) };
        let Some(page) = NonNull::new(page.cast::<TinyHeader>()) else {
            return ptr::null_mut();
        };
        unsafe {
            page.as_ptr().write(TinyHeader { next: None, size });
            let rest = page.as_ptr().cast::<u8>().add(Self::HEADER + size).cast::<TinyHeader>();
            rest.write(TinyHeader {
                next: list.0,
                size: PAGE_SIZE - size - 2 * Self::HEADER,
            });
            list.0 = NonNull::new(rest);
            page.as_ptr().add(1).cast()
        }
    }

    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !Self::is_tiny(layout) {
            unsafe { self.page_allocator.dealloc(ptr, layout) };
            return;
        }
        assert!(
            ptr as usize % Self::MAX_ALIGNMENT == 0,
            "KTA_dealloc: misaligned block"
        );
        let mut list = self.tiny_list.lock();
        let header = unsafe { ptr.cast::<TinyHeader>().sub(1) };
        unsafe { (*header).next = list.0 };
        list.0 = NonNull::new(header);
    }
}
