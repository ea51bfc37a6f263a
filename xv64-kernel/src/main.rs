#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

/*!
   Copyright 2024 Claire Moore

   Licensed under the Apache License, Version 2.0 (the "License");
   you may not use this file except in compliance with the License.
   You may obtain a copy of the License at

       http://www.apache.org/licenses/LICENSE-2.0

   Unless required by applicable law or agreed to in writing, software
   distributed under the License is distributed on an "AS IS" BASIS,
   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
   See the License for the specific language governing permissions and
   limitations under the License.
*/

#[cfg(target_os = "none")]
mod image {
    use limine::memory_map::EntryType;
    use limine::mp::Cpu;
    use limine::request::{
        HhdmRequest, MemoryMapRequest, ModuleRequest, MpRequest, RequestsEndMarker,
        RequestsStartMarker,
    };
    use limine::BaseRevision;
    use log::{error, info};
    use xv64_kernel::arch::x86::boot;
    use xv64_kernel::vm::PhysAddr;

    #[used]
    #[link_section = ".requests_start_marker"]
    static START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

    #[used]
    #[link_section = ".requests"]
    static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    #[link_section = ".requests"]
    static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

    #[used]
    #[link_section = ".requests"]
    static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

    #[used]
    #[link_section = ".requests"]
    static MODULE_REQUEST: ModuleRequest = ModuleRequest::new();

    #[used]
    #[link_section = ".requests"]
    static MP_REQUEST: MpRequest = MpRequest::new();

    #[used]
    #[link_section = ".requests_end_marker"]
    static END_MARKER: RequestsEndMarker = RequestsEndMarker::new();

    #[no_mangle]
    extern "C" fn kmain() -> ! {
        assert!(BASE_REVISION.is_supported(), "limine base revision unsupported");
        let offset = HHDM_REQUEST
            .get_response()
            .expect("limine: no direct map")
            .offset();
        let heap = MEMORY_MAP_REQUEST
            .get_response()
            .expect("limine: no memory map")
            .entries()
            .iter()
            .filter(|entry| entry.entry_type == EntryType::USABLE)
            .max_by_key(|entry| entry.length)
            .expect("limine: no usable memory");

        unsafe {
            boot::init(
                offset as usize,
                PhysAddr(heap.base as usize),
                heap.length as usize,
            );
        }

        if let Some(modules) = MODULE_REQUEST.get_response() {
            for module in modules.modules() {
                let path = module.path().to_bytes();
                let image = unsafe {
                    core::slice::from_raw_parts(module.addr(), module.size() as usize)
                };
                info!(
                    "image {} ({} bytes)",
                    core::str::from_utf8(path).unwrap_or("?"),
                    image.len()
                );
                boot::add_image(path, image);
            }
        }

        if let Some(mp) = MP_REQUEST.get_response() {
            for cpu in mp.cpus() {
                if cpu.lapic_id != mp.bsp_lapic_id() {
                    cpu.goto_address.write(ap_main);
                }
            }
        }

        boot::run()
    }

    extern "C" fn ap_main(_cpu: &Cpu) -> ! {
        unsafe { boot::start_secondary() }
    }

    #[panic_handler]
    fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
        x86_64::instructions::interrupts::disable();
        error!("{info}");
        loop {
            x86_64::instructions::hlt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("xv64-kernel only runs on bare x86-64 (x86_64-unknown-none)");
}
