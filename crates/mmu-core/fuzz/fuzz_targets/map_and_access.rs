#![no_main]

use libfuzzer_sys::fuzz_target;
use mmu_core::{
    AddressSpace, Decoder, Emulator, FaultContext, FaultDecision, FaultKinds, FaultRecord,
    Permissions, RegisterFile, RunLimits, PAGE_SIZE,
};

const WINDOW_PAGES: u32 = 64;

fn addr(raw: u8) -> u32 {
    0x0040_0000 + u32::from(raw) % WINDOW_PAGES * PAGE_SIZE
}

fn assert_sorted(space: &AddressSpace) {
    let infos = space.regions().infos();
    for pair in infos.windows(2) {
        assert!(u64::from(pair[0].base) + u64::from(pair[0].size) <= u64::from(pair[1].base));
    }
}

fuzz_target!(|data: &[u8]| {
    let mut space = AddressSpace::new(2);
    let mut regs = RegisterFile::new();
    space.hooks_mut().add(
        FaultKinds::UNMAPPED,
        None,
        Box::new(|ctx: &mut FaultContext<'_>, fault: &FaultRecord| {
            let page = fault.fault_address & !(PAGE_SIZE - 1);
            match ctx.memory().map(page, PAGE_SIZE, Permissions::RW) {
                Ok(()) => FaultDecision::Continue,
                Err(_) => FaultDecision::Stop,
            }
        }),
    );

    for chunk in data.chunks_exact(4) {
        let [op, a, b, c] = [chunk[0], chunk[1], chunk[2], chunk[3]];
        let base = addr(a);
        let size = u32::from(b % 8 + 1) * PAGE_SIZE;
        let perms = Permissions::from_bits_truncate(c);
        let offset = u32::from(c) << 4;
        match op % 6 {
            0 => {
                let _ = space.mutator().map(base, size, perms);
            }
            1 => {
                let _ = space.mutator().unmap(base, size);
            }
            2 => {
                let _ = space.mutator().protect(base, size, perms);
            }
            3 => {
                let _ = space.read(&mut regs, base + offset, usize::from(b));
            }
            4 => {
                let _ = space.write(&mut regs, base + offset, &chunk[..usize::from(b % 5)]);
            }
            _ => {
                let _ = space.fetch(&mut regs, base.wrapping_sub(offset), usize::from(b % 16));
            }
        }
        assert_sorted(&space);
    }

    let _ = Decoder::decode(data);

    let mut emu = Emulator::default();
    if emu.memory().map(0x1000, PAGE_SIZE, Permissions::ALL).is_ok()
        && emu.memory().write(0x1000, &data[..data.len().min(0x100)]).is_ok()
    {
        let _ = emu.run(0x1000, RunLimits::new().max_instructions(64));
    }
});
