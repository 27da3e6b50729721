//! In-memory mapping of the assembler's sections into executable pages.
//!
//! The [`ElfMapper`] takes a finished [`Assembler`] state and turns it
//! into directly callable code: sections are grouped by their required
//! permissions so each group occupies a contiguous page range, undefined
//! symbols are resolved through a caller-supplied callback, relocations
//! are applied in place (with PLT/GOT stubs synthesized for targets out
//! of direct reach), the page protections are tightened, and the mapped
//! `.eh_frame` is registered with the unwinder so C++-style unwinding
//! works through generated frames.
//!
//! A mapper maps at most once; `reset` (or dropping it) deregisters the
//! frames and unmaps the region.

#![deny(missing_docs)]

use std::ffi::c_void;
use std::ptr;

use tarmac_codegen::assembler::{Assembler, Reloc, SecRef, SymRef};
use tarmac_codegen::entity::EntityRef;
use thiserror::Error;

extern "C" {
    fn __register_frame(fde: *const u8);
    fn __deregister_frame(fde: *const u8);
}

/// Why a mapping attempt failed. A failed map unwinds any partial state.
#[derive(Error, Debug)]
pub enum MapError {
    /// The mapper was used twice without a reset.
    #[error("mapper already holds a mapping")]
    AlreadyMapped,
    /// Reserving or protecting memory failed.
    #[error("memory operation failed: {0}")]
    Memory(#[from] rustix::io::Errno),
    /// The resolver returned no address for a required symbol.
    #[error("undefined symbol {0:?} could not be resolved")]
    UnresolvedSymbol(String),
    /// A relocation's value does not fit its field even via a stub.
    #[error("relocation type {kind} at offset {offset:#x} out of range")]
    RelocOutOfRange {
        /// ELF relocation type.
        kind: u32,
        /// Offset within the relocated section.
        offset: u64,
    },
    /// A relocation type the mapper does not implement.
    #[error("unsupported relocation type {0}")]
    UnsupportedReloc(u32),
    /// The object targets a different architecture than this process.
    #[error("object architecture does not match the host")]
    WrongArch,
}

/// One 16-byte combined PLT/GOT slot per possibly external symbol.
const PLT_ENTRY_SIZE: usize = 16;

/// Name-to-address resolver for undefined symbols. Returning `None`
/// aborts the mapping.
pub type SymbolResolver<'a> = dyn FnMut(&str) -> Option<*const c_void> + 'a;

/// Maps an assembler's sections into executable memory.
pub struct ElfMapper {
    base: *mut u8,
    size: usize,
    sym_addrs: Vec<*const u8>,
    local_sym_count: usize,
    registered_frame: Option<u32>,
}

// The mapping is owned exclusively; raw pointers only reference it.
unsafe impl Send for ElfMapper {}

impl Default for ElfMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl ElfMapper {
    /// Create an empty mapper.
    pub fn new() -> Self {
        Self {
            base: ptr::null_mut(),
            size: 0,
            sym_addrs: Vec::new(),
            local_sym_count: 0,
            registered_frame: None,
        }
    }

    /// Release the mapping, returning the mapper to its initial state.
    pub fn reset(&mut self) {
        if self.base.is_null() {
            return;
        }
        unsafe {
            if let Some(off) = self.registered_frame.take() {
                __deregister_frame(self.base.add(off as usize));
            }
            let _ = rustix::mm::munmap(self.base.cast(), self.size);
        }
        self.base = ptr::null_mut();
        self.size = 0;
        self.sym_addrs.clear();
    }

    /// The resolved address of `sym` after a successful map.
    pub fn get_sym_addr(&self, sym: SymRef) -> Option<*const u8> {
        let idx = self.flat_sym_idx(sym);
        let addr = *self.sym_addrs.get(idx)?;
        if addr.is_null() {
            None
        } else {
            Some(addr)
        }
    }

    fn flat_sym_idx(&self, sym: SymRef) -> usize {
        if sym.is_local() {
            sym.idx()
        } else {
            self.local_sym_count + sym.idx()
        }
    }

    /// Map `assembler`'s sections, resolving undefined symbols through
    /// `resolver`.
    pub fn map(
        &mut self,
        assembler: &Assembler,
        resolver: &mut SymbolResolver<'_>,
    ) -> Result<(), MapError> {
        if !self.base.is_null() {
            return Err(MapError::AlreadyMapped);
        }
        if !host_machine_matches(assembler.target().elf_machine) {
            return Err(MapError::WrongArch);
        }

        // every symbol could need a PLT/GOT slot in the worst case
        let plt_slot_count =
            assembler.local_symbols.len() + assembler.global_symbols.len();

        // group allocatable sections by permissions: executable first,
        // then read-only, then writable, BSS-style sections last
        struct AllocSection {
            sec: SecRef,
            sort_key: u32,
        }
        let mut alloc_sections: Vec<AllocSection> = Vec::new();
        for (sec, section) in assembler.sections.iter() {
            if !section.is_alloc || section.size() == 0 {
                continue;
            }
            let mut sort_key = 0;
            if !section.is_exec {
                sort_key |= 1 << 2;
            }
            if section.is_write {
                sort_key |= 1 << 1;
            }
            if section.is_nobits {
                sort_key |= 1 << 0;
            }
            alloc_sections.push(AllocSection { sec, sort_key });
        }
        alloc_sections.sort_by_key(|s| s.sort_key);

        let page_size = page_size();
        let mut base_off: usize = 0;
        let mut prev_key = u32::MAX;
        // permission boundaries: (start offset, exec, write)
        let mut perm_boundaries: Vec<(usize, bool, bool)> = Vec::new();
        let mut sec_addrs = vec![0usize; assembler.sections.len()];

        if plt_slot_count > 0 {
            perm_boundaries.push((0, true, false));
            base_off += plt_slot_count * PLT_ENTRY_SIZE;
            prev_key = 0;
        }

        for s in &alloc_sections {
            let section = &assembler.sections[s.sec];
            if section.align as usize >= page_size {
                log::warn!(
                    "section {} alignment {:#x} beyond the page size is ignored",
                    section.name,
                    section.align
                );
            }
            if prev_key != s.sort_key {
                base_off = align_up(base_off, page_size);
                perm_boundaries.push((base_off, section.is_exec, section.is_write));
                prev_key = s.sort_key;
            } else {
                base_off = align_up(base_off, section.align as usize);
            }
            sec_addrs[s.sec.index()] = base_off;
            base_off += section.size() as usize;
            log::trace!(
                "mapping section {} ({:#x} bytes) at offset {:#x}",
                section.name,
                section.size(),
                sec_addrs[s.sec.index()]
            );
        }
        perm_boundaries.push((base_off, false, false));

        self.size = align_up(base_off.max(1), page_size);
        self.base = unsafe {
            rustix::mm::mmap_anonymous(
                ptr::null_mut(),
                self.size,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::PRIVATE,
            )?
        }
        .cast();

        match self.map_inner(
            assembler,
            resolver,
            &alloc_sections.iter().map(|s| s.sec).collect::<Vec<_>>(),
            &sec_addrs,
            &perm_boundaries,
            plt_slot_count,
        ) {
            Ok(()) => Ok(()),
            Err(e) => {
                // unwind the partial mapping
                self.registered_frame = None;
                self.reset();
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn map_inner(
        &mut self,
        assembler: &Assembler,
        resolver: &mut SymbolResolver<'_>,
        alloc_sections: &[SecRef],
        sec_addrs: &[usize],
        perm_boundaries: &[(usize, bool, bool)],
        plt_slot_count: usize,
    ) -> Result<(), MapError> {
        let base = self.base;
        self.local_sym_count = assembler.local_symbols.len();
        self.sym_addrs = vec![
            ptr::null();
            assembler.local_symbols.len() + assembler.global_symbols.len()
        ];

        // resolve a symbol at most once; undefined symbols that are never
        // referenced stay unresolved
        let local_sym_count = self.local_sym_count;
        let sym_addrs = &mut self.sym_addrs;
        let flat = |sym: SymRef| -> usize {
            if sym.is_local() {
                sym.idx()
            } else {
                local_sym_count + sym.idx()
            }
        };
        let mut sym_addr = |sym: SymRef| -> Result<*const u8, MapError> {
            let idx = flat(sym);
            if sym_addrs[idx].is_null() {
                let record = assembler.sym(sym);
                let addr = match record.section {
                    Some(sec) => unsafe {
                        base.add(sec_addrs[sec.index()] + record.value as usize)
                    },
                    None => {
                        let name = assembler.sym_name(sym);
                        match resolver(name) {
                            Some(p) if !p.is_null() => p.cast(),
                            _ => {
                                return Err(MapError::UnresolvedSymbol(name.to_string()));
                            }
                        }
                    }
                };
                log::trace!("resolved symbol {:?} to {addr:p}", assembler.sym_name(sym));
                sym_addrs[idx] = addr;
            }
            Ok(sym_addrs[idx])
        };

        // PLT/GOT slots: a 16-byte stub whose second half is the GOT
        // entry holding the absolute target
        let mut plt = PltState {
            next: base,
            slots: vec![
                ptr::null_mut();
                assembler.local_symbols.len() + assembler.global_symbols.len()
            ],
            left: plt_slot_count,
        };

        // copy section contents and resolve their relocations
        for &sec in alloc_sections {
            let section = &assembler.sections[sec];
            let sec_addr = unsafe { base.add(sec_addrs[sec.index()]) };
            if !section.is_nobits {
                unsafe {
                    ptr::copy_nonoverlapping(
                        section.data.as_ptr(),
                        sec_addr,
                        section.data.len(),
                    );
                }
            }
            for reloc in &section.relocs {
                let sym = reloc.sym;
                let s = sym_addr(sym)? as usize;
                resolve_reloc(sec_addr, reloc, s, flat(sym), &mut plt)?;
            }
        }

        // tighten permissions per group
        for window in perm_boundaries.windows(2) {
            let (from, exec, write) = window[0];
            let to = window[1].0;
            if to == from {
                continue;
            }
            let mut prot = rustix::mm::MprotectFlags::READ;
            if exec {
                prot |= rustix::mm::MprotectFlags::EXEC;
            }
            if write {
                prot |= rustix::mm::MprotectFlags::WRITE;
            }
            log::trace!("mprotect {from:#x}..{to:#x} {prot:?}");
            unsafe {
                rustix::mm::mprotect(base.add(from).cast(), to - from, prot)?;
            }
        }

        // make the unwinder aware of the generated frames; a section
        // holding only the CIE has no FDE to register
        let eh_frame = &assembler.sections[assembler.sec_eh_frame];
        if eh_frame.size() > u64::from(assembler.eh_first_fde_off) {
            let off = sec_addrs[assembler.sec_eh_frame.index()] as u32
                + assembler.eh_first_fde_off;
            unsafe {
                __register_frame(base.add(off as usize));
            }
            self.registered_frame = Some(off);
        }
        Ok(())
    }
}

impl Drop for ElfMapper {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Lazily synthesized PLT/GOT slots, one per symbol.
struct PltState {
    next: *mut u8,
    slots: Vec<*mut u8>,
    left: usize,
}

impl PltState {
    /// Address of the jump stub for the symbol at `sym_idx`, creating it
    /// on first use with `addr` as its target.
    fn plt_entry(&mut self, sym_idx: usize, addr: usize) -> usize {
        if self.slots[sym_idx].is_null() {
            debug_assert!(self.left > 0, "insufficient PLT/GOT slots");
            self.left -= 1;
            unsafe {
                write_plt_stub(self.next, addr);
            }
            self.slots[sym_idx] = self.next;
            self.next = unsafe { self.next.add(PLT_ENTRY_SIZE) };
        }
        self.slots[sym_idx] as usize
    }

    /// Address of the GOT word of the symbol at `sym_idx`.
    fn got_entry(&mut self, sym_idx: usize, addr: usize) -> usize {
        self.plt_entry(sym_idx, addr) + 8
    }
}

fn align_up(x: usize, to: usize) -> usize {
    (x + to - 1) & !(to - 1)
}

fn page_size() -> usize {
    rustix::param::page_size()
}

fn host_machine_matches(elf_machine: u16) -> bool {
    match elf_machine {
        object::elf::EM_X86_64 => cfg!(target_arch = "x86_64"),
        object::elf::EM_AARCH64 => cfg!(target_arch = "aarch64"),
        _ => false,
    }
}

fn sext(v: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((v << shift) as i64) >> shift
}

/// Write one PLT/GOT stub: an indirect jump through the absolute address
/// stored in its second eight bytes.
///
/// # Safety
/// `at` must point to `PLT_ENTRY_SIZE` writable bytes.
unsafe fn write_plt_stub(at: *mut u8, addr: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        // jmp [rip + 2]; ud2; <address>
        let stub: [u8; 8] = [0xff, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0f, 0x0b];
        ptr::copy_nonoverlapping(stub.as_ptr(), at, 8);
    }
    #[cfg(target_arch = "aarch64")]
    {
        // ldr x16, .+8; br x16; <address>
        let insts: [u32; 2] = [0x5800_0050, 0xd61f_0200];
        ptr::copy_nonoverlapping(insts.as_ptr().cast::<u8>(), at, 8);
    }
    ptr::copy_nonoverlapping(addr.to_ne_bytes().as_ptr(), at.add(8), 8);
}

fn blend(pc: *mut u8, mask: u32, data: u32) {
    unsafe {
        let cur = ptr::read_unaligned(pc.cast::<u32>());
        ptr::write_unaligned(pc.cast::<u32>(), (data & mask) | (cur & !mask));
    }
}

#[cfg(target_arch = "x86_64")]
fn resolve_reloc(
    sec_addr: *mut u8,
    reloc: &Reloc,
    sym: usize,
    sym_idx: usize,
    plt: &mut PltState,
) -> Result<(), MapError> {
    use object::elf::*;

    let syma = (sym as i64).wrapping_add(reloc.addend) as u64;
    let pc = unsafe { sec_addr.add(reloc.offset as usize) };
    let out_of_range = || MapError::RelocOutOfRange {
        kind: reloc.kind,
        offset: reloc.offset,
    };

    match reloc.kind {
        R_X86_64_64 => unsafe {
            ptr::write_unaligned(pc.cast::<u64>(), syma);
        },
        R_X86_64_PC32 => {
            let v = syma.wrapping_sub(pc as u64);
            if sext(v, 32) != v as i64 {
                return Err(out_of_range());
            }
            unsafe { ptr::write_unaligned(pc.cast::<u32>(), v as u32) };
        }
        R_X86_64_PLT32 => {
            let mut v = syma.wrapping_sub(pc as u64);
            if sext(v, 32) != v as i64 {
                // redirect the call through a synthesized PLT stub
                v = (plt.plt_entry(sym_idx, sym) as u64)
                    .wrapping_add(reloc.addend as u64)
                    .wrapping_sub(pc as u64);
            }
            if sext(v, 32) != v as i64 {
                return Err(out_of_range());
            }
            unsafe { ptr::write_unaligned(pc.cast::<u32>(), v as u32) };
        }
        R_X86_64_GOTPCREL | R_X86_64_TLSGD => {
            // general-dynamic TLS reuses the GOT slot as the argument
            // block handed to the (resolver-supplied) __tls_get_addr
            let got = plt.got_entry(sym_idx, sym) as u64;
            let v = got.wrapping_add(reloc.addend as u64).wrapping_sub(pc as u64);
            if sext(v, 32) != v as i64 {
                return Err(out_of_range());
            }
            unsafe { ptr::write_unaligned(pc.cast::<u32>(), v as u32) };
        }
        kind => return Err(MapError::UnsupportedReloc(kind)),
    }
    Ok(())
}

#[cfg(target_arch = "aarch64")]
fn resolve_reloc(
    sec_addr: *mut u8,
    reloc: &Reloc,
    sym: usize,
    sym_idx: usize,
    plt: &mut PltState,
) -> Result<(), MapError> {
    use object::elf::*;

    let syma = (sym as i64).wrapping_add(reloc.addend) as u64;
    let pc = unsafe { sec_addr.add(reloc.offset as usize) };
    let out_of_range = || MapError::RelocOutOfRange {
        kind: reloc.kind,
        offset: reloc.offset,
    };

    match reloc.kind {
        R_AARCH64_ABS64 => unsafe {
            ptr::write_unaligned(pc.cast::<u64>(), syma);
        },
        R_AARCH64_PREL32 => {
            let v = syma.wrapping_sub(pc as u64);
            if sext(v, 32) != v as i64 {
                return Err(out_of_range());
            }
            unsafe { ptr::write_unaligned(pc.cast::<u32>(), v as u32) };
        }
        R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
            let mut v = syma.wrapping_sub(pc as u64);
            if v & 3 != 0 || sext(v, 28) != v as i64 {
                v = (plt.plt_entry(sym_idx, sym) as u64)
                    .wrapping_add(reloc.addend as u64)
                    .wrapping_sub(pc as u64);
            }
            if sext(v, 28) != v as i64 {
                return Err(out_of_range());
            }
            blend(pc, 0x03ff_ffff, (v >> 2) as u32);
        }
        R_AARCH64_ADR_PREL_PG_HI21 => {
            let v = (syma & !0xfff).wrapping_sub(pc as u64 & !0xfff);
            if sext(v, 33) != v as i64 {
                return Err(out_of_range());
            }
            let v = (v as i64 >> 12) as u64;
            blend(
                pc,
                0x60ff_ffe0,
                (((v & 3) << 29) | (((v >> 2) & 0x7_ffff) << 5)) as u32,
            );
        }
        R_AARCH64_ADD_ABS_LO12_NC => {
            blend(pc, 0xfff << 10, ((syma & 0xfff) << 10) as u32);
        }
        R_AARCH64_LDST128_ABS_LO12_NC => {
            blend(pc, 0xfff << 10, (((syma & 0xfff) >> 4) << 10) as u32);
        }
        R_AARCH64_ADR_GOT_PAGE => {
            let got = plt.got_entry(sym_idx, sym) as u64;
            let v = (got & !0xfff).wrapping_sub(pc as u64 & !0xfff);
            if sext(v, 33) != v as i64 {
                return Err(out_of_range());
            }
            let v = (v as i64 >> 12) as u64;
            blend(
                pc,
                0x60ff_ffe0,
                (((v & 3) << 29) | (((v >> 2) & 0x7_ffff) << 5)) as u32,
            );
        }
        R_AARCH64_LD64_GOT_LO12_NC => {
            let got = plt.got_entry(sym_idx, sym) as u64;
            blend(pc, 0xfff << 10, (((got & 0xfff) >> 3) << 10) as u32);
        }
        R_AARCH64_TLSDESC_ADR_PAGE21 => {
            // the TLS descriptor lives in the symbol's GOT slot; the
            // resolver-supplied address stands in for the descriptor
            let got = plt.got_entry(sym_idx, sym) as u64;
            let v = (got & !0xfff).wrapping_sub(pc as u64 & !0xfff);
            if sext(v, 33) != v as i64 {
                return Err(out_of_range());
            }
            let v = (v as i64 >> 12) as u64;
            blend(
                pc,
                0x60ff_ffe0,
                (((v & 3) << 29) | (((v >> 2) & 0x7_ffff) << 5)) as u32,
            );
        }
        R_AARCH64_TLSDESC_LD64_LO12 => {
            let got = plt.got_entry(sym_idx, sym) as u64;
            blend(pc, 0xfff << 10, (((got & 0xfff) >> 3) << 10) as u32);
        }
        R_AARCH64_TLSDESC_ADD_LO12 => {
            let got = plt.got_entry(sym_idx, sym) as u64;
            blend(pc, 0xfff << 10, ((got & 0xfff) << 10) as u32);
        }
        R_AARCH64_TLSDESC_CALL => {
            // a relaxation marker on the blr; nothing to patch
        }
        kind => return Err(MapError::UnsupportedReloc(kind)),
    }
    Ok(())
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn resolve_reloc(
    _sec_addr: *mut u8,
    reloc: &Reloc,
    _sym: usize,
    _sym_idx: usize,
    _plt: &mut PltState,
) -> Result<(), MapError> {
    Err(MapError::UnsupportedReloc(reloc.kind))
}
