//! The ELF assembler: section builder, symbol table, relocations, and the
//! text writer the encoders stream into.
//!
//! The assembler accumulates state for a whole translation unit; the
//! per-function compilers append to the text section through a reserve
//! window (`ensure_space` grows the backing buffer in 16 KiB chunks, after
//! which encoders may write without per-instruction bounds checks). At the
//! end, [`Assembler::finish`] serializes a relocatable little-endian ELF64
//! object through the `object` crate, or the JIT mapper consumes the
//! in-memory sections directly.
//!
//! Symbols are referenced through [`SymRef`] handles that carry a
//! local-or-global bit in the high bit of a 32-bit index; local and global
//! symbols live in separate arrays and are merged only on serialization
//! (ELF requires all local symbols to precede the globals).

use object::write::{Object, SectionId, StandardSegment, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SectionKind, SymbolKind, SymbolScope,
};
use tarmac_entity::{entity_impl, EntityRef, PrimaryMap, SecondaryMap};

use crate::bitset::BitSet;
use crate::error::CodegenError;

/// A reference to a section of the assembler.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecRef(u32);
entity_impl!(SecRef, "sec");

/// A reference to a symbol; the high bit selects the global symbol array.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SymRef(u32);

const SYM_GLOBAL_BIT: u32 = 0x8000_0000;

impl SymRef {
    /// Sentinel for "no symbol".
    pub const INVALID: SymRef = SymRef(0x7fff_ffff);

    /// Does this handle name a local symbol?
    #[inline]
    pub fn is_local(self) -> bool {
        self.0 & SYM_GLOBAL_BIT == 0
    }

    /// The index into the local or global symbol array.
    #[inline]
    pub fn idx(self) -> usize {
        (self.0 & !SYM_GLOBAL_BIT) as usize
    }

    fn local(idx: usize) -> Self {
        debug_assert!((idx as u32) < SYM_GLOBAL_BIT);
        SymRef(idx as u32)
    }

    fn global(idx: usize) -> Self {
        debug_assert!((idx as u32) < SYM_GLOBAL_BIT);
        SymRef(idx as u32 | SYM_GLOBAL_BIT)
    }
}

/// Symbol binding.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SymBinding {
    /// Not visible outside the object.
    Local,
    /// Visible everywhere.
    Global,
    /// Visible everywhere, overridable.
    Weak,
}

/// What a symbol names.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SymType {
    /// Untyped.
    None,
    /// A function in the text section.
    Func,
    /// A data object.
    Object,
    /// The section itself (used as relocation anchor).
    Section,
}

/// One symbol table entry.
pub struct Symbol {
    name: (u32, u32),
    /// Binding of the symbol.
    pub binding: SymBinding,
    /// Type of the symbol.
    pub kind: SymType,
    /// Defining section, or `None` while undefined.
    pub section: Option<SecRef>,
    /// Offset inside the defining section.
    pub value: u64,
    /// Size in bytes.
    pub size: u64,
}

/// A relocation record against a section.
#[derive(Clone, Copy, Debug)]
pub struct Reloc {
    /// Offset of the relocated field inside the section.
    pub offset: u64,
    /// The referenced symbol.
    pub sym: SymRef,
    /// Raw ELF relocation type (`R_X86_64_*` / `R_AARCH64_*`).
    pub kind: u32,
    /// Constant added to the symbol value.
    pub addend: i64,
}

/// A section being built.
pub struct Section {
    /// ELF section name.
    pub name: &'static str,
    /// Contents (zero-length for NOBITS).
    pub data: Vec<u8>,
    /// Relocations against this section.
    pub relocs: Vec<Reloc>,
    /// Section alignment.
    pub align: u64,
    /// Mapped into memory at run time?
    pub is_alloc: bool,
    /// Executable?
    pub is_exec: bool,
    /// Writable?
    pub is_write: bool,
    /// Occupies no file space (`.bss`-style)?
    pub is_nobits: bool,
    /// Size for NOBITS sections (otherwise `data.len()` governs).
    pub nobits_size: u64,
    /// The section symbol used as relocation anchor.
    pub sym: SymRef,
    kind: SectionKind,
}

impl Section {
    /// Current size of the section in bytes.
    pub fn size(&self) -> u64 {
        if self.is_nobits {
            self.nobits_size
        } else {
            self.data.len() as u64
        }
    }
}

/// Per-architecture parameters of the assembler.
pub struct TargetInfo {
    /// `e_machine` of emitted objects (62 for x86-64, 183 for aarch64).
    pub elf_machine: u16,
    /// DWARF code alignment factor of the CIE.
    pub eh_code_align: u8,
    /// DWARF return address register number.
    pub eh_ra_reg: u8,
    /// Initial CFA rule instructions of the CIE.
    pub eh_initial_instrs: &'static [u8],
    /// `R_*_PC32`-class relocation used for the FDE function pointer.
    pub reloc_pc32: u32,
}

/// A code label: a dense index into an offset table. Unresolved labels
/// keep a linked list of pending patch sites, each tagged with a *kind*
/// describing the branch form at the site (different kinds have different
/// reach and need different veneer strategies).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);
entity_impl!(Label, "label");

/// A pending patch site for an unplaced label.
#[derive(Clone, Copy)]
pub struct LabelFixup {
    /// Text offset of the instruction (or table entry) to patch.
    pub text_off: u32,
    /// Architecture-defined fixup kind.
    pub kind: u8,
    next: u32,
}

const NO_ENTRY: u32 = u32::MAX;

/// Label storage shared by the architecture back-ends. While a label is
/// pending, its offset-table slot holds the head of its fixup list.
pub struct LabelTable {
    offsets: SecondaryMap<Label, u32>,
    pending: BitSet,
    fixups: Vec<LabelFixup>,
    free_head: u32,
}

impl Default for LabelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LabelTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            offsets: SecondaryMap::with_default(NO_ENTRY),
            pending: BitSet::new(),
            fixups: Vec::new(),
            free_head: NO_ENTRY,
        }
    }

    /// Allocate a fresh, unplaced label.
    pub fn create(&mut self) -> Label {
        let label = Label(self.pending.len() as u32);
        self.offsets[label] = NO_ENTRY;
        self.pending.push(true);
        label
    }

    /// Has `label` not been placed yet?
    pub fn is_pending(&self, label: Label) -> bool {
        self.pending.contains(label.0 as usize)
    }

    /// The resolved text offset of `label`.
    pub fn offset(&self, label: Label) -> u32 {
        debug_assert!(!self.is_pending(label));
        self.offsets[label]
    }

    /// Queue a patch site for the pending `label`.
    pub fn add_fixup(&mut self, label: Label, text_off: u32, kind: u8) {
        debug_assert!(self.is_pending(label));
        let head = self.offsets[label];
        let entry = if self.free_head != NO_ENTRY {
            let entry = self.free_head;
            self.free_head = self.fixups[entry as usize].next;
            self.fixups[entry as usize] = LabelFixup {
                text_off,
                kind,
                next: head,
            };
            entry
        } else {
            self.fixups.push(LabelFixup {
                text_off,
                kind,
                next: head,
            });
            (self.fixups.len() - 1) as u32
        };
        self.offsets[label] = entry;
    }

    /// Place `label` at `text_off`, handing every queued fixup to
    /// `patch` and recycling the list entries.
    pub fn place(&mut self, label: Label, text_off: u32, mut patch: impl FnMut(LabelFixup)) {
        debug_assert!(self.is_pending(label));
        let mut cur = self.offsets[label];
        while cur != NO_ENTRY {
            let fixup = self.fixups[cur as usize];
            patch(fixup);
            let next = fixup.next;
            self.fixups[cur as usize].next = self.free_head;
            self.free_head = cur;
            cur = next;
        }
        self.offsets[label] = text_off;
        self.pending.remove(label.0 as usize);
    }

    /// Drop all labels.
    pub fn clear(&mut self) {
        self.offsets.clear();
        self.pending.clear();
        self.fixups.clear();
        self.free_head = NO_ENTRY;
    }
}

/// The architecture-independent ELF assembler state.
pub struct Assembler {
    target: TargetInfo,
    /// All sections.
    pub sections: PrimaryMap<SecRef, Section>,
    /// `.text`.
    pub sec_text: SecRef,
    /// `.data`.
    pub sec_data: SecRef,
    /// `.rodata`.
    pub sec_rodata: SecRef,
    /// `.data.rel.ro`.
    pub sec_relro: SecRef,
    /// `.init_array`.
    pub sec_init_array: SecRef,
    /// `.fini_array`.
    pub sec_fini_array: SecRef,
    /// `.eh_frame`.
    pub sec_eh_frame: SecRef,
    /// Local symbols; index 0 is the null symbol.
    pub local_symbols: Vec<Symbol>,
    /// Global and weak symbols.
    pub global_symbols: Vec<Symbol>,
    strtab: Vec<u8>,
    /// Write cursor into the text section. Bytes past it up to
    /// `data.len()` are reserved.
    text_off: usize,
    /// Offset of the first FDE in `.eh_frame` (the CIE precedes it); the
    /// mapper registers frames starting here.
    pub eh_first_fde_off: u32,
}

impl Assembler {
    /// Create an assembler for the given target.
    pub fn new(target: TargetInfo) -> Self {
        let mut asm = Self {
            target,
            sections: PrimaryMap::new(),
            sec_text: SecRef::from_u32(0),
            sec_data: SecRef::from_u32(0),
            sec_rodata: SecRef::from_u32(0),
            sec_relro: SecRef::from_u32(0),
            sec_init_array: SecRef::from_u32(0),
            sec_fini_array: SecRef::from_u32(0),
            sec_eh_frame: SecRef::from_u32(0),
            local_symbols: Vec::new(),
            global_symbols: Vec::new(),
            strtab: vec![0],
            text_off: 0,
            eh_first_fde_off: 0,
        };
        asm.init();
        asm
    }

    fn init(&mut self) {
        // null symbol
        self.local_symbols.push(Symbol {
            name: (0, 0),
            binding: SymBinding::Local,
            kind: SymType::None,
            section: None,
            value: 0,
            size: 0,
        });

        self.sec_text = self.add_section(".text", SectionKind::Text, 16, true, false);
        self.sec_data = self.add_section(".data", SectionKind::Data, 16, false, true);
        self.sec_rodata = self.add_section(".rodata", SectionKind::ReadOnlyData, 16, false, false);
        self.sec_relro = self.add_section(".data.rel.ro", SectionKind::Data, 16, false, true);
        self.sec_init_array = self.add_section(
            ".init_array",
            SectionKind::Elf(object::elf::SHT_INIT_ARRAY),
            8,
            false,
            true,
        );
        self.sec_fini_array = self.add_section(
            ".fini_array",
            SectionKind::Elf(object::elf::SHT_FINI_ARRAY),
            8,
            false,
            true,
        );
        self.sec_eh_frame = self.add_section(".eh_frame", SectionKind::ReadOnlyData, 8, false, false);

        self.eh_init_cie();
    }

    fn add_section(
        &mut self,
        name: &'static str,
        kind: SectionKind,
        align: u64,
        is_exec: bool,
        is_write: bool,
    ) -> SecRef {
        let sec = self.sections.next_key();
        let sym = SymRef::local(self.local_symbols.len());
        self.local_symbols.push(Symbol {
            name: (0, 0),
            binding: SymBinding::Local,
            kind: SymType::Section,
            section: Some(sec),
            value: 0,
            size: 0,
        });
        self.sections.push(Section {
            name,
            data: Vec::new(),
            relocs: Vec::new(),
            align,
            is_alloc: true,
            is_exec,
            is_write,
            is_nobits: false,
            nobits_size: 0,
            sym,
            kind,
        });
        sec
    }

    /// The target parameters.
    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    fn add_string(&mut self, name: &str) -> (u32, u32) {
        if name.is_empty() {
            return (0, 0);
        }
        let off = self.strtab.len() as u32;
        self.strtab.extend_from_slice(name.as_bytes());
        self.strtab.push(0);
        (off, name.len() as u32)
    }

    /// The name of `sym`.
    pub fn sym_name(&self, sym: SymRef) -> &str {
        let (off, len) = self.sym(sym).name;
        core::str::from_utf8(&self.strtab[off as usize..(off + len) as usize]).unwrap_or("")
    }

    /// Shared access to `sym`.
    pub fn sym(&self, sym: SymRef) -> &Symbol {
        if sym.is_local() {
            &self.local_symbols[sym.idx()]
        } else {
            &self.global_symbols[sym.idx()]
        }
    }

    fn sym_mut(&mut self, sym: SymRef) -> &mut Symbol {
        if sym.is_local() {
            &mut self.local_symbols[sym.idx()]
        } else {
            &mut self.global_symbols[sym.idx()]
        }
    }

    fn push_sym(&mut self, symbol: Symbol) -> SymRef {
        if matches!(symbol.binding, SymBinding::Local) {
            self.local_symbols.push(symbol);
            SymRef::local(self.local_symbols.len() - 1)
        } else {
            self.global_symbols.push(symbol);
            SymRef::global(self.global_symbols.len() - 1)
        }
    }

    /// Add an undefined symbol reference.
    pub fn sym_add_undef(&mut self, name: &str, binding: SymBinding) -> SymRef {
        let name = self.add_string(name);
        self.push_sym(Symbol {
            name,
            binding,
            kind: SymType::None,
            section: None,
            value: 0,
            size: 0,
        })
    }

    /// Predeclare a function symbol in the text section. Its value and
    /// size are patched by [`Assembler::sym_def`] once the body is
    /// emitted.
    pub fn sym_predef_func(&mut self, name: &str, binding: SymBinding) -> SymRef {
        debug_assert!(!name.is_empty());
        let name = self.add_string(name);
        let sec = self.sec_text;
        self.push_sym(Symbol {
            name,
            binding,
            kind: SymType::Func,
            section: Some(sec),
            value: 0,
            size: 0,
        })
    }

    /// Define `sym` at `[off, off+size)` of `sec`.
    pub fn sym_def(&mut self, sym: SymRef, sec: SecRef, off: u64, size: u64) {
        let s = self.sym_mut(sym);
        s.section = Some(sec);
        s.value = off;
        s.size = size;
    }

    /// Append `data` to a data section and define a symbol covering it.
    pub fn sym_def_data(
        &mut self,
        sec: SecRef,
        name: &str,
        data: &[u8],
        align: u64,
        binding: SymBinding,
    ) -> SymRef {
        let section = &mut self.sections[sec];
        debug_assert!(!section.is_nobits);
        let len = section.data.len() as u64;
        let off = (len + align - 1) & !(align - 1);
        section.data.resize(off as usize, 0);
        section.data.extend_from_slice(data);
        section.align = section.align.max(align);
        let name = self.add_string(name);
        let kind = SymType::Object;
        let size = data.len() as u64;
        self.push_sym(Symbol {
            name,
            binding,
            kind,
            section: Some(sec),
            value: off,
            size,
        })
    }

    /// Record a relocation in `sec`.
    pub fn reloc(&mut self, sec: SecRef, sym: SymRef, kind: u32, offset: u64, addend: i64) {
        self.sections[sec].relocs.push(Reloc {
            offset,
            sym,
            kind,
            addend,
        });
    }

    /// Record a relocation in the text section.
    pub fn reloc_text(&mut self, sym: SymRef, kind: u32, offset: u64, addend: i64) {
        let sec = self.sec_text;
        self.reloc(sec, sym, kind, offset, addend);
    }

    // --- text writer -----------------------------------------------------

    /// Current offset of the text write cursor.
    #[inline]
    pub fn text_cur_off(&self) -> u32 {
        self.text_off as u32
    }

    /// Bytes left in the text reserve window.
    #[inline]
    pub fn text_space_left(&self) -> usize {
        self.sections[self.sec_text].data.len() - self.text_off
    }

    /// Grow the text reserve window so `size` more bytes fit. Encoders
    /// may then emit up to `size` bytes with the `*_unchecked` writers.
    pub fn text_ensure_space(&mut self, size: usize) {
        let sec = &mut self.sections[self.sec_text];
        if sec.data.len() - self.text_off >= size {
            return;
        }
        let grow = (size + 16 * 1024 - 1) & !(16 * 1024 - 1);
        sec.data.resize(sec.data.len() + grow, 0);
    }

    /// Align the text cursor to 16 bytes (functions start aligned).
    pub fn text_align_16(&mut self) {
        self.text_ensure_space(16);
        self.text_off = (self.text_off + 15) & !15;
    }

    /// Write `bytes`, growing the window as needed.
    pub fn text_write(&mut self, bytes: &[u8]) {
        self.text_ensure_space(bytes.len());
        self.text_write_unchecked(bytes);
    }

    /// Write `bytes` into space reserved earlier.
    #[inline]
    pub fn text_write_unchecked(&mut self, bytes: &[u8]) {
        let off = self.text_off;
        let sec = &mut self.sections[self.sec_text];
        debug_assert!(sec.data.len() - off >= bytes.len(), "reserve window exhausted");
        sec.data[off..off + bytes.len()].copy_from_slice(bytes);
        self.text_off = off + bytes.len();
    }

    /// Write a 32-bit instruction word into reserved space.
    #[inline]
    pub fn text_write_u32(&mut self, inst: u32) {
        self.text_write_unchecked(&inst.to_le_bytes());
    }

    /// Advance the cursor over `n` reserved bytes, leaving them zeroed,
    /// and return the offset of the skipped range (to be patched later).
    pub fn text_skip(&mut self, n: usize) -> u32 {
        self.text_ensure_space(n);
        let off = self.text_off;
        self.text_off += n;
        off as u32
    }

    /// Move the cursor backwards; used when reserved epilogue space turns
    /// out partially unused.
    pub fn text_shrink_to(&mut self, off: u32) {
        debug_assert!((off as usize) <= self.text_off);
        self.text_off = off as usize;
    }

    /// Patch previously written text at `off`.
    pub fn text_patch(&mut self, off: u32, bytes: &[u8]) {
        let sec = &mut self.sections[self.sec_text];
        sec.data[off as usize..off as usize + bytes.len()].copy_from_slice(bytes);
    }

    /// Patch a 32-bit instruction word at `off`.
    #[inline]
    pub fn text_patch_u32(&mut self, off: u32, inst: u32) {
        self.text_patch(off, &inst.to_le_bytes());
    }

    /// Read a 32-bit word previously written at `off`.
    #[inline]
    pub fn text_read_u32(&self, off: u32) -> u32 {
        let d = &self.sections[self.sec_text].data;
        u32::from_le_bytes(d[off as usize..off as usize + 4].try_into().unwrap())
    }

    /// Copy `len` text bytes from `src` to `dst` (prologue/epilogue
    /// replication).
    pub fn text_copy_within(&mut self, src: u32, dst: u32, len: usize) {
        let sec = &mut self.sections[self.sec_text];
        sec.data
            .copy_within(src as usize..src as usize + len, dst as usize);
    }

    // --- serialization ---------------------------------------------------

    /// Reset the whole assembler for a fresh translation unit.
    pub fn reset(&mut self) {
        self.sections.clear();
        self.local_symbols.clear();
        self.global_symbols.clear();
        self.strtab.clear();
        self.strtab.push(0);
        self.text_off = 0;
        self.eh_first_fde_off = 0;
        self.init();
    }

    /// Serialize the accumulated sections into a relocatable ELF64
    /// object.
    pub fn finish(&mut self) -> Result<Vec<u8>, CodegenError> {
        // drop the unused tail of the text reserve window
        let text_len = self.text_off;
        self.sections[self.sec_text].data.truncate(text_len);

        let arch = match self.target.elf_machine {
            object::elf::EM_X86_64 => Architecture::X86_64,
            object::elf::EM_AARCH64 => Architecture::Aarch64,
            m => return Err(CodegenError::Unsupported(format!("ELF machine {m}"))),
        };
        let mut obj = Object::new(BinaryFormat::Elf, arch, Endianness::Little);

        let mut sec_ids: Vec<Option<SectionId>> = Vec::new();
        for (_, sec) in self.sections.iter() {
            if sec.size() == 0 && sec.relocs.is_empty() {
                sec_ids.push(None);
                continue;
            }
            let id = obj.add_section(
                obj.segment_name(StandardSegment::Data).to_vec(),
                sec.name.as_bytes().to_vec(),
                sec.kind,
            );
            if sec.is_nobits {
                obj.append_section_bss(id, sec.nobits_size, sec.align);
            } else {
                obj.append_section_data(id, &sec.data, sec.align);
            }
            // pin down the exact sh_flags instead of relying on the
            // kind-derived guesses
            let mut sh_flags = u64::from(object::elf::SHF_ALLOC);
            if sec.is_exec {
                sh_flags |= u64::from(object::elf::SHF_EXECINSTR);
            }
            if sec.is_write {
                sh_flags |= u64::from(object::elf::SHF_WRITE);
            }
            obj.section_mut(id).flags = object::SectionFlags::Elf { sh_flags };
            sec_ids.push(Some(id));
        }

        // non-executable stack marker
        obj.add_section(
            Vec::new(),
            b".note.GNU-stack".to_vec(),
            SectionKind::Metadata,
        );

        // locals first, then globals; object keeps this ordering in the
        // emitted symbol table
        let mut local_ids = Vec::with_capacity(self.local_symbols.len());
        let mut global_ids = Vec::with_capacity(self.global_symbols.len());
        for (symbols, ids) in [
            (&self.local_symbols, &mut local_ids),
            (&self.global_symbols, &mut global_ids),
        ] {
            for sym in symbols.iter() {
                if matches!(sym.kind, SymType::Section | SymType::None) && sym.name.1 == 0 {
                    // section and null symbols are materialized on demand
                    ids.push(None);
                    continue;
                }
                let (off, len) = sym.name;
                let name = self.strtab[off as usize..(off + len) as usize].to_vec();
                let section = match sym.section {
                    Some(sec) => match sec_ids[sec.index()] {
                        Some(id) => SymbolSection::Section(id),
                        None => SymbolSection::Undefined,
                    },
                    None => SymbolSection::Undefined,
                };
                let id = obj.add_symbol(object::write::Symbol {
                    name,
                    value: sym.value,
                    size: sym.size,
                    kind: match sym.kind {
                        SymType::Func => SymbolKind::Text,
                        SymType::Object => SymbolKind::Data,
                        SymType::None | SymType::Section => SymbolKind::Unknown,
                    },
                    scope: match sym.binding {
                        SymBinding::Local => SymbolScope::Compilation,
                        SymBinding::Global | SymBinding::Weak => SymbolScope::Dynamic,
                    },
                    weak: matches!(sym.binding, SymBinding::Weak),
                    section,
                    flags: object::SymbolFlags::None,
                });
                ids.push(Some(id));
            }
        }

        let sym_id = |asm: &Assembler, obj: &mut Object, sym: SymRef| {
            let record = asm.sym(sym);
            if let (SymType::Section, Some(sec)) = (record.kind, record.section) {
                let id = sec_ids[sec.index()].expect("relocation against empty section");
                return obj.section_symbol(id);
            }
            let slot = if sym.is_local() {
                local_ids[sym.idx()]
            } else {
                global_ids[sym.idx()]
            };
            slot.expect("relocation against unnamed symbol")
        };

        for (sec, id) in self.sections.iter().zip(sec_ids.iter()) {
            let Some(id) = *id else { continue };
            for reloc in &sec.1.relocs {
                let symbol = sym_id(self, &mut obj, reloc.sym);
                obj.add_relocation(
                    id,
                    object::write::Relocation {
                        offset: reloc.offset,
                        symbol,
                        addend: reloc.addend,
                        flags: RelocationFlags::Elf { r_type: reloc.kind },
                    },
                )
                .map_err(|e| CodegenError::Object(e.to_string()))?;
            }
        }

        obj.write().map_err(|e| CodegenError::Object(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Object, ObjectSection, ObjectSymbol};

    fn x64_target() -> TargetInfo {
        TargetInfo {
            elf_machine: object::elf::EM_X86_64,
            eh_code_align: 1,
            eh_ra_reg: 16,
            eh_initial_instrs: &[0x0c, 7, 8, 0x80 | 16, 1],
            reloc_pc32: object::elf::R_X86_64_PC32,
        }
    }

    #[test]
    fn sym_handles_split_local_and_global() {
        let mut asm = Assembler::new(x64_target());
        let g = asm.sym_add_undef("ext", SymBinding::Global);
        let l = asm.sym_predef_func("helper", SymBinding::Local);
        assert!(!g.is_local());
        assert!(l.is_local());
        assert_eq!(asm.sym_name(g), "ext");
        assert_eq!(asm.sym_name(l), "helper");
    }

    #[test]
    fn text_writer_reserve_and_patch() {
        let mut asm = Assembler::new(x64_target());
        asm.text_ensure_space(64);
        let off = asm.text_cur_off();
        asm.text_write_unchecked(&[0x90; 8]);
        asm.text_patch_u32(off, 0xdead_beef);
        assert_eq!(asm.text_read_u32(off), 0xdead_beef);
        assert_eq!(asm.text_cur_off(), off + 8);
        // growth happens in 16 KiB chunks
        assert!(asm.text_space_left() >= 16 * 1024 - 8);
    }

    #[test]
    fn labels_patch_pending_sites() {
        let mut table = LabelTable::new();
        let label = table.create();
        assert!(table.is_pending(label));
        table.add_fixup(label, 4, 0);
        table.add_fixup(label, 12, 1);
        let mut seen = Vec::new();
        table.place(label, 32, |fixup| seen.push((fixup.text_off, fixup.kind)));
        seen.sort();
        assert_eq!(seen, vec![(4, 0), (12, 1)]);
        assert!(!table.is_pending(label));
        assert_eq!(table.offset(label), 32);
    }

    #[test]
    fn roundtrip_through_object_reader() {
        let mut asm = Assembler::new(x64_target());
        let func = asm.sym_predef_func("f", SymBinding::Global);
        let ext = asm.sym_add_undef("g", SymBinding::Global);

        asm.text_align_16();
        let start = asm.text_cur_off();
        asm.text_write(&[0xe8, 0, 0, 0, 0, 0xc3]);
        asm.reloc_text(ext, object::elf::R_X86_64_PLT32, u64::from(start) + 1, -4);
        let text = asm.sec_text;
        asm.sym_def(func, text, u64::from(start), 6);

        let rodata = asm.sec_rodata;
        let data_sym =
            asm.sym_def_data(rodata, "tbl", &[1, 2, 3, 4], 4, SymBinding::Local);
        assert!(data_sym.is_local());

        let bytes = asm.finish().unwrap();
        let file = object::File::parse(bytes.as_slice()).unwrap();

        let text_sec = file.section_by_name(".text").unwrap();
        assert_eq!(text_sec.size(), 6);
        assert_eq!(&text_sec.data().unwrap()[..6], &[0xe8, 0, 0, 0, 0, 0xc3]);
        assert_eq!(text_sec.relocations().count(), 1);

        let rodata_sec = file.section_by_name(".rodata").unwrap();
        assert_eq!(rodata_sec.data().unwrap(), &[1, 2, 3, 4]);

        assert!(file.section_by_name(".note.GNU-stack").is_some());
        assert!(file.section_by_name(".eh_frame").is_some());

        let mut names: Vec<_> = file
            .symbols()
            .filter_map(|s| s.name().ok().map(str::to_string))
            .collect();
        names.retain(|n| !n.is_empty());
        assert!(names.contains(&"f".to_string()));
        assert!(names.contains(&"g".to_string()));
        assert!(names.contains(&"tbl".to_string()));

        // local symbols precede globals in the emitted table
        let f_sym = file.symbols().find(|s| s.name() == Ok("f")).unwrap();
        let tbl_sym = file.symbols().find(|s| s.name() == Ok("tbl")).unwrap();
        assert!(tbl_sym.index().0 < f_sym.index().0);
        assert!(f_sym.is_global());
        assert!(!tbl_sym.is_global());
    }
}
