//! Streaming DWARF call-frame-information writer for `.eh_frame`.
//!
//! One CIE is written when the assembler is created (augmentation `zR`,
//! FDE pointer encoding `pcrel|sdata4`, per-architecture code alignment
//! and return-address register, data alignment −8). Per function, the
//! prologue writer opens an FDE, streams `DW_CFA_*` instructions while it
//! synthesizes the prologue, and closes the FDE once the function size is
//! known. The FDE's function pointer field carries a 32-bit PC-relative
//! relocation against the text section symbol so objects stay
//! relocatable.

use gimli::constants as dw;

use crate::assembler::{Assembler, SymRef};

/// Offset of the function-start field inside an FDE.
pub const EH_FDE_FUNC_START_OFF: u32 = 8;

/// High-two-bits primary opcodes embed their first operand in the opcode
/// byte.
const CFI_PRIMARY_OPCODE_MASK: u8 = 0xc0;

impl Assembler {
    fn eh_data(&mut self) -> &mut Vec<u8> {
        let sec = self.sec_eh_frame;
        &mut self.sections[sec].data
    }

    /// Append a ULEB128 to the `.eh_frame` stream.
    pub fn eh_write_uleb(&mut self, value: u64) {
        gimli::leb128::write::unsigned(self.eh_data(), value).expect("write to Vec");
    }

    /// Append an SLEB128 to the `.eh_frame` stream.
    pub fn eh_write_sleb(&mut self, value: i64) {
        gimli::leb128::write::signed(self.eh_data(), value).expect("write to Vec");
    }

    /// Append one CFI instruction with a single operand.
    pub fn eh_write_inst(&mut self, opcode: dw::DwCfa, arg: u64) {
        let op = opcode.0;
        if op & CFI_PRIMARY_OPCODE_MASK != 0 {
            debug_assert_eq!(arg & u64::from(CFI_PRIMARY_OPCODE_MASK), 0);
            self.eh_data().push(op | arg as u8);
        } else {
            self.eh_data().push(op);
            self.eh_write_uleb(arg);
        }
    }

    /// Append one CFI instruction with two operands.
    pub fn eh_write_inst2(&mut self, opcode: dw::DwCfa, first: u64, second: u64) {
        self.eh_write_inst(opcode, first);
        self.eh_write_uleb(second);
    }

    /// Pad the current frame record to an 8-byte boundary with nops.
    fn eh_align_frame(&mut self) {
        while self.eh_data().len() & 7 != 0 {
            self.eh_data().push(dw::DW_CFA_nop.0);
        }
    }

    fn eh_patch_u32(&mut self, off: u32, value: u32) {
        let data = self.eh_data();
        data[off as usize..off as usize + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Write the single CIE. Called on construction and reset.
    pub(crate) fn eh_init_cie(&mut self) {
        let code_align = self.target().eh_code_align;
        let ra_reg = self.target().eh_ra_reg;
        let initial: &[u8] = self.target().eh_initial_instrs;

        {
            let data = self.eh_data();
            debug_assert!(data.is_empty());
            // length, patched below
            data.extend_from_slice(&[0; 4]);
            // a zero ID marks a CIE
            data.extend_from_slice(&[0; 4]);
            // version
            data.push(1);
            // augmentation: the 'z' field (augmentation data length) and
            // an 'R' pointer-encoding octet, no personality
            data.extend_from_slice(b"zR\0");
            data.push(code_align);
        }
        self.eh_write_sleb(-8);
        {
            let data = self.eh_data();
            data.push(ra_reg);
            // augmentation data: one byte holding the FDE pointer encoding
            data.push(1);
            data.push(dw::DW_EH_PE_pcrel.0 | dw::DW_EH_PE_sdata4.0);
            data.extend_from_slice(initial);
        }

        self.eh_align_frame();
        let len = self.eh_data().len() as u32 - 4;
        self.eh_patch_u32(0, len);
        self.eh_first_fde_off = self.eh_data().len() as u32;
    }

    /// Open an FDE for the current function and return its offset. CFI
    /// instructions streamed afterwards belong to this FDE until
    /// [`Assembler::eh_end_fde`].
    pub fn eh_begin_fde(&mut self) -> u32 {
        let fde_off = self.eh_data().len() as u32;
        // length (patched), CIE pointer, func_start (relocated),
        // func_size (patched), augmentation data length 0
        self.eh_data().extend_from_slice(&[0; 4]);
        let cie_ptr = fde_off + 4;
        self.eh_data().extend_from_slice(&cie_ptr.to_le_bytes());
        self.eh_data().extend_from_slice(&[0; 4]);
        self.eh_data().extend_from_slice(&[0; 4]);
        self.eh_data().push(0);
        fde_off
    }

    /// Close the FDE opened at `fde_off`: patch the function size and
    /// record length, and relocate the function pointer against the text
    /// section (the symbol must be defined by now).
    pub fn eh_end_fde(&mut self, fde_off: u32, func: SymRef) {
        let (func_off, func_size) = {
            let sym = self.sym(func);
            (sym.value, sym.size)
        };
        self.eh_patch_u32(fde_off + 12, func_size as u32);

        let text_sym = self.sections[self.sec_text].sym;
        let pc32 = self.target().reloc_pc32;
        let sec = self.sec_eh_frame;
        self.reloc(
            sec,
            text_sym,
            pc32,
            u64::from(fde_off + EH_FDE_FUNC_START_OFF),
            func_off as i64,
        );

        self.eh_align_frame();
        let len = self.eh_data().len() as u32 - fde_off - 4;
        self.eh_patch_u32(fde_off, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::TargetInfo;

    fn test_target() -> TargetInfo {
        TargetInfo {
            elf_machine: object::elf::EM_X86_64,
            eh_code_align: 1,
            eh_ra_reg: 16,
            eh_initial_instrs: &[dw::DW_CFA_def_cfa.0, 7, 8, dw::DW_CFA_offset.0 | 16, 1],
            reloc_pc32: object::elf::R_X86_64_PC32,
        }
    }

    #[test]
    fn cie_shape() {
        let asm = Assembler::new(test_target());
        let data = &asm.sections[asm.sec_eh_frame].data;
        // length covers everything after the length field
        let len = u32::from_le_bytes(data[0..4].try_into().unwrap());
        assert_eq!(len as usize + 4, data.len());
        assert_eq!(data.len() % 8, 0);
        // CIE id
        assert_eq!(&data[4..8], &[0, 0, 0, 0]);
        // version and augmentation
        assert_eq!(data[8], 1);
        assert_eq!(&data[9..12], b"zR\0");
        // code alignment 1, data alignment -8 (0x78), RA 16
        assert_eq!(data[12], 1);
        assert_eq!(data[13], 0x78);
        assert_eq!(data[14], 16);
        assert_eq!(asm.eh_first_fde_off as usize, data.len());
    }

    #[test]
    fn fde_length_and_reloc() {
        let mut asm = Assembler::new(test_target());
        let func = asm.sym_predef_func("f", crate::assembler::SymBinding::Global);
        let text = asm.sec_text;
        asm.sym_def(func, text, 16, 32);
        let fde = asm.eh_begin_fde();
        asm.eh_write_inst(dw::DW_CFA_advance_loc, 1);
        asm.eh_write_inst(dw::DW_CFA_def_cfa_offset, 16);
        asm.eh_end_fde(fde, func);

        let sec = &asm.sections[asm.sec_eh_frame];
        let data = &sec.data;
        let len =
            u32::from_le_bytes(data[fde as usize..fde as usize + 4].try_into().unwrap());
        assert_eq!(fde + 4 + len, data.len() as u32);
        // function size patched at fde+12
        let size = u32::from_le_bytes(
            data[fde as usize + 12..fde as usize + 16].try_into().unwrap(),
        );
        assert_eq!(size, 32);
        // one relocation at the func_start field, addend = function offset
        assert_eq!(sec.relocs.len(), 1);
        assert_eq!(sec.relocs[0].offset, u64::from(fde + EH_FDE_FUNC_START_OFF));
        assert_eq!(sec.relocs[0].addend, 16);
    }
}
