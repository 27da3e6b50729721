//! AArch64 instruction word encoders.
//!
//! Every function returns one 32-bit instruction. Register operands are
//! hardware encodings (0..31); encoding 31 means SP or XZR depending on
//! the instruction class, which the callers pick deliberately.

/// Condition codes for `B.cond`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[allow(missing_docs)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Cs = 2,
    Cc = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl Cond {
    /// The opposite condition.
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => Cond::Al,
        }
    }
}

#[inline]
fn rd(r: u8) -> u32 {
    u32::from(r & 31)
}

#[inline]
fn rn(r: u8) -> u32 {
    u32::from(r & 31) << 5
}

#[inline]
fn rm(r: u8) -> u32 {
    u32::from(r & 31) << 16
}

/// `MOVZ` with a left-shifted 16-bit immediate; `sf` selects the 64-bit
/// form.
pub fn enc_movz(sf: bool, r: u8, imm16: u16, hw: u8) -> u32 {
    0x5280_0000 | (u32::from(sf) << 31) | (u32::from(hw) << 21) | (u32::from(imm16) << 5) | rd(r)
}

/// `MOVK`.
pub fn enc_movk(sf: bool, r: u8, imm16: u16, hw: u8) -> u32 {
    0x7280_0000 | (u32::from(sf) << 31) | (u32::from(hw) << 21) | (u32::from(imm16) << 5) | rd(r)
}

/// `MOVN`.
pub fn enc_movn(sf: bool, r: u8, imm16: u16, hw: u8) -> u32 {
    0x1280_0000 | (u32::from(sf) << 31) | (u32::from(hw) << 21) | (u32::from(imm16) << 5) | rd(r)
}

/// `ADD Xd, Xn, #imm12` (optionally shifted by 12); valid for SP
/// operands.
pub fn enc_add_imm(r: u8, n: u8, imm12: u32, shift12: bool) -> u32 {
    debug_assert!(imm12 < 0x1000);
    0x9100_0000 | (u32::from(shift12) << 22) | (imm12 << 10) | rn(n) | rd(r)
}

/// `SUB Xd, Xn, #imm12`.
pub fn enc_sub_imm(r: u8, n: u8, imm12: u32, shift12: bool) -> u32 {
    debug_assert!(imm12 < 0x1000);
    0xd100_0000 | (u32::from(shift12) << 22) | (imm12 << 10) | rn(n) | rd(r)
}

/// `ADD Xd, Xn, Xm, LSL #shift`.
pub fn enc_add_reg(r: u8, n: u8, m: u8, shift: u8) -> u32 {
    0x8b00_0000 | rm(m) | (u32::from(shift) << 10) | rn(n) | rd(r)
}

/// `SUB Xd, Xn, Xm`.
pub fn enc_sub_reg(r: u8, n: u8, m: u8) -> u32 {
    0xcb00_0000 | rm(m) | rn(n) | rd(r)
}

/// `CMP Xn, Xm` (`SUBS XZR, Xn, Xm`).
pub fn enc_cmp_reg(n: u8, m: u8) -> u32 {
    0xeb00_0000 | rm(m) | rn(n) | 31
}

/// `AND Xd, Xn, Xm`.
pub fn enc_and_reg(r: u8, n: u8, m: u8) -> u32 {
    0x8a00_0000 | rm(m) | rn(n) | rd(r)
}

/// `ORR Xd, Xn, Xm`.
pub fn enc_orr_reg(r: u8, n: u8, m: u8) -> u32 {
    0xaa00_0000 | rm(m) | rn(n) | rd(r)
}

/// `EOR Xd, Xn, Xm`.
pub fn enc_eor_reg(r: u8, n: u8, m: u8) -> u32 {
    0xca00_0000 | rm(m) | rn(n) | rd(r)
}

/// `MADD Xd, Xn, Xm, Xa` (`MUL` when `a` is XZR).
pub fn enc_madd(r: u8, n: u8, m: u8, a: u8) -> u32 {
    0x9b00_0000 | rm(m) | (u32::from(a & 31) << 10) | rn(n) | rd(r)
}

/// `MOV Xd, Xm` (register form, `ORR Xd, XZR, Xm`).
pub fn enc_mov_reg(sf: bool, r: u8, m: u8) -> u32 {
    0x2a00_03e0 | (u32::from(sf) << 31) | rm(m) | rd(r)
}

/// `MOV` to/from SP (`ADD Xd, Xn, #0`).
pub fn enc_mov_sp(r: u8, n: u8) -> u32 {
    enc_add_imm(r, n, 0, false)
}

/// `LSL Xd, Xn, #shift` (alias of `UBFM`).
pub fn enc_lsl_imm(r: u8, n: u8, shift: u8) -> u32 {
    let shift = u32::from(shift & 63);
    let immr = (64 - shift) & 63;
    let imms = 63 - shift;
    0xd340_0000 | (immr << 16) | (imms << 10) | rn(n) | rd(r)
}

/// GP `LDR`/`STR` with scaled unsigned 12-bit offset. `size` in bytes;
/// the size bits select the B/H/W/X form.
pub fn enc_ldst_gp(load: bool, r: u8, base: u8, off: u32, size: u32) -> u32 {
    let log2 = size.trailing_zeros();
    debug_assert!(size.is_power_of_two() && size <= 8);
    debug_assert_eq!(off % size, 0);
    let scaled = off / size;
    debug_assert!(scaled < 0x1000);
    0x3900_0000
        | (log2 << 30)
        | (u32::from(load) << 22)
        | (scaled << 10)
        | rn(base)
        | rd(r)
}

/// FP/SIMD `LDR`/`STR` with scaled unsigned offset. `size` 4, 8, or 16.
pub fn enc_ldst_fp(load: bool, r: u8, base: u8, off: u32, size: u32) -> u32 {
    debug_assert!(matches!(size, 4 | 8 | 16));
    debug_assert_eq!(off % size, 0);
    let scaled = off / size;
    debug_assert!(scaled < 0x1000);
    match size {
        4 => 0xbd00_0000 | (u32::from(load) << 22) | (scaled << 10) | rn(base) | rd(r),
        8 => 0xfd00_0000 | (u32::from(load) << 22) | (scaled << 10) | rn(base) | rd(r),
        _ => 0x3d80_0000 | (u32::from(load) << 22) | (scaled << 10) | rn(base) | rd(r),
    }
}

/// GP `STP`/`LDP` of X registers, scaled signed 7-bit offset.
pub fn enc_ldp_stp_gp(load: bool, r1: u8, r2: u8, base: u8, off: i32) -> u32 {
    debug_assert_eq!(off % 8, 0);
    let imm7 = ((off / 8) & 0x7f) as u32;
    0xa900_0000 | (u32::from(load) << 22) | (imm7 << 15) | (u32::from(r2 & 31) << 10) | rn(base) | rd(r1)
}

/// FP `STP`/`LDP` of D registers.
pub fn enc_ldp_stp_fp(load: bool, r1: u8, r2: u8, base: u8, off: i32) -> u32 {
    debug_assert_eq!(off % 8, 0);
    let imm7 = ((off / 8) & 0x7f) as u32;
    0x6d00_0000 | (u32::from(load) << 22) | (imm7 << 15) | (u32::from(r2 & 31) << 10) | rn(base) | rd(r1)
}

/// `B` with a word offset.
pub fn enc_b(off_words: i32) -> u32 {
    0x1400_0000 | ((off_words as u32) & 0x03ff_ffff)
}

/// `BL` with a word offset.
pub fn enc_bl(off_words: i32) -> u32 {
    0x9400_0000 | ((off_words as u32) & 0x03ff_ffff)
}

/// `B.cond` with a word offset.
pub fn enc_b_cond(cond: Cond, off_words: i32) -> u32 {
    0x5400_0000 | (((off_words as u32) & 0x7_ffff) << 5) | cond as u32
}

/// `CBZ`/`CBNZ` of an X register.
pub fn enc_cbz(nonzero: bool, r: u8, off_words: i32) -> u32 {
    0xb400_0000 | (u32::from(nonzero) << 24) | (((off_words as u32) & 0x7_ffff) << 5) | rd(r)
}

/// `TBZ`/`TBNZ`.
pub fn enc_tbz(nonzero: bool, r: u8, bit: u8, off_words: i32) -> u32 {
    let b5 = u32::from(bit >> 5);
    let b40 = u32::from(bit & 31);
    0x3600_0000
        | (b5 << 31)
        | (u32::from(nonzero) << 24)
        | (b40 << 19)
        | (((off_words as u32) & 0x3fff) << 5)
        | rd(r)
}

/// `BR Xn`.
pub fn enc_br(n: u8) -> u32 {
    0xd61f_0000 | rn(n)
}

/// `BLR Xn`.
pub fn enc_blr(n: u8) -> u32 {
    0xd63f_0000 | rn(n)
}

/// `RET X30`.
pub fn enc_ret() -> u32 {
    0xd65f_03c0
}

/// `ADR Xd, pc + off` (byte offset, ±1 MiB).
pub fn enc_adr(r: u8, off: i32) -> u32 {
    let off = off as u32;
    0x1000_0000 | ((off & 3) << 29) | (((off >> 2) & 0x7_ffff) << 5) | rd(r)
}

/// `ADRP Xd, page(pc) + off_pages`.
pub fn enc_adrp(r: u8, off_pages: i32) -> u32 {
    let off = off_pages as u32;
    0x9000_0000 | ((off & 3) << 29) | (((off >> 2) & 0x7_ffff) << 5) | rd(r)
}

/// `LDR Wt, pc + off_words` (literal load).
pub fn enc_ldr_lit_w(r: u8, off_words: i32) -> u32 {
    0x1800_0000 | (((off_words as u32) & 0x7_ffff) << 5) | rd(r)
}

/// `NOP`.
pub fn enc_nop() -> u32 {
    0xd503_201f
}

/// `FMOV` general↔FP register moves; `to_fp` gives the direction, `wide`
/// selects D/X over S/W.
pub fn enc_fmov_gp_fp(to_fp: bool, wide: bool, r: u8, src: u8) -> u32 {
    let base: u32 = match (wide, to_fp) {
        (true, true) => 0x9e67_0000,
        (true, false) => 0x9e66_0000,
        (false, true) => 0x1e27_0000,
        (false, false) => 0x1e26_0000,
    };
    base | rn(src) | rd(r)
}

/// `ORR Vd.16B, Vn.16B, Vn.16B` (vector register move).
pub fn enc_mov_vec(r: u8, src: u8) -> u32 {
    0x4ea0_1c00 | rm(src) | rn(src) | rd(r)
}

/// `MOVI Dd, #0`.
pub fn enc_movi_zero(r: u8) -> u32 {
    0x2f00_e400 | rd(r)
}

/// `MRS Xt, TPIDR_EL0`.
pub fn enc_mrs_tpidr(r: u8) -> u32 {
    0xd53b_d040 | rd(r)
}

/// Rewrite the 19-bit branch offset of a placed `B.cond`/`CBZ`/`CBNZ`.
pub fn patch_imm19(inst: u32, off_words: i32) -> u32 {
    (inst & 0xff00_001f) | (((off_words as u32) & 0x7_ffff) << 5)
}

/// Rewrite the 14-bit branch offset of a placed `TBZ`/`TBNZ`.
pub fn patch_imm14(inst: u32, off_words: i32) -> u32 {
    (inst & 0xfff8_001f) | (((off_words as u32) & 0x3fff) << 5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branches() {
        assert_eq!(enc_b(1), 0x1400_0001);
        assert_eq!(enc_b(-1), 0x17ff_ffff);
        assert_eq!(enc_ret(), 0xd65f_03c0);
        // b.eq .+8
        assert_eq!(enc_b_cond(Cond::Eq, 2), 0x5400_0040);
        // cbnz x3, .+4
        assert_eq!(enc_cbz(true, 3, 1), 0xb500_0023);
    }

    #[test]
    fn moves_and_arith() {
        // movz x5, #42
        assert_eq!(enc_movz(true, 5, 42, 0), 0xd280_0545);
        // add x0, x1, x2
        assert_eq!(enc_add_reg(0, 1, 2, 0), 0x8b02_0020);
        // sub sp, sp, #32
        assert_eq!(enc_sub_imm(31, 31, 32, false), 0xd100_83ff);
        // mov x29, sp
        assert_eq!(enc_mov_sp(29, 31), 0x9100_03fd);
    }

    #[test]
    fn loads_stores() {
        // str x0, [sp]
        assert_eq!(enc_ldst_gp(false, 0, 31, 0, 8), 0xf900_03e0);
        // ldr x1, [x29, #16]
        assert_eq!(enc_ldst_gp(true, 1, 29, 16, 8), 0xf940_0ba1);
        // stp x29, x30, [sp]
        assert_eq!(enc_ldp_stp_gp(false, 29, 30, 31, 0), 0xa900_7bfd);
        // ldp x29, x30, [sp]
        assert_eq!(enc_ldp_stp_gp(true, 29, 30, 31, 0), 0xa940_7bfd);
    }
}
