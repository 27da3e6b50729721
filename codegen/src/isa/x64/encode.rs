//! x86-64 instruction encoding helpers.
//!
//! Emission goes through a small byte buffer the caller copies into the
//! text window, so every helper can stay a pure function. Register
//! operands are hardware encodings 0..15 (GP) or 0..15 (XMM); REX
//! prefixes are synthesized as needed.

use smallvec::SmallVec;

/// A freshly encoded instruction, at most fifteen bytes.
pub type EncodedInst = SmallVec<[u8; 16]>;

/// Condition codes as used in `Jcc`/`SETcc` opcodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[allow(missing_docs)]
pub enum Cc {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xa,
    Np = 0xb,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

impl Cc {
    /// The opposite condition.
    pub fn invert(self) -> Cc {
        match self {
            Cc::O => Cc::No,
            Cc::No => Cc::O,
            Cc::B => Cc::Ae,
            Cc::Ae => Cc::B,
            Cc::E => Cc::Ne,
            Cc::Ne => Cc::E,
            Cc::Be => Cc::A,
            Cc::A => Cc::Be,
            Cc::S => Cc::Ns,
            Cc::Ns => Cc::S,
            Cc::P => Cc::Np,
            Cc::Np => Cc::P,
            Cc::L => Cc::Ge,
            Cc::Ge => Cc::L,
            Cc::Le => Cc::G,
            Cc::G => Cc::Le,
        }
    }
}

fn rex(w: bool, reg: u8, index: u8, base: u8) -> u8 {
    0x40 | (u8::from(w) << 3) | ((reg >> 3) << 2) | ((index >> 3) << 1) | (base >> 3)
}

fn push_rex(out: &mut EncodedInst, w: bool, reg: u8, index: u8, base: u8) {
    let rex = rex(w, reg, index, base);
    if rex != 0x40 || w {
        out.push(rex);
    }
}

fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// reg-to-reg instruction with the given opcode bytes; `reg` goes into
/// the ModRM reg field.
fn enc_rr(opcode: &[u8], w: bool, reg: u8, rm: u8) -> EncodedInst {
    let mut out = EncodedInst::new();
    push_rex(&mut out, w, reg, 0, rm);
    out.extend_from_slice(opcode);
    out.push(modrm(3, reg, rm));
    out
}

/// `[base + disp]` memory operand; handles the rsp-SIB and rbp-disp0
/// special cases.
fn mem_base_disp(out: &mut EncodedInst, reg: u8, base: u8, disp: i32) {
    let base_low = base & 7;
    let need_sib = base_low == 4;
    let (md, small) = if disp == 0 && base_low != 5 {
        (0u8, true)
    } else if (-128..128).contains(&disp) {
        (1u8, true)
    } else {
        (2u8, false)
    };
    out.push(modrm(md, reg, if need_sib { 4 } else { base }));
    if need_sib {
        // index = none (100), scale irrelevant
        out.push((4 << 3) | base_low);
    }
    if md == 1 {
        out.push(disp as i8 as u8);
    } else if md == 2 || !small {
        out.extend_from_slice(&disp.to_le_bytes());
    }
}

/// Load/store with `[base + disp]`.
fn enc_rm(opcode: &[u8], prefix: &[u8], w: bool, reg: u8, base: u8, disp: i32) -> EncodedInst {
    let mut out = EncodedInst::new();
    out.extend_from_slice(prefix);
    push_rex(&mut out, w, reg, 0, base);
    out.extend_from_slice(opcode);
    mem_base_disp(&mut out, reg, base, disp);
    out
}

/// `push r64`.
pub fn enc_push(r: u8) -> EncodedInst {
    let mut out = EncodedInst::new();
    if r >= 8 {
        out.push(0x41);
    }
    out.push(0x50 | (r & 7));
    out
}

/// `pop r64`.
pub fn enc_pop(r: u8) -> EncodedInst {
    let mut out = EncodedInst::new();
    if r >= 8 {
        out.push(0x41);
    }
    out.push(0x58 | (r & 7));
    out
}

/// `mov r64, r64`.
pub fn enc_mov_rr(dst: u8, src: u8) -> EncodedInst {
    enc_rr(&[0x89], true, src, dst)
}

/// `mov r32, r32`.
pub fn enc_mov_rr32(dst: u8, src: u8) -> EncodedInst {
    enc_rr(&[0x89], false, src, dst)
}

/// GP load from `[base + disp]`; 1/2-byte loads zero-extend.
pub fn enc_load_gp(dst: u8, base: u8, disp: i32, size: u32) -> EncodedInst {
    match size {
        1 => enc_rm(&[0x0f, 0xb6], &[], true, dst, base, disp),
        2 => enc_rm(&[0x0f, 0xb7], &[], true, dst, base, disp),
        4 => enc_rm(&[0x8b], &[], false, dst, base, disp),
        _ => enc_rm(&[0x8b], &[], true, dst, base, disp),
    }
}

/// GP store to `[base + disp]`.
pub fn enc_store_gp(src: u8, base: u8, disp: i32, size: u32) -> EncodedInst {
    match size {
        1 => {
            // byte stores of sil/dil/... need a REX prefix even without
            // extension bits
            let mut out = EncodedInst::new();
            out.push(rex(false, src, 0, base).max(0x40));
            out.push(0x88);
            mem_base_disp(&mut out, src, base, disp);
            out
        }
        2 => enc_rm(&[0x89], &[0x66], false, src, base, disp),
        4 => enc_rm(&[0x89], &[], false, src, base, disp),
        _ => enc_rm(&[0x89], &[], true, src, base, disp),
    }
}

/// SSE load from `[base + disp]` (4/8/16 bytes).
pub fn enc_load_fp(dst: u8, base: u8, disp: i32, size: u32) -> EncodedInst {
    match size {
        4 => enc_rm(&[0x0f, 0x10], &[0xf3], false, dst, base, disp),
        8 => enc_rm(&[0x0f, 0x10], &[0xf2], false, dst, base, disp),
        _ => enc_rm(&[0x0f, 0x28], &[], false, dst, base, disp),
    }
}

/// SSE store to `[base + disp]`.
pub fn enc_store_fp(src: u8, base: u8, disp: i32, size: u32) -> EncodedInst {
    match size {
        4 => enc_rm(&[0x0f, 0x11], &[0xf3], false, src, base, disp),
        8 => enc_rm(&[0x0f, 0x11], &[0xf2], false, src, base, disp),
        _ => enc_rm(&[0x0f, 0x29], &[], false, src, base, disp),
    }
}

/// `movaps xmm, xmm`.
pub fn enc_mov_fp(dst: u8, src: u8) -> EncodedInst {
    enc_rr(&[0x0f, 0x28], false, dst, src)
}

/// `movq xmm, r64` / `movq r64, xmm`.
pub fn enc_movq_gp_fp(to_fp: bool, fp: u8, gp: u8) -> EncodedInst {
    let mut out = EncodedInst::new();
    out.push(0x66);
    push_rex(&mut out, true, fp, 0, gp);
    out.extend_from_slice(if to_fp { &[0x0f, 0x6e] } else { &[0x0f, 0x7e] });
    out.push(modrm(3, fp, gp));
    out
}

/// `lea r64, [base + disp]`.
pub fn enc_lea(dst: u8, base: u8, disp: i32) -> EncodedInst {
    enc_rm(&[0x8d], &[], true, dst, base, disp)
}

/// `lea r64, [base + index*scale + disp]` (full SIB form).
pub fn enc_lea_sib(dst: u8, base: Option<u8>, index: u8, scale: u8, disp: i32) -> EncodedInst {
    debug_assert!(matches!(scale, 1 | 2 | 4 | 8));
    debug_assert!(index & 15 != 4, "rsp cannot be an index");
    let mut out = EncodedInst::new();
    let base_bits = base.unwrap_or(5);
    out.push(rex(true, dst, index, base_bits));
    out.push(0x8d);
    let ss = scale.trailing_zeros() as u8;
    match base {
        None => {
            // disp32-only base
            out.push(modrm(0, dst, 4));
            out.push((ss << 6) | ((index & 7) << 3) | 5);
            out.extend_from_slice(&disp.to_le_bytes());
        }
        Some(b) => {
            let md = if disp == 0 && b & 7 != 5 {
                0u8
            } else if (-128..128).contains(&disp) {
                1u8
            } else {
                2u8
            };
            out.push(modrm(md, dst, 4));
            out.push((ss << 6) | ((index & 7) << 3) | (b & 7));
            if md == 1 {
                out.push(disp as i8 as u8);
            } else if md == 2 {
                out.extend_from_slice(&disp.to_le_bytes());
            }
        }
    }
    out
}

/// ALU reg-reg: `add`/`sub`/`and`/`or`/`xor` with 64-bit operands.
pub fn enc_alu_rr(opcode: u8, dst: u8, src: u8) -> EncodedInst {
    enc_rr(&[opcode], true, src, dst)
}

/// `imul r64, r64` (two-operand form, destination in the reg field).
pub fn enc_imul_rr(dst: u8, src: u8) -> EncodedInst {
    enc_rr(&[0x0f, 0xaf], true, dst, src)
}

/// `test r64, r64`.
pub fn enc_test_rr(a: u8, b: u8) -> EncodedInst {
    enc_rr(&[0x85], true, b, a)
}

/// `cmp r64, r64`.
pub fn enc_cmp_rr(a: u8, b: u8) -> EncodedInst {
    enc_rr(&[0x39], true, b, a)
}

/// `bt r64, imm8` (copies the tested bit into CF).
pub fn enc_bt_imm(r: u8, bit: u8) -> EncodedInst {
    let mut out = enc_rr(&[0x0f, 0xba], true, 4, r);
    out.push(bit);
    out
}

/// `add`/`sub r64, imm32` (opcode extension 0 or 5).
pub fn enc_alu_imm32(ext: u8, r: u8, imm: i32) -> EncodedInst {
    let mut out = EncodedInst::new();
    push_rex(&mut out, true, 0, 0, r);
    out.push(0x81);
    out.push(modrm(3, ext, r));
    out.extend_from_slice(&imm.to_le_bytes());
    out
}

/// `mov r32, imm32` (zero-extends).
pub fn enc_mov_imm32(r: u8, imm: u32) -> EncodedInst {
    let mut out = EncodedInst::new();
    if r >= 8 {
        out.push(0x41);
    }
    out.push(0xb8 | (r & 7));
    out.extend_from_slice(&imm.to_le_bytes());
    out
}

/// `mov r64, imm32` (sign-extends).
pub fn enc_mov_imm32s(r: u8, imm: i32) -> EncodedInst {
    let mut out = EncodedInst::new();
    push_rex(&mut out, true, 0, 0, r);
    out.push(0xc7);
    out.push(modrm(3, 0, r));
    out.extend_from_slice(&imm.to_le_bytes());
    out
}

/// `movabs r64, imm64`.
pub fn enc_mov_imm64(r: u8, imm: u64) -> EncodedInst {
    let mut out = EncodedInst::new();
    push_rex(&mut out, true, 0, 0, r);
    out.push(0xb8 | (r & 7));
    out.extend_from_slice(&imm.to_le_bytes());
    out
}

/// `xorps xmm, xmm` (idiomatic zero).
pub fn enc_xorps(r: u8) -> EncodedInst {
    enc_rr(&[0x0f, 0x57], false, r, r)
}

/// `jmp rel32`; the offset field starts at byte 1.
pub fn enc_jmp_rel32(rel: i32) -> EncodedInst {
    let mut out = EncodedInst::new();
    out.push(0xe9);
    out.extend_from_slice(&rel.to_le_bytes());
    out
}

/// `jcc rel32`; the offset field starts at byte 2.
pub fn enc_jcc_rel32(cc: Cc, rel: i32) -> EncodedInst {
    let mut out = EncodedInst::new();
    out.push(0x0f);
    out.push(0x80 | cc as u8);
    out.extend_from_slice(&rel.to_le_bytes());
    out
}

/// `call rel32`.
pub fn enc_call_rel32(rel: i32) -> EncodedInst {
    let mut out = EncodedInst::new();
    out.push(0xe8);
    out.extend_from_slice(&rel.to_le_bytes());
    out
}

/// `call r64`.
pub fn enc_call_reg(r: u8) -> EncodedInst {
    let mut out = EncodedInst::new();
    if r >= 8 {
        out.push(0x41);
    }
    out.push(0xff);
    out.push(modrm(3, 2, r));
    out
}

/// `ret`.
pub fn enc_ret() -> EncodedInst {
    let mut out = EncodedInst::new();
    out.push(0xc3);
    out
}

/// `nop`.
pub fn enc_nop() -> EncodedInst {
    let mut out = EncodedInst::new();
    out.push(0x90);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves() {
        // mov rax, rdi -> 48 89 f8
        assert_eq!(enc_mov_rr(0, 7).as_slice(), &[0x48, 0x89, 0xf8]);
        // mov r12, rax -> 49 89 c4
        assert_eq!(enc_mov_rr(12, 0).as_slice(), &[0x49, 0x89, 0xc4]);
        // movabs rax, 0x1122334455667788
        assert_eq!(
            enc_mov_imm64(0, 0x1122_3344_5566_7788).as_slice(),
            &[0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn frame_accesses() {
        // mov rax, [rbp-8] -> 48 8b 45 f8
        assert_eq!(enc_load_gp(0, 5, -8, 8).as_slice(), &[0x48, 0x8b, 0x45, 0xf8]);
        // mov [rbp-0x100], rcx -> 48 89 8d 00 ff ff ff
        assert_eq!(
            enc_store_gp(1, 5, -0x100, 8).as_slice(),
            &[0x48, 0x89, 0x8d, 0x00, 0xff, 0xff, 0xff]
        );
        // mov rdx, [rsp+8] -> 48 8b 54 24 08
        assert_eq!(
            enc_load_gp(2, 4, 8, 8).as_slice(),
            &[0x48, 0x8b, 0x54, 0x24, 0x08]
        );
    }

    #[test]
    fn arith_and_branches() {
        // add rax, rcx -> 48 01 c8
        assert_eq!(enc_alu_rr(0x01, 0, 1).as_slice(), &[0x48, 0x01, 0xc8]);
        // test rdi, rdi -> 48 85 ff
        assert_eq!(enc_test_rr(7, 7).as_slice(), &[0x48, 0x85, 0xff]);
        // jne +0 -> 0f 85 00 00 00 00
        assert_eq!(
            enc_jcc_rel32(Cc::Ne, 0).as_slice(),
            &[0x0f, 0x85, 0x00, 0x00, 0x00, 0x00]
        );
        // sub rsp, 0x20 -> 48 81 ec 20 00 00 00
        assert_eq!(
            enc_alu_imm32(5, 4, 0x20).as_slice(),
            &[0x48, 0x81, 0xec, 0x20, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn push_pop() {
        assert_eq!(enc_push(3).as_slice(), &[0x53]);
        assert_eq!(enc_push(12).as_slice(), &[0x41, 0x54]);
        assert_eq!(enc_pop(5).as_slice(), &[0x5d]);
    }
}
