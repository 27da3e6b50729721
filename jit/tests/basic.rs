//! Map generated code into the running process and execute it.
//!
//! These tests compile for the host architecture and call the produced
//! entry points directly, covering the end-to-end path: analyzer,
//! single-pass compiler, encoder, mapper, relocation resolution, and the
//! PLT path for external symbols.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use std::ffi::c_void;

use tarmac_jit::ElfMapper;
use tarmac_reader::{compile_a64, compile_x64, parse_module, CompiledModule};

fn compile_host(text: &str) -> CompiledModule {
    let mut module = parse_module(text).expect("parse");
    if cfg!(target_arch = "x86_64") {
        compile_x64(&mut module).expect("compile")
    } else {
        compile_a64(&mut module).expect("compile")
    }
}

fn no_externs(name: &str) -> Option<*const c_void> {
    panic!("unexpected unresolved symbol {name}");
}

fn map(compiled: &CompiledModule) -> ElfMapper {
    let mut mapper = ElfMapper::new();
    mapper
        .map(&compiled.assembler, &mut no_externs)
        .expect("map");
    mapper
}

fn entry<T>(mapper: &ElfMapper, compiled: &CompiledModule, name: &str) -> T {
    let sym = compiled.sym_by_name(name).expect("entry symbol");
    let addr = mapper.get_sym_addr(sym).expect("entry address");
    unsafe { std::mem::transmute_copy(&addr) }
}

#[test]
fn straight_line_add() {
    let compiled = compile_host(
        "add2(%a, %b) {
entry:
  %sum = add %a, %b
  terminate %sum
}
",
    );
    let mapper = map(&compiled);
    let f: extern "C" fn(i64, i64) -> i64 = entry(&mapper, &compiled, "add2");
    assert_eq!(f(3, 4), 7);
    assert_eq!(f(-10, 4), -6);
}

#[test]
fn loop_with_phi_counts_down() {
    let compiled = compile_host(
        "count(%n) {
entry:
  %one = const 1
  jump ^head
head:
  %i = phi [^entry, %n], [^body, %next]
  condbr %i, ^body, ^exit
body:
  %next = sub %i, %one
  jump ^head
exit:
  terminate %i
}
",
    );
    let mapper = map(&compiled);
    let f: extern "C" fn(i64) -> i64 = entry(&mapper, &compiled, "count");
    assert_eq!(f(0), 0);
    assert_eq!(f(5), 0);
    assert_eq!(f(1000), 0);
}

#[test]
fn loop_accumulates() {
    // sum = 0; for (i = n; i != 0; i--) sum += i*2
    let compiled = compile_host(
        "sumdouble(%n) {
entry:
  %one = const 1
  %two = const 2
  %zero = const 0
  jump ^head
head:
  %i = phi [^entry, %n], [^body, %i2]
  %acc = phi [^entry, %zero], [^body, %acc2]
  condbr %i, ^body, ^exit
body:
  %d = mul %i, %two
  %acc2 = add %acc, %d
  %i2 = sub %i, %one
  jump ^head
exit:
  terminate %acc
}
",
    );
    let mapper = map(&compiled);
    let f: extern "C" fn(i64) -> i64 = entry(&mapper, &compiled, "sumdouble");
    assert_eq!(f(0), 0);
    assert_eq!(f(4), 2 * (4 + 3 + 2 + 1));
    assert_eq!(f(100), 100 * 101);
}

#[test]
fn diamond_phi_selects_side() {
    let compiled = compile_host(
        "pick(%c, %a, %b) {
entry:
  condbr %c, ^left, ^right
left:
  %la = add %a, %a
  jump ^join
right:
  %rb = sub %b, %a
  jump ^join
join:
  %r = phi [^left, %la], [^right, %rb]
  terminate %r
}
",
    );
    let mapper = map(&compiled);
    let f: extern "C" fn(i64, i64, i64) -> i64 = entry(&mapper, &compiled, "pick");
    assert_eq!(f(1, 21, 100), 42);
    assert_eq!(f(0, 2, 100), 98);
}

#[test]
fn value_survives_call() {
    // %x is live across the call and must be spilled around it
    let compiled = compile_host(
        "add2(%a, %b) {
entry:
  %sum = add %a, %b
  terminate %sum
}
main() {
entry:
  %x = const 30
  %y = const 12
  %r = call @add2(%x, %y)
  %r2 = add %r, %x
  terminate %r2
}
",
    );
    let mapper = map(&compiled);
    let f: extern "C" fn() -> i64 = entry(&mapper, &compiled, "main");
    assert_eq!(f(), 72);
}

#[test]
fn many_values_force_spills() {
    // more live values than argument registers plus some arithmetic
    let mut text = String::from("spill(%a) {\nentry:\n");
    for i in 0..24 {
        text.push_str(&format!("  %c{i} = const {}\n", i + 1));
    }
    for i in 0..24 {
        let prev = if i == 0 {
            "%a".to_string()
        } else {
            format!("%s{}", i - 1)
        };
        text.push_str(&format!("  %s{i} = add {prev}, %c{i}\n"));
    }
    text.push_str("  terminate %s23\n}\n");
    let compiled = compile_host(&text);
    let mapper = map(&compiled);
    let f: extern "C" fn(i64) -> i64 = entry(&mapper, &compiled, "spill");
    assert_eq!(f(0), (1..=24).sum::<i64>());
}

#[test]
fn alloca_store_load_roundtrip() {
    let compiled = compile_host(
        "roundtrip(%v) {
entry:
  %slot = alloca 8
  store %v, %slot
  %r = load %slot
  terminate %r
}
",
    );
    let mapper = map(&compiled);
    let f: extern "C" fn(i64) -> i64 = entry(&mapper, &compiled, "roundtrip");
    assert_eq!(f(0x1122_3344_5566), 0x1122_3344_5566);
}

#[test]
fn resolves_external_puts() {
    // build "ok\n\0" in a stack slot and hand its address to libc
    let msg = u64::from_le_bytes(*b"ok\n\0\0\0\0\0");
    let compiled = compile_host(&format!(
        "puts(%s)!
shout() {{
entry:
  %slot = alloca 8
  %msg = const {msg}
  store %msg, %slot
  %r = call @puts(%slot)
  terminate %r
}}
"
    ));
    let mut mapper = ElfMapper::new();
    mapper
        .map(&compiled.assembler, &mut |name| {
            let cname = std::ffi::CString::new(name).ok()?;
            let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
            (!addr.is_null()).then_some(addr.cast_const())
        })
        .expect("map with dlsym resolver");
    let f: extern "C" fn() -> i64 = entry(&mapper, &compiled, "shout");
    // puts returns a nonnegative value on success
    assert!(f() >= 0);
}

#[test]
fn unresolved_symbol_fails_the_map() {
    let compiled = compile_host(
        "missing(%x)!
caller(%x) {
entry:
  %r = call @missing(%x)
  terminate %r
}
",
    );
    let mut mapper = ElfMapper::new();
    let err = mapper
        .map(&compiled.assembler, &mut |_| None)
        .expect_err("mapping must fail");
    let msg = err.to_string();
    assert!(msg.contains("missing"), "error names the symbol: {msg}");
    // the failed map unwound; a fresh map may be attempted
    assert!(mapper.get_sym_addr(compiled.func_syms[1]).is_none());
}

#[test]
fn mapper_maps_at_most_once() {
    let compiled = compile_host(
        "f() {
entry:
  %z = const 0
  terminate %z
}
",
    );
    let mut mapper = map(&compiled);
    let again = mapper.map(&compiled.assembler, &mut no_externs);
    assert!(again.is_err());
    // reset returns it to a usable state
    mapper.reset();
    mapper
        .map(&compiled.assembler, &mut no_externs)
        .expect("map after reset");
}

#[test]
fn local_linkage_functions_are_callable_internally() {
    let compiled = compile_host(
        "helper(%a) local {
entry:
  %one = const 1
  %r = add %a, %one
  terminate %r
}
wrap(%x) {
entry:
  %r = call @helper(%x)
  terminate %r
}
",
    );
    let mapper = map(&compiled);
    let f: extern "C" fn(i64) -> i64 = entry(&mapper, &compiled, "wrap");
    assert_eq!(f(41), 42);
}

#[test]
fn critical_edge_split_keeps_phi_copies_off_the_fallthrough() {
    // the true edge jumps straight into a join with two predecessors, so
    // the PHI copy for that edge must not execute on the fall-through
    // path
    let compiled = compile_host(
        "crit(%c, %a) {
entry:
  %one = const 1
  condbr %c, ^join, ^other
other:
  %bumped = add %a, %one
  jump ^join
join:
  %r = phi [^entry, %a], [^other, %bumped]
  terminate %r
}
",
    );
    let mapper = map(&compiled);
    let f: extern "C" fn(i64, i64) -> i64 = entry(&mapper, &compiled, "crit");
    assert_eq!(f(1, 10), 10);
    assert_eq!(f(0, 10), 11);
}

#[test]
fn comparison_branches_are_signed_and_unsigned() {
    let compiled = compile_host(
        "max(%a, %b) {
entry:
  brcmp gt, %a, %b, ^ka, ^kb
ka:
  terminate %a
kb:
  terminate %b
}
umax(%a, %b) {
entry:
  brcmp ugt, %a, %b, ^ka, ^kb
ka:
  terminate %a
kb:
  terminate %b
}
",
    );
    let mapper = map(&compiled);
    let max: extern "C" fn(i64, i64) -> i64 = entry(&mapper, &compiled, "max");
    assert_eq!(max(3, 4), 4);
    assert_eq!(max(5, -9), 5);
    assert_eq!(max(-3, -1), -1);
    let umax: extern "C" fn(i64, i64) -> i64 = entry(&mapper, &compiled, "umax");
    // -1 is the largest unsigned value
    assert_eq!(umax(-1, 1), -1);
    assert_eq!(umax(2, 7), 7);
}

#[test]
fn bit_test_branches_select_on_single_bits() {
    let compiled = compile_host(
        "bit3(%v) {
entry:
  brbit 3, %v, ^set, ^clear
set:
  %one = const 1
  terminate %one
clear:
  %zero = const 0
  terminate %zero
}
",
    );
    let mapper = map(&compiled);
    let f: extern "C" fn(i64) -> i64 = entry(&mapper, &compiled, "bit3");
    assert_eq!(f(0), 0);
    assert_eq!(f(8), 1);
    assert_eq!(f(7), 0);
    assert_eq!(f(0xff), 1);
    assert_eq!(f(-1), 1);
}

#[test]
fn tls_access_sequence_maps() {
    // emit the general-dynamic TLS access directly through the back-end
    // and check the mapper resolves its relocations (the stubbed
    // descriptor is mapped, not executed)
    use tarmac_codegen::assembler::{Assembler, SymBinding};
    use tarmac_codegen::isa::Backend;

    #[cfg(target_arch = "x86_64")]
    use tarmac_codegen::isa::x64::{gpr, X64Backend as HostBackend};
    #[cfg(target_arch = "aarch64")]
    use tarmac_codegen::isa::aarch64::{xreg, A64Backend as HostBackend};

    let mut asm = Assembler::new(HostBackend::target_info());
    let mut backend = HostBackend::new();
    let sym = asm.sym_add_undef("tls_var", SymBinding::Global);
    asm.text_align_16();
    #[cfg(target_arch = "x86_64")]
    let dst = gpr(0);
    #[cfg(target_arch = "aarch64")]
    let dst = xreg(2);
    backend.emit_tls_addr(&mut asm, sym, dst);

    static DUMMY: u64 = 0;
    let mut mapper = ElfMapper::new();
    mapper
        .map(&asm, &mut |_| {
            Some(&DUMMY as *const u64 as *const c_void)
        })
        .expect("TLS relocations resolve");
}
