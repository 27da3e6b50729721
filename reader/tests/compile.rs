//! Compile test-IR modules for both targets and check the emitted
//! objects structurally.

use object::{Object, ObjectSection, ObjectSymbol};
use tarmac_reader::{compile_to_object, parse_module, Arch};

fn compile(text: &str, arch: Arch) -> Vec<u8> {
    let mut module = parse_module(text).expect("parse");
    compile_to_object(&mut module, arch).expect("compile")
}

const STRAIGHT_LINE_ADD: &str = "\
add2(%a, %b) {
entry:
  %sum = add %a, %b
  terminate %sum
}
";

const LOOP_COUNTDOWN: &str = "\
count(%n) {
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
";

const DIAMOND_PHI: &str = "\
pick(%c, %a, %b) {
entry:
  condbr %c, ^left, ^right
left:
  %la = add %a, %a
  jump ^join
right:
  %rb = add %b, %b
  jump ^join
join:
  %r = phi [^left, %la], [^right, %rb]
  terminate %r
}
";

const CALL_EXTERN: &str = "\
puts(%s)!
shout(%s) {
entry:
  %r = call @puts(%s)
  terminate %r
}
";

#[test]
fn objects_parse_for_both_targets() {
    for (arch, machine) in [
        (Arch::X64, object::elf::EM_X86_64),
        (Arch::A64, object::elf::EM_AARCH64),
    ] {
        let bytes = compile(STRAIGHT_LINE_ADD, arch);
        let file = object::File::parse(bytes.as_slice()).expect("well-formed ELF");
        match file {
            object::File::Elf64(ref elf) => {
                assert_eq!(elf.elf_header().e_machine.get(object::Endianness::Little), machine);
            }
            _ => panic!("expected an ELF64 object"),
        }
        let text = file.section_by_name(".text").expect(".text present");
        assert!(text.size() > 0);
        assert!(file.section_by_name(".note.GNU-stack").is_some());

        let func = file
            .symbols()
            .find(|s| s.name() == Ok("add2"))
            .expect("function symbol");
        assert!(func.is_global());
        assert!(func.size() > 0);
        assert!(func.address() % 16 == 0, "functions start 16-byte aligned");
    }
}

#[test]
fn unwind_info_has_cie_and_fde() {
    for arch in [Arch::X64, Arch::A64] {
        let bytes = compile(STRAIGHT_LINE_ADD, arch);
        let file = object::File::parse(bytes.as_slice()).unwrap();
        let eh = file.section_by_name(".eh_frame").expect(".eh_frame");
        let data = eh.data().unwrap();
        // a CIE followed by at least one FDE
        let cie_len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        assert!(cie_len + 4 < data.len(), "an FDE follows the CIE");
        let fde_off = cie_len + 4;
        let cie_ptr = u32::from_le_bytes(data[fde_off + 4..fde_off + 8].try_into().unwrap());
        assert_eq!(cie_ptr as usize, fde_off + 4, "FDE points back at the CIE");
        // the FDE's pc-start field is relocated against the text section
        assert_eq!(eh.relocations().count(), 1);
    }
}

#[test]
fn extern_calls_get_call_relocations() {
    let bytes = compile(CALL_EXTERN, Arch::X64);
    let file = object::File::parse(bytes.as_slice()).unwrap();
    let text = file.section_by_name(".text").unwrap();
    let relocs: Vec<_> = text.relocations().collect();
    assert_eq!(relocs.len(), 1);
    match relocs[0].1.flags() {
        object::RelocationFlags::Elf { r_type } => {
            assert_eq!(r_type, object::elf::R_X86_64_PLT32)
        }
        other => panic!("unexpected relocation flags {other:?}"),
    }

    let bytes = compile(CALL_EXTERN, Arch::A64);
    let file = object::File::parse(bytes.as_slice()).unwrap();
    let text = file.section_by_name(".text").unwrap();
    let relocs: Vec<_> = text.relocations().collect();
    assert_eq!(relocs.len(), 1);
    match relocs[0].1.flags() {
        object::RelocationFlags::Elf { r_type } => {
            assert_eq!(r_type, object::elf::R_AARCH64_CALL26)
        }
        other => panic!("unexpected relocation flags {other:?}"),
    }

    // the callee shows up as an undefined global
    let puts = file
        .symbols()
        .find(|s| s.name() == Ok("puts"))
        .expect("undefined callee");
    assert!(puts.is_undefined());
}

#[test]
fn control_flow_modules_compile() {
    for arch in [Arch::X64, Arch::A64] {
        for text in [LOOP_COUNTDOWN, DIAMOND_PHI] {
            let bytes = compile(text, arch);
            let file = object::File::parse(bytes.as_slice()).unwrap();
            assert!(file.section_by_name(".text").unwrap().size() > 0);
        }
    }
}

#[test]
fn local_functions_stay_local() {
    let text = "\
helper(%a) local {
entry:
  terminate %a
}
main.f() {
entry:
  %c = const 7
  %r = call @helper(%c)
  terminate %r
}
";
    let bytes = compile(text, Arch::X64);
    let file = object::File::parse(bytes.as_slice()).unwrap();
    let helper = file
        .symbols()
        .find(|s| s.name() == Ok("helper"))
        .unwrap();
    assert!(!helper.is_global());
    let main = file.symbols().find(|s| s.name() == Ok("main.f")).unwrap();
    assert!(main.is_global());
}

#[test]
fn alloca_and_memory_ops_compile() {
    let text = "\
roundtrip() {
entry:
  %slot = alloca 8
  %v = const 42
  store %v, %slot
  %r = load %slot
  terminate %r
}
";
    for arch in [Arch::X64, Arch::A64] {
        let bytes = compile(text, arch);
        assert!(object::File::parse(bytes.as_slice()).is_ok());
    }
}

#[test]
fn far_conditional_branches_route_through_a_veneer() {
    // more than 1 MiB of straight-line code between a conditional branch
    // and its single-predecessor target forces the AArch64 back-end to
    // patch the branch through a veneer pool
    let mut text = String::from("far(%n) {\nentry:\n  condbr %n, ^far, ^mid\nmid:\n");
    for i in 0..280_000u32 {
        text.push_str(&format!("  %c{i} = const 5\n"));
    }
    text.push_str("  %z = const 0\n  terminate %z\nfar:\n  terminate %n\n}\n");

    let mut module = parse_module(&text).expect("parse");
    let bytes = compile_to_object(&mut module, Arch::A64).expect("compile");
    let file = object::File::parse(bytes.as_slice()).unwrap();
    let sec = file.section_by_name(".text").unwrap();
    assert!(sec.size() > 1024 * 1024);
}

#[test]
fn far_bit_test_branches_route_through_a_veneer() {
    // test branches only reach 32 KiB; beyond that the branch must be
    // patched through a test-branch veneer pool
    let mut text = String::from("farbit(%n) {\nentry:\n  brbit 0, %n, ^far, ^mid\nmid:\n");
    for i in 0..9_000u32 {
        text.push_str(&format!("  %c{i} = const 5\n"));
    }
    text.push_str("  %z = const 0\n  terminate %z\nfar:\n  terminate %n\n}\n");

    let mut module = parse_module(&text).expect("parse");
    let bytes = compile_to_object(&mut module, Arch::A64).expect("compile");
    let file = object::File::parse(bytes.as_slice()).unwrap();
    let sec = file.section_by_name(".text").unwrap();
    assert!(sec.size() > 32 * 1024);
}

#[test]
fn comparison_and_bit_branches_compile_for_both_targets() {
    let text = "\
classify(%a, %b) {
entry:
  brcmp lt, %a, %b, ^below, ^check
check:
  brbit 0, %a, ^odd, ^below
below:
  terminate %a
odd:
  terminate %b
}
";
    for arch in [Arch::X64, Arch::A64] {
        let bytes = compile(text, arch);
        assert!(object::File::parse(bytes.as_slice()).is_ok());
    }
}
