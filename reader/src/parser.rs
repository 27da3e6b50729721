//! Parser for the textual test IR.
//!
//! The format is line-based:
//!
//! ```text
//! ; external declaration
//! puts(%s)!
//!
//! fib(%n) {
//! entry:
//!   %two = const 2
//!   condbr %n, ^recurse, ^base
//! base:
//!   terminate %n
//! recurse:
//!   ...
//! }
//! ```
//!
//! Functions are parsed in two passes: the first collects blocks and
//! value definitions (so forward references — PHI inputs in particular —
//! resolve), the second fills in operand and successor lists.

use rustc_hash::FxHashMap;

use tarmac_codegen::isa::CondCode;

use crate::error::{err, Location, ParseResult};
use crate::module::{BlockData, FunctionData, Module, Op, ValueData, ValueKind};

/// Parse a whole module.
pub fn parse_module(text: &str) -> ParseResult<Module> {
    let mut module = Module::default();
    let mut func_names: FxHashMap<String, u32> = FxHashMap::default();

    // split into functions first so each can be handled in two passes
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (Location { line_number: i + 1 }, strip_comment(l)))
        .filter(|(_, l)| !l.is_empty());

    while let Some((loc, line)) = lines.next() {
        let header = parse_func_header(loc, line)?;
        if func_names.contains_key(&header.name) {
            return err!(loc, "duplicate function '{}'", header.name);
        }

        let func_idx = module.functions.len() as u32;
        func_names.insert(header.name.clone(), func_idx);

        let value_begin = module.values.len() as u32;
        for (i, arg) in header.args.iter().enumerate() {
            module.values.push(ValueData {
                name: arg.clone(),
                local_idx: i as u32,
                kind: ValueKind::Arg,
                op: Op::None,
                op_begin: 0,
                op_end: 0,
                imm: 0,
                call_func: 0,
                has_result: true,
            });
        }

        let mut func = FunctionData {
            name: header.name,
            block_begin: module.blocks.len() as u32,
            block_end: module.blocks.len() as u32,
            value_begin,
            value_end: module.values.len() as u32,
            arg_count: header.args.len() as u32,
            is_local: header.is_local,
            is_extern: header.is_extern,
            has_call: false,
        };

        if header.is_extern {
            module.functions.push(func);
            continue;
        }

        // gather the body lines up to the closing brace
        let mut body: Vec<(Location, &str)> = Vec::new();
        let mut closed = false;
        for (loc, line) in lines.by_ref() {
            if line == "}" {
                closed = true;
                break;
            }
            body.push((loc, line));
        }
        if !closed {
            return err!(loc, "missing closing brace for function '{}'", func.name);
        }

        parse_func_body(&mut module, &mut func, &body, &func_names)?;
        module.functions.push(func);
    }

    // calls could only be checked partially while the callee was still
    // unparsed; verify argument counts now
    for v in &module.values {
        if v.kind == ValueKind::Normal && v.op == Op::Call {
            let callee = &module.functions[v.call_func as usize];
            let got = v.op_end - v.op_begin;
            if got != callee.arg_count {
                return err!(
                    Location::default(),
                    "call to '{}' passes {} arguments, expected {}",
                    callee.name,
                    got,
                    callee.arg_count
                );
            }
        }
    }

    Ok(module)
}

fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(pos) => line[..pos].trim(),
        None => line.trim(),
    }
}

struct FuncHeader {
    name: String,
    args: Vec<String>,
    is_local: bool,
    is_extern: bool,
}

fn parse_func_header(loc: Location, line: &str) -> ParseResult<FuncHeader> {
    let Some(open) = line.find('(') else {
        return err!(loc, "expected '(' in function header '{}'", line);
    };
    let name = line[..open].trim();
    if name.is_empty() || !name.chars().all(is_ident_char) {
        return err!(loc, "invalid function name '{}'", name);
    }
    let Some(close) = line.find(')') else {
        return err!(loc, "expected ')' in function header '{}'", line);
    };

    let mut args = Vec::new();
    let arg_text = line[open + 1..close].trim();
    if !arg_text.is_empty() {
        for arg in arg_text.split(',') {
            let arg = arg.trim();
            let Some(name) = arg.strip_prefix('%') else {
                return err!(loc, "expected '%' before argument name, got '{}'", arg);
            };
            if args.contains(&name.to_string()) {
                return err!(loc, "duplicate argument '%{}'", name);
            }
            args.push(name.to_string());
        }
    }

    let tail = line[close + 1..].trim();
    let (is_local, is_extern) = match tail {
        "{" => (false, false),
        "local {" => (true, false),
        "!" => (false, true),
        other => {
            return err!(loc, "expected '{{', 'local {{', or '!', got '{}'", other);
        }
    };
    Ok(FuncHeader {
        name: name.to_string(),
        args,
        is_local,
        is_extern,
    })
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn parse_func_body(
    module: &mut Module,
    func: &mut FunctionData,
    body: &[(Location, &str)],
    func_names: &FxHashMap<String, u32>,
) -> ParseResult<()> {
    let mut value_map: FxHashMap<String, u32> = FxHashMap::default();
    let mut block_map: FxHashMap<String, u32> = FxHashMap::default();
    for i in 0..func.arg_count {
        let idx = func.value_begin + i;
        value_map.insert(module.values[idx as usize].name.clone(), idx);
    }

    // pass 1: blocks and value definitions
    {
        let mut cur_block: Option<u32> = None;
        for &(loc, line) in body {
            if let Some(label) = line.strip_suffix(':') {
                if !label.chars().all(is_ident_char) || label.is_empty() {
                    return err!(loc, "invalid block label '{}'", label);
                }
                let idx = module.blocks.len() as u32;
                if block_map.insert(label.to_string(), idx).is_some() {
                    return err!(loc, "duplicate block '^{}'", label);
                }
                module.blocks.push(BlockData {
                    name: label.to_string(),
                    succ_begin: 0,
                    succ_end: 0,
                    inst_begin: module.values.len() as u32,
                    inst_end: module.values.len() as u32,
                    info: 0,
                    info2: 0,
                });
                cur_block = Some(idx);
                continue;
            }

            let Some(block) = cur_block else {
                return err!(loc, "instruction before the entry block label");
            };

            let local_idx = (module.values.len() as u32) - func.value_begin;
            let (name, rest) = match line.split_once('=') {
                Some((lhs, rhs)) => {
                    let lhs = lhs.trim();
                    let Some(name) = lhs.strip_prefix('%') else {
                        return err!(loc, "expected '%' before value name in '{}'", line);
                    };
                    (Some(name), rhs.trim())
                }
                None => (None, line),
            };

            let mnemonic = rest.split_whitespace().next().unwrap_or("");
            let (kind, op, has_result) = match mnemonic {
                "add" => (ValueKind::Normal, Op::Add, true),
                "sub" => (ValueKind::Normal, Op::Sub, true),
                "mul" => (ValueKind::Normal, Op::Mul, true),
                "const" => (ValueKind::Normal, Op::Const, true),
                "alloca" => (ValueKind::Alloca, Op::None, true),
                "phi" => (ValueKind::Phi, Op::None, true),
                "call" => (ValueKind::Normal, Op::Call, name.is_some()),
                "load" => (ValueKind::Normal, Op::Load, true),
                "store" => (ValueKind::Normal, Op::Store, false),
                "jump" | "br" => (ValueKind::Normal, Op::Jump, false),
                "condbr" => (ValueKind::Normal, Op::CondBr, false),
                "brcmp" => (ValueKind::Normal, Op::CondBrCmp, false),
                "brbit" => (ValueKind::Normal, Op::CondBrBit, false),
                "terminate" => (ValueKind::Normal, Op::Terminate, false),
                other => return err!(loc, "unknown instruction '{}'", other),
            };
            if has_result && name.is_none() && op != Op::Call {
                return err!(loc, "instruction '{}' needs a result name", mnemonic);
            }
            if !has_result && name.is_some() {
                return err!(loc, "'{}' does not produce a result", mnemonic);
            }

            let idx = module.values.len() as u32;
            if let Some(name) = name {
                if value_map.insert(name.to_string(), idx).is_some() {
                    return err!(loc, "value '%{}' redefined", name);
                }
            }
            module.values.push(ValueData {
                name: name.unwrap_or("").to_string(),
                local_idx,
                kind,
                op,
                op_begin: 0,
                op_end: 0,
                imm: 0,
                call_func: 0,
                has_result,
            });
            module.blocks[block as usize].inst_end = module.values.len() as u32;
        }

        if module.blocks.len() as u32 == func.block_begin {
            return err!(Location::default(), "function '{}' has no blocks", func.name);
        }
    }

    // pass 2: operands, PHI inputs, and successors
    {
        let mut cur_block = func.block_begin.wrapping_sub(1);
        let mut inst = 0u32;
        let mut terminated = true;
        for &(loc, line) in body {
            if line.ends_with(':') {
                if !terminated && cur_block != func.block_begin.wrapping_sub(1) {
                    return err!(loc, "block not closed by a terminator");
                }
                cur_block = cur_block.wrapping_add(1);
                inst = module.blocks[cur_block as usize].inst_begin;
                terminated = false;
                continue;
            }
            if terminated {
                return err!(loc, "instruction after the block terminator");
            }

            let idx = inst;
            inst += 1;
            let rest = match line.split_once('=') {
                Some((_, rhs)) => rhs.trim(),
                None => line,
            };
            let mnemonic = rest.split_whitespace().next().unwrap_or("");
            let operand_text = rest[mnemonic.len()..].trim();

            match module.values[idx as usize].op {
                Op::Add | Op::Sub | Op::Mul | Op::Store => {
                    let ops = parse_value_list(loc, operand_text, &value_map)?;
                    if ops.len() != 2 {
                        return err!(loc, "'{}' takes two operands", mnemonic);
                    }
                    set_operands(module, idx, &ops);
                }
                Op::Load => {
                    let ops = parse_value_list(loc, operand_text, &value_map)?;
                    if ops.len() != 1 {
                        return err!(loc, "'load' takes one operand");
                    }
                    set_operands(module, idx, &ops);
                }
                Op::Const => {
                    let imm = parse_int(loc, operand_text)?;
                    module.values[idx as usize].imm = imm;
                }
                Op::None if module.values[idx as usize].kind == ValueKind::Alloca => {
                    let size = parse_int(loc, operand_text)?;
                    if size == 0 || size > u64::from(u32::MAX) {
                        return err!(loc, "invalid alloca size {}", size);
                    }
                    module.values[idx as usize].imm = size;
                }
                Op::None if module.values[idx as usize].kind == ValueKind::Phi => {
                    let pairs = parse_phi_inputs(loc, operand_text, &value_map, &block_map)?;
                    let begin = module.value_operands.len() as u32;
                    for (block, value) in pairs {
                        module.value_operands.push(block);
                        module.value_operands.push(value);
                    }
                    module.values[idx as usize].op_begin = begin;
                    module.values[idx as usize].op_end = module.value_operands.len() as u32;
                }
                Op::Call => {
                    let (callee, args) = parse_call(loc, operand_text, &value_map, func_names)?;
                    module.values[idx as usize].call_func = callee;
                    set_operands(module, idx, &args);
                    func.has_call = true;
                }
                Op::Jump => {
                    let target = parse_block_ref(loc, operand_text, &block_map)?;
                    let begin = module.block_succs.len() as u32;
                    module.block_succs.push(target);
                    let b = &mut module.blocks[cur_block as usize];
                    b.succ_begin = begin;
                    b.succ_end = begin + 1;
                    terminated = true;
                }
                Op::CondBr => {
                    let parts: Vec<&str> = operand_text.split(',').map(str::trim).collect();
                    if parts.len() != 3 {
                        return err!(loc, "condbr takes a condition and two targets");
                    }
                    let cond = parse_value_ref(loc, parts[0], &value_map)?;
                    let t = parse_block_ref(loc, parts[1], &block_map)?;
                    let f = parse_block_ref(loc, parts[2], &block_map)?;
                    set_operands(module, idx, &[cond]);
                    set_cond_succs(module, cur_block, t, f);
                    terminated = true;
                }
                Op::CondBrCmp => {
                    let parts: Vec<&str> = operand_text.split(',').map(str::trim).collect();
                    if parts.len() != 5 {
                        return err!(
                            loc,
                            "brcmp takes a condition code, two operands, and two targets"
                        );
                    }
                    let Some(cc) = CondCode::from_name(parts[0]) else {
                        return err!(loc, "unknown condition code '{}'", parts[0]);
                    };
                    let lhs = parse_value_ref(loc, parts[1], &value_map)?;
                    let rhs = parse_value_ref(loc, parts[2], &value_map)?;
                    let t = parse_block_ref(loc, parts[3], &block_map)?;
                    let f = parse_block_ref(loc, parts[4], &block_map)?;
                    module.values[idx as usize].imm = cc as u64;
                    set_operands(module, idx, &[lhs, rhs]);
                    set_cond_succs(module, cur_block, t, f);
                    terminated = true;
                }
                Op::CondBrBit => {
                    let parts: Vec<&str> = operand_text.split(',').map(str::trim).collect();
                    if parts.len() != 4 {
                        return err!(loc, "brbit takes a bit number, an operand, and two targets");
                    }
                    let bit = parse_int(loc, parts[0])?;
                    if bit > 63 {
                        return err!(loc, "bit number {} out of range", bit);
                    }
                    let v = parse_value_ref(loc, parts[1], &value_map)?;
                    let t = parse_block_ref(loc, parts[2], &block_map)?;
                    let f = parse_block_ref(loc, parts[3], &block_map)?;
                    module.values[idx as usize].imm = bit;
                    set_operands(module, idx, &[v]);
                    set_cond_succs(module, cur_block, t, f);
                    terminated = true;
                }
                Op::Terminate => {
                    if !operand_text.is_empty() {
                        let v = parse_value_ref(loc, operand_text, &value_map)?;
                        set_operands(module, idx, &[v]);
                    }
                    let b = &mut module.blocks[cur_block as usize];
                    b.succ_begin = module.block_succs.len() as u32;
                    b.succ_end = b.succ_begin;
                    terminated = true;
                }
                Op::None => unreachable!("unhandled value kind"),
            }
        }
        if !terminated {
            return err!(
                Location::default(),
                "function '{}' does not end with a terminator",
                func.name
            );
        }
    }

    func.block_end = module.blocks.len() as u32;
    func.value_end = module.values.len() as u32;
    Ok(())
}

fn set_cond_succs(module: &mut Module, block: u32, t: u32, f: u32) {
    let begin = module.block_succs.len() as u32;
    module.block_succs.push(t);
    module.block_succs.push(f);
    let b = &mut module.blocks[block as usize];
    b.succ_begin = begin;
    b.succ_end = begin + 2;
}

fn set_operands(module: &mut Module, value: u32, ops: &[u32]) {
    let begin = module.value_operands.len() as u32;
    module.value_operands.extend_from_slice(ops);
    module.values[value as usize].op_begin = begin;
    module.values[value as usize].op_end = module.value_operands.len() as u32;
}

fn parse_int(loc: Location, text: &str) -> ParseResult<u64> {
    let (neg, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let parsed = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        digits.parse::<u64>()
    };
    match parsed {
        Ok(v) if neg => Ok((v as i64).wrapping_neg() as u64),
        Ok(v) => Ok(v),
        Err(_) => err!(loc, "invalid integer '{}'", text),
    }
}

fn parse_value_ref(
    loc: Location,
    text: &str,
    value_map: &FxHashMap<String, u32>,
) -> ParseResult<u32> {
    let Some(name) = text.strip_prefix('%') else {
        return err!(loc, "expected '%' before value name, got '{}'", text);
    };
    match value_map.get(name) {
        Some(&idx) => Ok(idx),
        None => err!(loc, "unknown value '%{}'", name),
    }
}

fn parse_block_ref(
    loc: Location,
    text: &str,
    block_map: &FxHashMap<String, u32>,
) -> ParseResult<u32> {
    let Some(name) = text.strip_prefix('^') else {
        return err!(loc, "expected '^' before block name, got '{}'", text);
    };
    match block_map.get(name) {
        Some(&idx) => Ok(idx),
        None => err!(loc, "unknown block '^{}'", name),
    }
}

fn parse_value_list(
    loc: Location,
    text: &str,
    value_map: &FxHashMap<String, u32>,
) -> ParseResult<Vec<u32>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|part| parse_value_ref(loc, part.trim(), value_map))
        .collect()
}

fn parse_phi_inputs(
    loc: Location,
    text: &str,
    value_map: &FxHashMap<String, u32>,
    block_map: &FxHashMap<String, u32>,
) -> ParseResult<Vec<(u32, u32)>> {
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let Some(open) = rest.find('[') else {
            return err!(loc, "expected '[' in PHI input list at '{}'", rest);
        };
        let Some(close) = rest.find(']') else {
            return err!(loc, "expected ']' in PHI input list at '{}'", rest);
        };
        let inner = &rest[open + 1..close];
        let Some((block, value)) = inner.split_once(',') else {
            return err!(loc, "PHI input '[{}]' needs a block and a value", inner);
        };
        let block = parse_block_ref(loc, block.trim(), block_map)?;
        let value = parse_value_ref(loc, value.trim(), value_map)?;
        out.push((block, value));
        rest = rest[close + 1..].trim_start_matches(',').trim();
    }
    if out.is_empty() {
        return err!(loc, "PHI needs at least one input");
    }
    Ok(out)
}

fn parse_call(
    loc: Location,
    text: &str,
    value_map: &FxHashMap<String, u32>,
    func_names: &FxHashMap<String, u32>,
) -> ParseResult<(u32, Vec<u32>)> {
    let Some(name) = text.strip_prefix('@') else {
        return err!(loc, "expected '@' before callee name, got '{}'", text);
    };
    let Some(open) = name.find('(') else {
        return err!(loc, "expected '(' after callee name");
    };
    let Some(close) = name.rfind(')') else {
        return err!(loc, "expected ')' after call arguments");
    };
    let callee = &name[..open];
    let Some(&func_idx) = func_names.get(callee) else {
        return err!(loc, "unknown function '@{}'", callee);
    };
    let args = parse_value_list(loc, name[open + 1..close].trim(), value_map)?;
    Ok((func_idx, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ValueKind;
    use tarmac_codegen::adaptor::IrAdaptor;

    #[test]
    fn parse_simple_function() {
        let module = parse_module(
            "add2(%a, %b) {\n\
             entry:\n\
             \x20 %sum = add %a, %b\n\
             \x20 terminate %sum\n\
             }\n",
        )
        .unwrap();
        assert_eq!(module.functions.len(), 1);
        let f = &module.functions[0];
        assert_eq!(f.name, "add2");
        assert_eq!(f.arg_count, 2);
        assert_eq!(f.block_end - f.block_begin, 1);
        // two args, the add, and the terminator
        assert_eq!(f.value_end - f.value_begin, 4);
        assert!(!f.has_call);
    }

    #[test]
    fn parse_externs_and_calls() {
        let module = parse_module(
            "puts(%s)!\n\
             greet(%s) {\n\
             entry:\n\
             \x20 %r = call @puts(%s)\n\
             \x20 terminate %r\n\
             }\n",
        )
        .unwrap();
        assert!(module.functions[0].is_extern);
        assert!(module.functions[1].has_call);
    }

    #[test]
    fn parse_phi_and_loop() {
        let module = parse_module(
            "count(%n) {\n\
             entry:\n\
             \x20 %one = const 1\n\
             \x20 jump ^head\n\
             head:\n\
             \x20 %i = phi [^entry, %n], [^body, %next]\n\
             \x20 condbr %i, ^body, ^exit\n\
             body:\n\
             \x20 %next = sub %i, %one\n\
             \x20 jump ^head\n\
             exit:\n\
             \x20 terminate %i\n\
             }\n",
        )
        .unwrap();
        let mut m = module;
        let f = m.funcs().next().unwrap();
        assert!(m.switch_func(f));
        let phi = m
            .values
            .iter()
            .position(|v| v.kind == ValueKind::Phi)
            .unwrap() as u32;
        assert_eq!(m.phi_incoming_count(crate::module::ValueRef(phi)), 2);
    }

    #[test]
    fn reject_unterminated_block() {
        let res = parse_module(
            "f(%a) {\n\
             entry:\n\
             \x20 %x = add %a, %a\n\
             next:\n\
             \x20 terminate %x\n\
             }\n",
        );
        assert!(res.is_err());
    }

    #[test]
    fn reject_bad_call_arity() {
        let res = parse_module(
            "callee(%a, %b) {\n\
             entry:\n\
             \x20 terminate %a\n\
             }\n\
             caller(%x) {\n\
             entry:\n\
             \x20 %r = call @callee(%x)\n\
             \x20 terminate %r\n\
             }\n",
        );
        assert!(res.is_err());
    }
}
