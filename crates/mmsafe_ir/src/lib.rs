//! mmsafe SSA IR data structures, printer, and verifier.
//!
//! Instructions live in a per-function arena indexed by `InstId`; basic
//! blocks hold ordered instruction lists plus a separate terminator. Block
//! surgery moves ids between blocks, so instruction identity survives
//! splitting — the property the later passes rely on.

pub use mmsafe_types::{
    fixed, BlockId, FnId, GlobalId, InstId, SafePtrKind, TypeCtx, TypeId, TypeKind,
};

use mmsafe_diag::{codes, Diagnostic, DiagnosticBag};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// Name of the single-ptr key-check runtime helper.
pub const SINGLE_CHECK_FN: &str = "MMPtrKeyCheck";
/// Name of the array-ptr key-check runtime helper.
pub const ARRAY_CHECK_FN: &str = "MMArrayPtrKeyCheck";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Const {
    pub ty: TypeId,
    pub lit: ConstLit,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConstLit {
    Int(i64),
    Null,
    Undef,
    GlobalAddr(GlobalId),
    /// Address of a field inside a global: a constant aggregate GEP.
    GlobalFieldAddr { global: GlobalId, indices: Vec<u32> },
    Struct(Vec<Const>),
}

impl Const {
    pub fn int(ty: TypeId, v: i64) -> Self {
        Self {
            ty,
            lit: ConstLit::Int(v),
        }
    }

    pub fn null(ty: TypeId) -> Self {
        Self {
            ty,
            lit: ConstLit::Null,
        }
    }
}

/// A single IR value reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Inst(InstId),
    Arg(u32),
    Const(Const),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallConv {
    C,
    Fast,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmpPred {
    Eq,
    Ne,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Callee {
    Direct(FnId),
    Indirect(Value),
}

/// IR operation. The instruction's result type lives on `Inst`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Reserve a typed stack slot. Always resides in the entry block.
    StackAlloc {
        ty: TypeId,
        align: u32,
        multi_qualified: bool,
    },
    Load {
        ptr: Value,
    },
    Store {
        val: Value,
        ptr: Value,
    },
    /// Constant-indexed field projection through a pointer; the first index
    /// steps over the pointer itself.
    FieldAddr {
        base: Value,
        indices: Vec<u32>,
    },
    /// Element arithmetic on a raw pointer.
    ElemAddr {
        base: Value,
        offset: Value,
    },
    ExtractField {
        agg: Value,
        index: u32,
    },
    InsertField {
        agg: Value,
        val: Value,
        index: u32,
    },
    /// Type-preserving pointer reinterpretation; target type is the
    /// instruction's result type.
    PtrCast {
        v: Value,
    },
    ICmp {
        pred: CmpPred,
        lhs: Value,
        rhs: Value,
    },
    Phi {
        incomings: Vec<(BlockId, Value)>,
    },
    Call {
        callee: Callee,
        args: Vec<Value>,
        conv: CallConv,
    },
    /// Tombstone left in the arena after erasure.
    Removed,
}

#[derive(Clone, Debug)]
pub struct Inst {
    pub ty: TypeId,
    pub op: Op,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    Ret(Option<Value>),
    Br(BlockId),
    CondBr {
        cond: Value,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Unreachable,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    pub insts: Vec<InstId>,
    pub terminator: Terminator,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Linkage {
    External,
    Internal,
    Common,
}

#[derive(Clone, Debug)]
pub struct Global {
    pub id: GlobalId,
    pub name: String,
    /// Pointer type of the symbol; the stored value type is its pointee.
    pub ty: TypeId,
    pub is_const: bool,
    pub init: Option<Const>,
    pub linkage: Linkage,
    pub thread_local: bool,
    pub externally_initialized: bool,
    pub multi_qualified: bool,
    pub align: Option<u32>,
}

impl Global {
    pub fn value_type(&self, types: &TypeCtx) -> Option<TypeId> {
        types.element_type_of_pointer(self.ty)
    }

    pub fn has_common_linkage(&self) -> bool {
        self.linkage == Linkage::Common
    }

    pub fn has_initializer(&self) -> bool {
        self.init.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub id: FnId,
    pub name: String,
    pub params: Vec<TypeId>,
    pub ret_ty: TypeId,
    pub conv: CallConv,
    /// Instruction arena; erased slots stay behind as `Op::Removed`.
    pub insts: Vec<Inst>,
    pub blocks: Vec<Block>,
    next_block: u32,
}

impl Function {
    pub fn new(id: FnId, name: impl Into<String>, params: Vec<TypeId>, ret_ty: TypeId) -> Self {
        Self {
            id,
            name: name.into(),
            params,
            ret_ty,
            conv: CallConv::C,
            insts: Vec::new(),
            blocks: Vec::new(),
            next_block: 0,
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.push(Block {
            id,
            insts: Vec::new(),
            terminator: Terminator::Unreachable,
        });
        id
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0 as usize]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.0 as usize]
    }

    pub fn block_pos(&self, bb: BlockId) -> Option<usize> {
        self.blocks.iter().position(|b| b.id == bb)
    }

    pub fn block(&self, bb: BlockId) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == bb)
    }

    pub fn block_mut(&mut self, bb: BlockId) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == bb)
    }

    /// Allocate an arena slot without placing the instruction in a block.
    pub fn new_inst(&mut self, inst: Inst) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(inst);
        id
    }

    /// Allocate and append to the end of `bb`'s instruction list.
    pub fn push_inst(&mut self, bb: BlockId, inst: Inst) -> InstId {
        let id = self.new_inst(inst);
        if let Some(block) = self.block_mut(bb) {
            block.insts.push(id);
        }
        id
    }

    /// Place already-allocated instructions immediately before `anchor`.
    pub fn insert_before(&mut self, bb: BlockId, anchor: InstId, ids: &[InstId]) {
        if let Some(block) = self.block_mut(bb) {
            if let Some(pos) = block.insts.iter().position(|&i| i == anchor) {
                for (k, &id) in ids.iter().enumerate() {
                    block.insts.insert(pos + k, id);
                }
            }
        }
    }

    pub fn set_terminator(&mut self, bb: BlockId, term: Terminator) {
        if let Some(block) = self.block_mut(bb) {
            block.terminator = term;
        }
    }

    /// Block currently holding `id`, if it is placed.
    pub fn inst_block(&self, id: InstId) -> Option<BlockId> {
        self.blocks
            .iter()
            .find(|b| b.insts.contains(&id))
            .map(|b| b.id)
    }

    /// Unlink from its block and tombstone the arena slot.
    pub fn erase_inst(&mut self, id: InstId) {
        for block in &mut self.blocks {
            block.insts.retain(|&i| i != id);
        }
        let slot = self.inst_mut(id);
        slot.op = Op::Removed;
        slot.ty = fixed::VOID;
    }

    /// Rewrite every use of `from` (as an operand) to `to`.
    pub fn replace_all_uses(&mut self, from: InstId, to: &Value) {
        for inst in &mut self.insts {
            inst.op.for_each_value_mut(|v| {
                if *v == Value::Inst(from) {
                    *v = to.clone();
                }
            });
        }
        for block in &mut self.blocks {
            block.terminator.for_each_value_mut(|v| {
                if *v == Value::Inst(from) {
                    *v = to.clone();
                }
            });
        }
    }

    /// Instructions that use `id` as an operand.
    pub fn users_of(&self, id: InstId) -> Vec<InstId> {
        let mut out = Vec::new();
        for (idx, inst) in self.insts.iter().enumerate() {
            let mut uses_it = false;
            inst.op.for_each_value(|v| {
                if *v == Value::Inst(id) {
                    uses_it = true;
                }
            });
            if uses_it {
                out.push(InstId(idx as u32));
            }
        }
        out
    }

    pub fn value_type(&self, v: &Value) -> Option<TypeId> {
        match v {
            Value::Inst(i) => Some(self.inst(*i).ty),
            Value::Arg(n) => self.params.get(*n as usize).copied(),
            Value::Const(c) => Some(c.ty),
        }
    }

    /// Strip no-op pointer casts off a value.
    pub fn strip_pointer_casts(&self, v: &Value) -> Value {
        let mut cur = v.clone();
        while let Value::Inst(i) = cur {
            match &self.inst(i).op {
                Op::PtrCast { v: inner } => cur = inner.clone(),
                _ => return Value::Inst(i),
            }
        }
        cur
    }
}

#[derive(Clone, Debug, Default)]
pub struct Module {
    pub name: String,
    globals: Vec<Option<Global>>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn add_global(&mut self, mut global: Global) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        global.id = id;
        self.globals.push(Some(global));
        id
    }

    pub fn global(&self, id: GlobalId) -> Option<&Global> {
        self.globals.get(id.0 as usize).and_then(|g| g.as_ref())
    }

    pub fn global_mut(&mut self, id: GlobalId) -> Option<&mut Global> {
        self.globals.get_mut(id.0 as usize).and_then(|g| g.as_mut())
    }

    pub fn erase_global(&mut self, id: GlobalId) {
        if let Some(slot) = self.globals.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    pub fn globals(&self) -> impl Iterator<Item = &Global> {
        self.globals.iter().flatten()
    }

    pub fn add_function(&mut self, name: impl Into<String>, params: Vec<TypeId>, ret_ty: TypeId) -> FnId {
        let id = FnId(self.functions.len() as u32);
        self.functions.push(Function::new(id, name, params, ret_ty));
        id
    }

    pub fn function(&self, id: FnId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FnId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn find_function(&self, name: &str) -> Option<FnId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FnId(i as u32))
    }

    /// Rewrite every use of `old`'s address (in instruction operands and in
    /// global initializers) to the given constant.
    pub fn replace_global_uses(&mut self, old: GlobalId, to: &Const) {
        for func in &mut self.functions {
            for inst in &mut func.insts {
                inst.op.for_each_value_mut(|v| {
                    if let Value::Const(c) = v {
                        replace_global_in_const(c, old, to);
                    }
                });
            }
            for block in &mut func.blocks {
                block.terminator.for_each_value_mut(|v| {
                    if let Value::Const(c) = v {
                        replace_global_in_const(c, old, to);
                    }
                });
            }
        }
        for slot in self.globals.iter_mut().flatten() {
            if let Some(init) = &mut slot.init {
                replace_global_in_const(init, old, to);
            }
        }
    }

    /// Check-call classification: `Some(kind)` iff `inst` is a direct call to
    /// a key-check helper.
    pub fn check_call_kind(&self, func: &Function, inst: InstId) -> Option<SafePtrKind> {
        match &func.inst(inst).op {
            Op::Call {
                callee: Callee::Direct(fid),
                ..
            } => check_kind_of_name(&self.function(*fid).name),
            _ => None,
        }
    }
}

fn replace_global_in_const(c: &mut Const, old: GlobalId, to: &Const) {
    match &mut c.lit {
        ConstLit::GlobalAddr(g) if *g == old => *c = to.clone(),
        ConstLit::Struct(fields) => {
            for field in fields {
                replace_global_in_const(field, old, to);
            }
        }
        _ => {}
    }
}

pub fn is_check_fn_name(name: &str) -> bool {
    check_kind_of_name(name).is_some()
}

pub fn check_kind_of_name(name: &str) -> Option<SafePtrKind> {
    if name.ends_with(ARRAY_CHECK_FN) {
        Some(SafePtrKind::Array)
    } else if name.ends_with(SINGLE_CHECK_FN) {
        Some(SafePtrKind::Single)
    } else {
        None
    }
}

impl Op {
    pub fn is_phi(&self) -> bool {
        matches!(self, Op::Phi { .. })
    }

    pub fn for_each_value(&self, mut f: impl FnMut(&Value)) {
        match self {
            Op::StackAlloc { .. } | Op::Removed => {}
            Op::Load { ptr } => f(ptr),
            Op::Store { val, ptr } => {
                f(val);
                f(ptr);
            }
            Op::FieldAddr { base, .. } => f(base),
            Op::ElemAddr { base, offset } => {
                f(base);
                f(offset);
            }
            Op::ExtractField { agg, .. } => f(agg),
            Op::InsertField { agg, val, .. } => {
                f(agg);
                f(val);
            }
            Op::PtrCast { v } => f(v),
            Op::ICmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Op::Phi { incomings } => {
                for (_, v) in incomings {
                    f(v);
                }
            }
            Op::Call { callee, args, .. } => {
                if let Callee::Indirect(v) = callee {
                    f(v);
                }
                for arg in args {
                    f(arg);
                }
            }
        }
    }

    pub fn for_each_value_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Op::StackAlloc { .. } | Op::Removed => {}
            Op::Load { ptr } => f(ptr),
            Op::Store { val, ptr } => {
                f(val);
                f(ptr);
            }
            Op::FieldAddr { base, .. } => f(base),
            Op::ElemAddr { base, offset } => {
                f(base);
                f(offset);
            }
            Op::ExtractField { agg, .. } => f(agg),
            Op::InsertField { agg, val, .. } => {
                f(agg);
                f(val);
            }
            Op::PtrCast { v } => f(v),
            Op::ICmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Op::Phi { incomings } => {
                for (_, v) in incomings {
                    f(v);
                }
            }
            Op::Call { callee, args, .. } => {
                if let Callee::Indirect(v) = callee {
                    f(v);
                }
                for arg in args {
                    f(arg);
                }
            }
        }
    }
}

impl Terminator {
    pub fn for_each_value(&self, mut f: impl FnMut(&Value)) {
        match self {
            Terminator::Ret(Some(v)) => f(v),
            Terminator::CondBr { cond, .. } => f(cond),
            Terminator::Ret(None) | Terminator::Br(_) | Terminator::Unreachable => {}
        }
    }

    pub fn for_each_value_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Terminator::Ret(Some(v)) => f(v),
            Terminator::CondBr { cond, .. } => f(cond),
            Terminator::Ret(None) | Terminator::Br(_) | Terminator::Unreachable => {}
        }
    }

    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            Terminator::Ret(_) | Terminator::Unreachable => vec![],
            Terminator::Br(bb) => vec![*bb],
            Terminator::CondBr {
                then_bb, else_bb, ..
            } => vec![*then_bb, *else_bb],
        }
    }
}

// ---- CFG helpers -----------------------------------------------------------

pub fn build_block_index(func: &Function) -> HashMap<u32, usize> {
    func.blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.id.0, i))
        .collect()
}

pub fn block_successors(block: &Block, block_index: &HashMap<u32, usize>) -> Vec<usize> {
    block
        .terminator
        .targets()
        .into_iter()
        .filter_map(|bb| block_index.get(&bb.0).copied())
        .collect()
}

pub fn build_predecessors(n: usize, succs: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut preds = vec![Vec::new(); n];
    for (i, vs) in succs.iter().enumerate() {
        for &s in vs {
            preds[s].push(i);
        }
    }
    preds
}

/// Split `bb` at list position `at`: instructions from `at` onward and the
/// terminator move to a fresh block; `bb` ends with a branch to it. Phi
/// incomings in the moved terminator's targets are re-pointed at the new
/// block, which inherits `bb`'s fall-through role.
pub fn split_block_at(func: &mut Function, bb: BlockId, at: usize) -> BlockId {
    let new_bb = BlockId(func.next_block);
    func.next_block += 1;

    let Some(pos) = func.block_pos(bb) else {
        return new_bb;
    };
    let (tail, old_term) = {
        let block = &mut func.blocks[pos];
        let tail = block.insts.split_off(at);
        let term = std::mem::replace(&mut block.terminator, Terminator::Br(new_bb));
        (tail, term)
    };

    for target in old_term.targets() {
        let succ_insts: Vec<InstId> = func
            .block(target)
            .map(|b| b.insts.clone())
            .unwrap_or_default();
        for iid in succ_insts {
            if let Op::Phi { incomings } = &mut func.inst_mut(iid).op {
                for (pred, _) in incomings {
                    if *pred == bb {
                        *pred = new_bb;
                    }
                }
            }
        }
    }

    func.blocks.insert(
        pos + 1,
        Block {
            id: new_bb,
            insts: tail,
            terminator: old_term,
        },
    );
    new_bb
}

// ---- Printer ---------------------------------------------------------------

/// Print the module in textual form. The digest header makes printed IR
/// self-identifying in golden assertions.
pub fn print_module(module: &Module, types: &TypeCtx) -> String {
    let mut out = String::new();
    let digest_input = format!("mmsafe:ir:module_digest:v0.1|{}", module.name);
    let digest = blake3::hash(digest_input.as_bytes()).to_hex().to_string();

    writeln!(out, "mmsafe.ir.version 0.1").unwrap();
    writeln!(out, "module {}", module.name).unwrap();
    writeln!(out, "module_digest \"{digest}\"").unwrap();

    for global in module.globals() {
        let init = match &global.init {
            Some(c) => format!(" = {}", format_const(module, c)),
            None => String::new(),
        };
        writeln!(
            out,
            "global @{} : {}{} linkage={}{}{}",
            global.name,
            types.display(global.ty),
            init,
            format_linkage(global.linkage),
            if global.multi_qualified { " multiple" } else { "" },
            match global.align {
                Some(a) => format!(" align={a}"),
                None => String::new(),
            },
        )
        .unwrap();
    }

    for func in &module.functions {
        let params = func
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| format!("arg{}: {}", i, types.display(*ty)))
            .collect::<Vec<_>>()
            .join(", ");
        if func.is_declaration() {
            writeln!(
                out,
                "declare @{}({}) -> {}",
                func.name,
                params,
                types.display(func.ret_ty)
            )
            .unwrap();
            continue;
        }
        writeln!(
            out,
            "fn @{}({}) -> {} {{",
            func.name,
            params,
            types.display(func.ret_ty)
        )
        .unwrap();
        for block in &func.blocks {
            writeln!(out, "  bb{}:", block.id.0).unwrap();
            for &iid in &block.insts {
                let inst = func.inst(iid);
                writeln!(
                    out,
                    "    %{} : {} = {}",
                    iid.0,
                    types.display(inst.ty),
                    format_op(module, &inst.op)
                )
                .unwrap();
            }
            writeln!(out, "    {}", format_terminator(module, &block.terminator)).unwrap();
        }
        writeln!(out, "}}").unwrap();
    }

    out
}

fn format_linkage(linkage: Linkage) -> &'static str {
    match linkage {
        Linkage::External => "external",
        Linkage::Internal => "internal",
        Linkage::Common => "common",
    }
}

fn format_value(module: &Module, v: &Value) -> String {
    match v {
        Value::Inst(i) => format!("%{}", i.0),
        Value::Arg(n) => format!("arg{n}"),
        Value::Const(c) => format_const(module, c),
    }
}

fn format_const(module: &Module, c: &Const) -> String {
    match &c.lit {
        ConstLit::Int(v) => format!("{v}"),
        ConstLit::Null => "null".to_string(),
        ConstLit::Undef => "undef".to_string(),
        ConstLit::GlobalAddr(g) => match module.global(*g) {
            Some(global) => format!("@{}", global.name),
            None => format!("@g{}", g.0),
        },
        ConstLit::GlobalFieldAddr { global, indices } => {
            let name = match module.global(*global) {
                Some(g) => g.name.clone(),
                None => format!("g{}", global.0),
            };
            let idx = indices
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("fieldaddr(@{name}, [{idx}])")
        }
        ConstLit::Struct(fields) => {
            let inner = fields
                .iter()
                .map(|f| format_const(module, f))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{ {inner} }}")
        }
    }
}

fn format_op(module: &Module, op: &Op) -> String {
    match op {
        Op::StackAlloc {
            ty: _,
            align,
            multi_qualified,
        } => format!(
            "stackalloc align={align}{}",
            if *multi_qualified { " multiple" } else { "" }
        ),
        Op::Load { ptr } => format!("load {}", format_value(module, ptr)),
        Op::Store { val, ptr } => format!(
            "store {}, {}",
            format_value(module, val),
            format_value(module, ptr)
        ),
        Op::FieldAddr { base, indices } => {
            let idx = indices
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("fieldaddr {}, [{idx}]", format_value(module, base))
        }
        Op::ElemAddr { base, offset } => format!(
            "elemaddr {}, {}",
            format_value(module, base),
            format_value(module, offset)
        ),
        Op::ExtractField { agg, index } => {
            format!("extractfield {}, {index}", format_value(module, agg))
        }
        Op::InsertField { agg, val, index } => format!(
            "insertfield {}, {}, {index}",
            format_value(module, agg),
            format_value(module, val)
        ),
        Op::PtrCast { v } => format!("ptrcast {}", format_value(module, v)),
        Op::ICmp { pred, lhs, rhs } => format!(
            "icmp {} {}, {}",
            match pred {
                CmpPred::Eq => "eq",
                CmpPred::Ne => "ne",
            },
            format_value(module, lhs),
            format_value(module, rhs)
        ),
        Op::Phi { incomings } => {
            let inner = incomings
                .iter()
                .map(|(bb, v)| format!("[bb{}: {}]", bb.0, format_value(module, v)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("phi {inner}")
        }
        Op::Call { callee, args, conv } => {
            let target = match callee {
                Callee::Direct(fid) => format!("@{}", module.function(*fid).name),
                Callee::Indirect(v) => format_value(module, v),
            };
            let inner = args
                .iter()
                .map(|a| format_value(module, a))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "call{} {target}({inner})",
                match conv {
                    CallConv::C => "",
                    CallConv::Fast => " fastcc",
                }
            )
        }
        Op::Removed => "removed".to_string(),
    }
}

fn format_terminator(module: &Module, term: &Terminator) -> String {
    match term {
        Terminator::Ret(None) => "ret".to_string(),
        Terminator::Ret(Some(v)) => format!("ret {}", format_value(module, v)),
        Terminator::Br(bb) => format!("br bb{}", bb.0),
        Terminator::CondBr {
            cond,
            then_bb,
            else_bb,
        } => format!(
            "condbr {}, bb{}, bb{}",
            format_value(module, cond),
            then_bb.0,
            else_bb.0
        ),
        Terminator::Unreachable => "unreachable".to_string(),
    }
}

/// Render one instruction, for diagnostics.
pub fn display_inst(module: &Module, func: &Function, id: InstId) -> String {
    format!("%{} = {}", id.0, format_op(module, &func.inst(id).op))
}

// ---- Verifier --------------------------------------------------------------

/// Verify module well-formedness: SSA discipline, CFG integrity, and
/// load/store type agreement.
#[allow(clippy::result_unit_err)]
pub fn verify_module(
    module: &Module,
    types: &TypeCtx,
    diag: &mut DiagnosticBag,
) -> Result<(), ()> {
    let before = diag.error_count();
    for func in &module.functions {
        if !func.is_declaration() {
            verify_function(module, func, types, diag);
        }
    }
    if diag.error_count() > before {
        Err(())
    } else {
        Ok(())
    }
}

fn verify_function(module: &Module, func: &Function, types: &TypeCtx, diag: &mut DiagnosticBag) {
    let block_index = build_block_index(func);
    if block_index.len() != func.blocks.len() {
        diag.emit(Diagnostic::error(
            codes::MMV0005,
            format!("duplicate block id in fn '{}'", func.name),
        ));
    }

    let mut def_block: HashMap<InstId, usize> = HashMap::new();
    let mut def_pos: HashMap<InstId, usize> = HashMap::new();
    for (blk_idx, block) in func.blocks.iter().enumerate() {
        for (pos, &iid) in block.insts.iter().enumerate() {
            if def_block.insert(iid, blk_idx).is_some() {
                diag.emit(Diagnostic::error(
                    codes::MMV0001,
                    format!(
                        "instruction %{} placed more than once in fn '{}'",
                        iid.0, func.name
                    ),
                ));
            }
            def_pos.insert(iid, pos);
        }
        for target in block.terminator.targets() {
            if !block_index.contains_key(&target.0) {
                diag.emit(Diagnostic::error(
                    codes::MMV0004,
                    format!(
                        "terminator of bb{} targets unknown bb{} in fn '{}'",
                        block.id.0, target.0, func.name
                    ),
                ));
            }
        }
    }

    let dom = compute_dominators(func, &block_index);

    for (blk_idx, block) in func.blocks.iter().enumerate() {
        for (pos, &iid) in block.insts.iter().enumerate() {
            let inst = func.inst(iid);
            let in_phi = inst.op.is_phi();
            inst.op.for_each_value(|v| {
                check_value_use(
                    module, func, v, blk_idx, pos, in_phi, &def_block, &def_pos, &dom, diag,
                );
            });
            verify_memory_types(module, func, iid, types, diag);
            if let Op::Call { callee, args, .. } = &inst.op {
                if let Callee::Direct(fid) = callee {
                    let callee_fn = module.function(*fid);
                    if is_check_fn_name(&callee_fn.name) && args.len() != 1 {
                        diag.emit(
                            Diagnostic::error(
                                codes::MMV0007,
                                format!(
                                    "key-check call takes 1 argument, got {} in fn '{}'",
                                    args.len(),
                                    func.name
                                ),
                            )
                            .with_subject(display_inst(module, func, iid)),
                        );
                    }
                }
            }
        }
        block.terminator.for_each_value(|v| {
            check_value_use(
                module,
                func,
                v,
                blk_idx,
                block.insts.len(),
                false,
                &def_block,
                &def_pos,
                &dom,
                diag,
            );
        });
    }
}

#[allow(clippy::too_many_arguments)]
fn check_value_use(
    module: &Module,
    func: &Function,
    v: &Value,
    use_blk: usize,
    use_pos: usize,
    in_phi: bool,
    def_block: &HashMap<InstId, usize>,
    def_pos: &HashMap<InstId, usize>,
    dom: &[HashSet<usize>],
    diag: &mut DiagnosticBag,
) {
    let Value::Inst(iid) = v else {
        return;
    };
    if matches!(func.inst(*iid).op, Op::Removed) {
        diag.emit(Diagnostic::error(
            codes::MMV0002,
            format!("use of erased instruction %{} in fn '{}'", iid.0, func.name),
        ));
        return;
    }
    let Some(&d) = def_block.get(iid) else {
        diag.emit(Diagnostic::error(
            codes::MMV0002,
            format!("use of unplaced instruction %{} in fn '{}'", iid.0, func.name),
        ));
        return;
    };
    // Phi operands are constrained by their incoming edge, not the use block.
    if in_phi {
        return;
    }
    let ok = if d == use_blk {
        def_pos.get(iid).map(|&p| p < use_pos).unwrap_or(false)
    } else {
        dom[use_blk].contains(&d)
    };
    if !ok {
        diag.emit(
            Diagnostic::error(
                codes::MMV0003,
                format!(
                    "use of %{} in fn '{}' is not dominated by its definition",
                    iid.0, func.name
                ),
            )
            .with_subject(display_inst(module, func, *iid)),
        );
    }
}

fn verify_memory_types(
    module: &Module,
    func: &Function,
    iid: InstId,
    types: &TypeCtx,
    diag: &mut DiagnosticBag,
) {
    let inst = func.inst(iid);
    let mismatch = match &inst.op {
        Op::Load { ptr } => func
            .value_type(ptr)
            .and_then(|pt| types.element_type_of_pointer(pt))
            .map(|elem| elem != inst.ty),
        Op::Store { val, ptr } => {
            let val_ty = func.value_type(val);
            let elem = func
                .value_type(ptr)
                .and_then(|pt| types.element_type_of_pointer(pt));
            match (val_ty, elem) {
                (Some(v), Some(e)) => Some(v != e),
                _ => None,
            }
        }
        _ => None,
    };
    if mismatch == Some(true) {
        diag.emit(
            Diagnostic::error(
                codes::MMV0006,
                format!(
                    "memory access type disagrees with pointee type in fn '{}'",
                    func.name
                ),
            )
            .with_subject(display_inst(module, func, iid)),
        );
    }
}

/// Iterative dominator sets over block positions; index 0 is the entry.
pub fn compute_dominators(func: &Function, block_index: &HashMap<u32, usize>) -> Vec<HashSet<usize>> {
    let n = func.blocks.len();
    let successors: Vec<Vec<usize>> = func
        .blocks
        .iter()
        .map(|b| block_successors(b, block_index))
        .collect();
    let preds = build_predecessors(n, &successors);

    let mut dom: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    if n == 0 {
        return dom;
    }
    dom[0].insert(0);
    let all: HashSet<usize> = (0..n).collect();
    for d in dom.iter_mut().skip(1) {
        *d = all.clone();
    }
    let mut changed = true;
    while changed {
        changed = false;
        for i in 1..n {
            let mut new_dom: HashSet<usize> = if preds[i].is_empty() {
                HashSet::new()
            } else {
                let mut iter = preds[i].iter();
                let first = *iter.next().unwrap();
                let mut acc = dom[first].clone();
                for &p in iter {
                    acc = acc.intersection(&dom[p]).copied().collect();
                }
                acc
            };
            new_dom.insert(i);
            if new_dom != dom[i] {
                dom[i] = new_dom;
                changed = true;
            }
        }
    }
    dom
}
