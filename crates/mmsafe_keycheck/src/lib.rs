//! Basic-block splitting around may-free calls, and redundant key-check
//! removal by forward dataflow over checked aggregate addresses.
//!
//! The splitter isolates every may-free call at the tail of its own block so
//! the dataflow can treat "a may-free call happened" as a block-level fact.
//! The optimizer then computes, per block, which safe-pointer aggregate
//! addresses are known-checked on entry, and erases checks that re-verify an
//! address already checked on every acyclic path with no intervening store
//! and no may-free call.

use mmsafe_diag::{codes, Diagnostic, DiagnosticBag};
use mmsafe_freefind::{CallSite, FreeFinder};
use mmsafe_ir::{
    build_block_index, block_successors, build_predecessors, fixed, is_check_fn_name,
    split_block_at, BlockId, CallConv, Callee, CmpPred, Const, FnId, Function, Inst, InstId,
    Module, Op, SafePtrKind, Terminator, TypeCtx, TypeId, Value, ARRAY_CHECK_FN, SINGLE_CHECK_FN,
};
use std::collections::{HashMap, HashSet};

// ---- Block splitter --------------------------------------------------------

/// Splits blocks so each may-free call is the last instruction of its block.
#[derive(Debug, Default)]
pub struct SplitBlocks {
    /// Blocks whose sole call is a may-free call.
    pub may_free_bbs: HashSet<(FnId, BlockId)>,
}

impl SplitBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the pass, driven from the finder's call set (not a fresh scan:
    /// splitting preserves each call's identity, so the worklist stays valid
    /// while blocks change underneath it).
    pub fn run(&mut self, module: &mut Module, finder: &FreeFinder) -> bool {
        let mut worklist: Vec<CallSite> = finder.may_free_calls.iter().copied().collect();
        worklist.sort_by_key(|(f, i)| (f.0, i.0));

        for (fid, call) in worklist {
            let func = module.function_mut(fid);
            let Some(bb) = func.inst_block(call) else {
                continue;
            };
            let (pos, first_non_phi) = {
                let Some(block) = func.block(bb) else {
                    continue;
                };
                let Some(pos) = block.insts.iter().position(|&i| i == call) else {
                    continue;
                };
                let first_non_phi = block
                    .insts
                    .iter()
                    .position(|&i| !func.inst(i).op.is_phi())
                    .unwrap_or(0);
                (pos, first_non_phi)
            };

            let (call_bb, call_pos) = if pos != first_non_phi {
                (split_block_at(func, bb, pos), 0)
            } else {
                (bb, pos)
            };
            split_block_at(func, call_bb, call_pos + 1);
            self.may_free_bbs.insert((fid, call_bb));
        }

        !finder.may_free_calls.is_empty()
    }
}

// ---- Check removal ---------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct CheckOptOptions {
    /// Hoist mode: insert a null-guarded key check before every call that
    /// passes a safe-pointer argument, and seed callee entry facts from
    /// parameter spill slots.
    pub add_check_before_call: bool,
}

/// Redundant key-check elimination.
#[derive(Debug, Default)]
pub struct CheckOpt {
    pub options: CheckOptOptions,
    /// Count of checks erased by the last run.
    pub removed: usize,
}

impl CheckOpt {
    pub fn new(options: CheckOptOptions) -> Self {
        Self {
            options,
            removed: 0,
        }
    }

    #[allow(clippy::result_unit_err)]
    pub fn run(
        &mut self,
        module: &mut Module,
        types: &mut TypeCtx,
        split: &SplitBlocks,
        finder: &FreeFinder,
        diag: &mut DiagnosticBag,
    ) -> Result<bool, ()> {
        let before = diag.error_count();
        let mut entry_seeds: HashMap<FnId, HashSet<Value>> = HashMap::new();
        if self.options.add_check_before_call {
            add_checks_for_calls(module, types, diag);
            entry_seeds = collect_entry_seeds(module, types);
        }
        if diag.error_count() > before {
            return Err(());
        }

        let mut changed = false;
        for idx in 0..module.functions.len() {
            let fid = FnId(idx as u32);
            {
                let func = module.function(fid);
                if func.is_declaration() || is_check_fn_name(&func.name) {
                    continue;
                }
            }
            let empty = HashSet::new();
            let seeds = entry_seeds.get(&fid).unwrap_or(&empty);
            let redundant = find_redundant_checks(module, fid, split, finder, seeds);
            if !redundant.is_empty() {
                let func = module.function_mut(fid);
                for iid in &redundant {
                    func.erase_inst(*iid);
                }
                self.removed += redundant.len();
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Walk one block, updating the checked-address set. Calls `on_check` for
/// every key check with whether the address was already checked.
fn apply_block_effect(
    module: &Module,
    func: &Function,
    finder: &FreeFinder,
    block: &mmsafe_ir::Block,
    set: &mut HashSet<Value>,
    mut on_check: impl FnMut(InstId, bool),
) {
    for &iid in &block.insts {
        match &func.inst(iid).op {
            Op::Call { args, .. } if module.check_call_kind(func, iid).is_some() => {
                if let Some(arg) = args.first() {
                    let addr = func.strip_pointer_casts(arg);
                    let already = !set.insert(addr);
                    on_check(iid, already);
                }
            }
            Op::Call { .. } if finder.may_free_calls.contains(&(func.id, iid)) => {
                set.clear();
            }
            Op::Store { ptr, .. } => {
                let addr = func.strip_pointer_casts(ptr);
                set.remove(&addr);
            }
            _ => {}
        }
    }
}

fn find_redundant_checks(
    module: &Module,
    fid: FnId,
    split: &SplitBlocks,
    finder: &FreeFinder,
    seeds: &HashSet<Value>,
) -> Vec<InstId> {
    let func = module.function(fid);
    let n = func.blocks.len();
    if n == 0 {
        return Vec::new();
    }
    let block_index = build_block_index(func);
    let successors: Vec<Vec<usize>> = func
        .blocks
        .iter()
        .map(|b| block_successors(b, &block_index))
        .collect();
    let preds = build_predecessors(n, &successors);
    let may_free: Vec<bool> = func
        .blocks
        .iter()
        .map(|b| split.may_free_bbs.contains(&(fid, b.id)))
        .collect();

    let mut bb_in: Vec<HashSet<Value>> = vec![HashSet::new(); n];
    let mut bb_out: Vec<HashSet<Value>> = vec![HashSet::new(); n];

    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..n {
            if may_free[i] {
                continue;
            }
            let new_in = if i == 0 {
                // The entry assumes nothing checked; hoist-mode seeds land on
                // its out-set below.
                HashSet::new()
            } else if preds[i].is_empty() || preds[i].iter().any(|&p| may_free[p]) {
                HashSet::new()
            } else {
                let mut iter = preds[i].iter();
                let first = *iter.next().unwrap();
                let mut acc = bb_out[first].clone();
                for &p in iter {
                    acc.retain(|v| bb_out[p].contains(v));
                }
                acc
            };

            let mut new_out = new_in.clone();
            apply_block_effect(module, func, finder, &func.blocks[i], &mut new_out, |_, _| {});
            if i == 0 {
                new_out.extend(seeds.iter().cloned());
            }
            if new_in != bb_in[i] || new_out != bb_out[i] {
                bb_in[i] = new_in;
                bb_out[i] = new_out;
                changed = true;
            }
        }
    }

    let mut redundant = Vec::new();
    for i in 0..n {
        let mut checked = if may_free[i] {
            HashSet::new()
        } else {
            bb_in[i].clone()
        };
        apply_block_effect(
            module,
            func,
            finder,
            &func.blocks[i],
            &mut checked,
            |iid, already| {
                if already {
                    redundant.push(iid);
                }
            },
        );
    }
    redundant
}

// ---- Hoist mode ------------------------------------------------------------

/// A safe-pointer argument detected at a call site, resolved to the address
/// of the aggregate it was loaded from.
struct HoistTarget {
    raw_arg: Value,
    addr: Value,
    kind: SafePtrKind,
    /// Set when the aggregate came out of a call and needs a spill slot.
    spill: Option<SpillPlan>,
}

struct SpillPlan {
    agg: Value,
    agg_ty: TypeId,
}

fn add_checks_for_calls(module: &mut Module, types: &mut TypeCtx, diag: &mut DiagnosticBag) {
    // Candidate sites are gathered before any mutation; call identity is
    // stable across the splits below.
    let mut sites: Vec<(FnId, InstId, Vec<HoistTarget>)> = Vec::new();
    for func in &module.functions {
        if func.is_declaration() || is_check_fn_name(&func.name) {
            continue;
        }
        for block in &func.blocks {
            for &iid in &block.insts {
                let Op::Call { callee, args, .. } = &func.inst(iid).op else {
                    continue;
                };
                if let Callee::Direct(target) = callee {
                    if is_check_fn_name(&module.function(*target).name) {
                        continue;
                    }
                }
                let targets = detect_safe_ptr_args(func, types, args);
                if !targets.is_empty() {
                    sites.push((func.id, iid, targets));
                }
            }
        }
    }
    if sites.is_empty() {
        return;
    }

    let needs_single = sites
        .iter()
        .any(|(_, _, ts)| ts.iter().any(|t| t.kind == SafePtrKind::Single));
    let needs_array = sites
        .iter()
        .any(|(_, _, ts)| ts.iter().any(|t| t.kind == SafePtrKind::Array));
    let single_helper =
        needs_single.then(|| ensure_check_helper(module, types, SafePtrKind::Single, diag));
    let array_helper =
        needs_array.then(|| ensure_check_helper(module, types, SafePtrKind::Array, diag));

    for (fid, call, targets) in sites {
        for target in targets {
            let helper = match target.kind {
                SafePtrKind::Single => single_helper,
                SafePtrKind::Array => array_helper,
            };
            let Some(helper) = helper else { continue };
            let Some(helper_param) = module.function(helper).params.first().copied() else {
                continue;
            };
            insert_pre_call_check(module, types, fid, call, &target, helper, helper_param);
        }
    }
}

/// Recognize the front-end's safe-pointer argument lowering: the raw pointer
/// followed by the key scalar (and the keylock for array-ptrs), with the raw
/// pointer traceable back to a loaded safe-pointer aggregate.
fn detect_safe_ptr_args(func: &Function, types: &TypeCtx, args: &[Value]) -> Vec<HoistTarget> {
    let mut out = Vec::new();
    for (k, arg) in args.iter().enumerate() {
        let Some(arg_ty) = func.value_type(arg) else {
            continue;
        };
        if types.element_type_of_pointer(arg_ty).is_none() {
            continue;
        }
        let Some((addr, kind, spill)) = trace_aggregate_address(func, types, arg) else {
            continue;
        };
        // The scalar tail after the pointer confirms the lowering shape.
        let key_ok = args
            .get(k + 1)
            .and_then(|a| func.value_type(a))
            .map(|ty| ty == fixed::I64)
            .unwrap_or(false);
        if !key_ok {
            continue;
        }
        if kind == SafePtrKind::Array && args.get(k + 2).is_none() {
            continue;
        }
        out.push(HoistTarget {
            raw_arg: arg.clone(),
            addr,
            kind,
            spill,
        });
    }
    out
}

fn trace_aggregate_address(
    func: &Function,
    types: &TypeCtx,
    arg: &Value,
) -> Option<(Value, SafePtrKind, Option<SpillPlan>)> {
    let Value::Inst(producer) = func.strip_pointer_casts(arg) else {
        return None;
    };
    match &func.inst(producer).op {
        // raw = extractfield(agg, 0) — check where the aggregate came from.
        Op::ExtractField { agg, index: 0 } => {
            let agg_ty = func.value_type(agg)?;
            let kind = types.safe_ptr_kind(agg_ty)?;
            match agg {
                Value::Inst(src) => match &func.inst(*src).op {
                    Op::Load { ptr } => Some((func.strip_pointer_casts(ptr), kind, None)),
                    Op::Call { .. } => Some((
                        Value::Inst(*src), // placeholder; replaced by the spill slot
                        kind,
                        Some(SpillPlan {
                            agg: agg.clone(),
                            agg_ty,
                        }),
                    )),
                    _ => None,
                },
                _ => None,
            }
        }
        // raw = load(fieldaddr(agg_addr, {0, 0}))
        Op::Load { ptr } => {
            let Value::Inst(addr_inst) = func.strip_pointer_casts(ptr) else {
                return None;
            };
            let Op::FieldAddr { base, indices } = &func.inst(addr_inst).op else {
                return None;
            };
            if indices.as_slice() != [0, 0] {
                return None;
            }
            let base_pointee = func
                .value_type(base)
                .and_then(|ty| types.element_type_of_pointer(ty))?;
            let kind = types.safe_ptr_kind(base_pointee)?;
            Some((func.strip_pointer_casts(base), kind, None))
        }
        _ => None,
    }
}

/// Find (or synthesize) the key-check helper for `kind`. The per-module
/// spelling is preferred when present.
fn ensure_check_helper(
    module: &mut Module,
    types: &mut TypeCtx,
    kind: SafePtrKind,
    diag: &mut DiagnosticBag,
) -> FnId {
    let base_name = match kind {
        SafePtrKind::Single => SINGLE_CHECK_FN,
        SafePtrKind::Array => ARRAY_CHECK_FN,
    };
    let prefixed = format!("{}_{}", module.name, base_name);
    if let Some(fid) = module.find_function(&prefixed) {
        return fid;
    }
    if let Some(fid) = module.find_function(base_name) {
        return fid;
    }

    diag.emit(Diagnostic::warning(
        codes::MMK0001,
        format!("key-check helper '{base_name}' not found; synthesizing a prototype"),
    ));
    let i8p = types.ptr_to(fixed::I8);
    let fields = match kind {
        SafePtrKind::Single => vec![i8p, fixed::I64],
        SafePtrKind::Array => {
            let keylock = types.ptr_to(fixed::I64);
            vec![i8p, fixed::I64, keylock]
        }
    };
    let st = types.struct_of(fields);
    let param = types.ptr_to(st);
    let fid = module.add_function(base_name, vec![param], fixed::VOID);
    module.function_mut(fid).conv = CallConv::Fast;
    fid
}

/// Split the call into its own block and guard it with a null check plus a
/// key-check call on the non-null branch.
fn insert_pre_call_check(
    module: &mut Module,
    types: &mut TypeCtx,
    fid: FnId,
    call: InstId,
    target: &HoistTarget,
    helper: FnId,
    helper_param: TypeId,
) {
    let spill_slot_ty = target.spill.as_ref().map(|s| types.ptr_to(s.agg_ty));
    let func = module.function_mut(fid);
    let Some(bb) = func.inst_block(call) else {
        return;
    };

    let mut addr = target.addr.clone();
    if let (Some(spill), Some(slot_ty)) = (&target.spill, spill_slot_ty) {
        // The aggregate only exists as a call result; give it a slot so the
        // check has an address to validate.
        let entry_bb = func.blocks[0].id;
        let slot = func.new_inst(Inst {
            ty: slot_ty,
            op: Op::StackAlloc {
                ty: spill.agg_ty,
                align: 16,
                multi_qualified: false,
            },
        });
        if let Some(block) = func.block_mut(entry_bb) {
            block.insts.insert(0, slot);
        }
        let store = func.new_inst(Inst {
            ty: fixed::VOID,
            op: Op::Store {
                val: spill.agg.clone(),
                ptr: Value::Inst(slot),
            },
        });
        func.insert_before(bb, call, &[store]);
        addr = Value::Inst(slot);
    }

    let raw_ty = func.value_type(&target.raw_arg).unwrap_or(fixed::VOID);
    // Position is looked up after the spill insertions above shifted the
    // block's instruction list.
    let Some(pos) = func
        .block(bb)
        .and_then(|b| b.insts.iter().position(|&i| i == call))
    else {
        return;
    };
    let call_bb = split_block_at(func, bb, pos);
    let check_bb = func.add_block();

    let cmp = func.push_inst(
        bb,
        Inst {
            ty: fixed::I1,
            op: Op::ICmp {
                pred: CmpPred::Ne,
                lhs: target.raw_arg.clone(),
                rhs: Value::Const(Const::null(raw_ty)),
            },
        },
    );
    func.set_terminator(
        bb,
        Terminator::CondBr {
            cond: Value::Inst(cmp),
            then_bb: check_bb,
            else_bb: call_bb,
        },
    );
    let cast = func.push_inst(
        check_bb,
        Inst {
            ty: helper_param,
            op: Op::PtrCast { v: addr },
        },
    );
    func.push_inst(
        check_bb,
        Inst {
            ty: fixed::VOID,
            op: Op::Call {
                callee: Callee::Direct(helper),
                args: vec![Value::Inst(cast)],
                conv: CallConv::Fast,
            },
        },
    );
    func.set_terminator(check_bb, Terminator::Br(call_bb));
}

/// Addresses checked at every hoisted call site: the entry-block spill slots
/// of safe-pointer type whose stored value is built purely from incoming
/// arguments.
fn collect_entry_seeds(module: &Module, types: &TypeCtx) -> HashMap<FnId, HashSet<Value>> {
    let mut seeds: HashMap<FnId, HashSet<Value>> = HashMap::new();
    for func in &module.functions {
        if func.is_declaration() || is_check_fn_name(&func.name) {
            continue;
        }
        let entry = &func.blocks[0];
        for &iid in &entry.insts {
            let Op::Store { val, ptr } = &func.inst(iid).op else {
                continue;
            };
            let Value::Inst(slot) = func.strip_pointer_casts(ptr) else {
                continue;
            };
            let is_safe_slot = matches!(
                &func.inst(slot).op,
                Op::StackAlloc { ty, .. } if types.is_safe_ptr(*ty)
            );
            if is_safe_slot && is_built_from_args(func, val) {
                seeds.entry(func.id).or_default().insert(Value::Inst(slot));
            }
        }
    }
    seeds
}

fn is_built_from_args(func: &Function, v: &Value) -> bool {
    match v {
        Value::Arg(_) | Value::Const(_) => true,
        Value::Inst(i) => match &func.inst(*i).op {
            Op::InsertField { agg, val, .. } => {
                is_built_from_args(func, agg) && is_built_from_args(func, val)
            }
            Op::PtrCast { v } => is_built_from_args(func, v),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_helpers(module: &mut Module, types: &mut TypeCtx) -> (FnId, FnId) {
        let i8p = types.ptr_to(fixed::I8);
        let single_st = types.struct_of(vec![i8p, fixed::I64]);
        let keylock = types.ptr_to(fixed::I64);
        let array_st = types.struct_of(vec![i8p, fixed::I64, keylock]);
        let single_param = types.ptr_to(single_st);
        let array_param = types.ptr_to(array_st);
        let s = module.add_function(SINGLE_CHECK_FN, vec![single_param], fixed::VOID);
        let a = module.add_function(ARRAY_CHECK_FN, vec![array_param], fixed::VOID);
        (s, a)
    }

    fn check_call(helper: FnId, addr: Value) -> Inst {
        Inst {
            ty: fixed::VOID,
            op: Op::Call {
                callee: Callee::Direct(helper),
                args: vec![addr],
                conv: CallConv::Fast,
            },
        }
    }

    fn count_check_calls(module: &Module, fid: FnId) -> usize {
        let func = module.function(fid);
        func.blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter(|&&iid| module.check_call_kind(func, iid).is_some())
            .count()
    }

    /// Function with a multi-qual-free stack slot of single-ptr type; returns
    /// (module, fid, slot).
    fn fn_with_slot(types: &mut TypeCtx) -> (Module, FnId, InstId) {
        let sp = types.single_ptr_to(fixed::I32);
        let ptr_sp = types.ptr_to(sp);
        let mut module = Module::new("prog");
        let fid = module.add_function("f", vec![], fixed::VOID);
        let func = module.function_mut(fid);
        let bb = func.add_block();
        let slot = func.push_inst(
            bb,
            Inst {
                ty: ptr_sp,
                op: Op::StackAlloc {
                    ty: sp,
                    align: 16,
                    multi_qualified: false,
                },
            },
        );
        func.set_terminator(bb, Terminator::Ret(None));
        (module, fid, slot)
    }

    #[test]
    fn test_split_isolates_may_free_call() {
        let mut module = Module::new("prog");
        let free = module.add_function("free", vec![], fixed::VOID);
        let fid = module.add_function("f", vec![], fixed::VOID);
        let func = module.function_mut(fid);
        let bb = func.add_block();
        let c0 = Value::Const(Const::int(fixed::I32, 0));
        let a = func.push_inst(
            bb,
            Inst {
                ty: fixed::I1,
                op: Op::ICmp {
                    pred: CmpPred::Eq,
                    lhs: c0.clone(),
                    rhs: c0.clone(),
                },
            },
        );
        let call = func.push_inst(
            bb,
            Inst {
                ty: fixed::VOID,
                op: Op::Call {
                    callee: Callee::Direct(free),
                    args: vec![],
                    conv: CallConv::C,
                },
            },
        );
        let b = func.push_inst(
            bb,
            Inst {
                ty: fixed::I1,
                op: Op::ICmp {
                    pred: CmpPred::Ne,
                    lhs: c0.clone(),
                    rhs: c0,
                },
            },
        );
        func.set_terminator(bb, Terminator::Ret(None));

        let mut finder = FreeFinder::new();
        finder.run(&module);
        assert!(finder.may_free_calls.contains(&(fid, call)));

        let mut splitter = SplitBlocks::new();
        assert!(splitter.run(&mut module, &finder));

        let func = module.function(fid);
        assert_eq!(func.blocks.len(), 3);
        let call_bb = func.inst_block(call).unwrap();
        assert!(splitter.may_free_bbs.contains(&(fid, call_bb)));
        // The may-free call is alone, followed only by the terminator.
        let call_block = func.block(call_bb).unwrap();
        assert_eq!(call_block.insts, vec![call]);
        assert!(matches!(call_block.terminator, Terminator::Br(_)));
        // Leading and trailing instructions stayed in the outer blocks.
        assert_eq!(func.inst_block(a), Some(func.blocks[0].id));
        let tail_bb = func.inst_block(b).unwrap();
        assert_ne!(tail_bb, call_bb);
        assert_eq!(func.block(tail_bb).unwrap().terminator, Terminator::Ret(None));
    }

    #[test]
    fn test_split_skips_presplit_when_call_is_first() {
        let mut module = Module::new("prog");
        let free = module.add_function("free", vec![], fixed::VOID);
        let fid = module.add_function("f", vec![], fixed::VOID);
        let func = module.function_mut(fid);
        let bb = func.add_block();
        let call = func.push_inst(
            bb,
            Inst {
                ty: fixed::VOID,
                op: Op::Call {
                    callee: Callee::Direct(free),
                    args: vec![],
                    conv: CallConv::C,
                },
            },
        );
        func.set_terminator(bb, Terminator::Ret(None));

        let mut finder = FreeFinder::new();
        finder.run(&module);
        let mut splitter = SplitBlocks::new();
        splitter.run(&mut module, &finder);

        let func = module.function(fid);
        assert_eq!(func.blocks.len(), 2);
        assert_eq!(func.inst_block(call), Some(bb));
        assert!(splitter.may_free_bbs.contains(&(fid, bb)));
    }

    #[test]
    fn test_back_to_back_checks_lose_the_second() {
        let mut types = TypeCtx::new();
        let (mut module, fid, slot) = fn_with_slot(&mut types);
        let (single, _) = check_helpers(&mut module, &mut types);
        let bb = module.function(fid).blocks[0].id;
        let first = module
            .function_mut(fid)
            .push_inst(bb, check_call(single, Value::Inst(slot)));
        let second = module
            .function_mut(fid)
            .push_inst(bb, check_call(single, Value::Inst(slot)));

        let finder = {
            let mut f = FreeFinder::new();
            f.run(&module);
            f
        };
        let splitter = SplitBlocks::new();
        let mut opt = CheckOpt::new(CheckOptOptions::default());
        let mut diag = DiagnosticBag::new(16);
        let checks_before = count_check_calls(&module, fid);
        assert_eq!(
            opt.run(&mut module, &mut types, &splitter, &finder, &mut diag),
            Ok(true)
        );
        assert_eq!(opt.removed, 1);
        assert_eq!(
            checks_before - count_check_calls(&module, fid),
            opt.removed
        );
        let func = module.function(fid);
        assert_ne!(func.inst(first).op, Op::Removed);
        assert_eq!(func.inst(second).op, Op::Removed);
    }

    #[test]
    fn test_store_kills_checked_address() {
        let mut types = TypeCtx::new();
        let sp = types.single_ptr_to(fixed::I32);
        let (mut module, fid, slot) = fn_with_slot(&mut types);
        let (single, _) = check_helpers(&mut module, &mut types);
        let bb = module.function(fid).blocks[0].id;
        module
            .function_mut(fid)
            .push_inst(bb, check_call(single, Value::Inst(slot)));
        module.function_mut(fid).push_inst(
            bb,
            Inst {
                ty: fixed::VOID,
                op: Op::Store {
                    val: Value::Const(Const {
                        ty: sp,
                        lit: mmsafe_ir::ConstLit::Undef,
                    }),
                    ptr: Value::Inst(slot),
                },
            },
        );
        module
            .function_mut(fid)
            .push_inst(bb, check_call(single, Value::Inst(slot)));

        let finder = {
            let mut f = FreeFinder::new();
            f.run(&module);
            f
        };
        let splitter = SplitBlocks::new();
        let mut opt = CheckOpt::new(CheckOptOptions::default());
        let mut diag = DiagnosticBag::new(16);
        assert_eq!(
            opt.run(&mut module, &mut types, &splitter, &finder, &mut diag),
            Ok(false)
        );
        assert_eq!(opt.removed, 0);
    }

    #[test]
    fn test_may_free_block_kills_facts_downstream() {
        let mut types = TypeCtx::new();
        let (mut module, fid, slot) = fn_with_slot(&mut types);
        let (single, _) = check_helpers(&mut module, &mut types);
        let free = module.add_function("free", vec![], fixed::VOID);
        let b1 = module.function(fid).blocks[0].id;
        module
            .function_mut(fid)
            .push_inst(b1, check_call(single, Value::Inst(slot)));
        module.function_mut(fid).push_inst(
            b1,
            Inst {
                ty: fixed::VOID,
                op: Op::Call {
                    callee: Callee::Direct(free),
                    args: vec![],
                    conv: CallConv::C,
                },
            },
        );
        let recheck = module
            .function_mut(fid)
            .push_inst(b1, check_call(single, Value::Inst(slot)));

        let mut finder = FreeFinder::new();
        finder.run(&module);
        let mut splitter = SplitBlocks::new();
        splitter.run(&mut module, &finder);

        // After splitting: check | may-free call | re-check, across blocks.
        let mut opt = CheckOpt::new(CheckOptOptions::default());
        let mut diag = DiagnosticBag::new(16);
        assert_eq!(
            opt.run(&mut module, &mut types, &splitter, &finder, &mut diag),
            Ok(false)
        );
        assert_eq!(opt.removed, 0);
        assert_ne!(module.function(fid).inst(recheck).op, Op::Removed);
    }

    #[test]
    fn test_join_of_checked_paths_is_redundant() {
        let mut types = TypeCtx::new();
        let (mut module, fid, slot) = fn_with_slot(&mut types);
        let (single, _) = check_helpers(&mut module, &mut types);
        let func = module.function_mut(fid);
        let b0 = func.blocks[0].id;
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        let cond = func.push_inst(
            b0,
            Inst {
                ty: fixed::I1,
                op: Op::ICmp {
                    pred: CmpPred::Eq,
                    lhs: Value::Const(Const::int(fixed::I32, 0)),
                    rhs: Value::Const(Const::int(fixed::I32, 0)),
                },
            },
        );
        func.set_terminator(
            b0,
            Terminator::CondBr {
                cond: Value::Inst(cond),
                then_bb: b1,
                else_bb: b2,
            },
        );
        module
            .function_mut(fid)
            .push_inst(b1, check_call(single, Value::Inst(slot)));
        module.function_mut(fid).set_terminator(b1, Terminator::Br(b3));
        module
            .function_mut(fid)
            .push_inst(b2, check_call(single, Value::Inst(slot)));
        module.function_mut(fid).set_terminator(b2, Terminator::Br(b3));
        let join_check = module
            .function_mut(fid)
            .push_inst(b3, check_call(single, Value::Inst(slot)));
        module
            .function_mut(fid)
            .set_terminator(b3, Terminator::Ret(None));

        let finder = {
            let mut f = FreeFinder::new();
            f.run(&module);
            f
        };
        let splitter = SplitBlocks::new();
        let mut opt = CheckOpt::new(CheckOptOptions::default());
        let mut diag = DiagnosticBag::new(16);
        assert_eq!(
            opt.run(&mut module, &mut types, &splitter, &finder, &mut diag),
            Ok(true)
        );
        assert_eq!(opt.removed, 1);
        assert_eq!(module.function(fid).inst(join_check).op, Op::Removed);
    }

    #[test]
    fn test_hoist_inserts_null_guarded_check() {
        let mut types = TypeCtx::new();
        let sp = types.single_ptr_to(fixed::I32);
        let ptr_sp = types.ptr_to(sp);
        let raw = types.ptr_to(fixed::I32);
        let mut module = Module::new("prog");
        let (single, _) = check_helpers(&mut module, &mut types);
        let callee = module.add_function("consume", vec![raw, fixed::I64], fixed::VOID);
        let fid = module.add_function("f", vec![], fixed::VOID);
        let func = module.function_mut(fid);
        let bb = func.add_block();
        let slot = func.push_inst(
            bb,
            Inst {
                ty: ptr_sp,
                op: Op::StackAlloc {
                    ty: sp,
                    align: 16,
                    multi_qualified: false,
                },
            },
        );
        let agg = func.push_inst(
            bb,
            Inst {
                ty: sp,
                op: Op::Load {
                    ptr: Value::Inst(slot),
                },
            },
        );
        let raw_val = func.push_inst(
            bb,
            Inst {
                ty: raw,
                op: Op::ExtractField {
                    agg: Value::Inst(agg),
                    index: 0,
                },
            },
        );
        let key = func.push_inst(
            bb,
            Inst {
                ty: fixed::I64,
                op: Op::ExtractField {
                    agg: Value::Inst(agg),
                    index: 1,
                },
            },
        );
        let call = func.push_inst(
            bb,
            Inst {
                ty: fixed::VOID,
                op: Op::Call {
                    callee: Callee::Direct(callee),
                    args: vec![Value::Inst(raw_val), Value::Inst(key)],
                    conv: CallConv::C,
                },
            },
        );
        func.set_terminator(bb, Terminator::Ret(None));

        let finder = {
            let mut f = FreeFinder::new();
            f.whitelist.insert("consume".to_string());
            f.run(&module);
            f
        };
        let splitter = SplitBlocks::new();
        let mut opt = CheckOpt::new(CheckOptOptions {
            add_check_before_call: true,
        });
        let mut diag = DiagnosticBag::new(16);
        opt.run(&mut module, &mut types, &splitter, &finder, &mut diag)
            .expect("hoist run");

        let func = module.function(fid);
        // The call moved to its own block behind a null-check diamond.
        let call_bb = func.inst_block(call).unwrap();
        assert_ne!(call_bb, bb);
        let entry = func.block(bb).unwrap();
        let Terminator::CondBr {
            then_bb, else_bb, ..
        } = entry.terminator
        else {
            panic!("expected null-check diamond, got {:?}", entry.terminator);
        };
        assert_eq!(else_bb, call_bb);
        let check_block = func.block(then_bb).unwrap();
        assert_eq!(check_block.terminator, Terminator::Br(call_bb));
        let inserted = check_block
            .insts
            .iter()
            .find(|&&iid| module.check_call_kind(func, iid).is_some())
            .copied()
            .expect("inserted check call");
        match &func.inst(inserted).op {
            Op::Call { callee, args, conv } => {
                assert_eq!(callee, &Callee::Direct(single));
                assert_eq!(*conv, CallConv::Fast);
                // The checked address resolves to the aggregate's slot.
                assert_eq!(
                    func.strip_pointer_casts(&args[0]),
                    Value::Inst(slot)
                );
            }
            other => panic!("expected check call, got {other:?}"),
        }
    }

    #[test]
    fn test_hoist_synthesizes_missing_helper() {
        let mut types = TypeCtx::new();
        let sp = types.single_ptr_to(fixed::I32);
        let ptr_sp = types.ptr_to(sp);
        let raw = types.ptr_to(fixed::I32);
        let mut module = Module::new("prog");
        let callee = module.add_function("consume", vec![raw, fixed::I64], fixed::VOID);
        let fid = module.add_function("f", vec![], fixed::VOID);
        let func = module.function_mut(fid);
        let bb = func.add_block();
        let slot = func.push_inst(
            bb,
            Inst {
                ty: ptr_sp,
                op: Op::StackAlloc {
                    ty: sp,
                    align: 16,
                    multi_qualified: false,
                },
            },
        );
        let agg = func.push_inst(
            bb,
            Inst {
                ty: sp,
                op: Op::Load {
                    ptr: Value::Inst(slot),
                },
            },
        );
        let raw_val = func.push_inst(
            bb,
            Inst {
                ty: raw,
                op: Op::ExtractField {
                    agg: Value::Inst(agg),
                    index: 0,
                },
            },
        );
        func.push_inst(
            bb,
            Inst {
                ty: fixed::VOID,
                op: Op::Call {
                    callee: Callee::Direct(callee),
                    args: vec![
                        Value::Inst(raw_val),
                        Value::Const(Const::int(fixed::I64, 0)),
                    ],
                    conv: CallConv::C,
                },
            },
        );
        func.set_terminator(bb, Terminator::Ret(None));

        let finder = {
            let mut f = FreeFinder::new();
            f.whitelist.insert("consume".to_string());
            f.run(&module);
            f
        };
        let splitter = SplitBlocks::new();
        let mut opt = CheckOpt::new(CheckOptOptions {
            add_check_before_call: true,
        });
        let mut diag = DiagnosticBag::new(16);
        opt.run(&mut module, &mut types, &splitter, &finder, &mut diag)
            .expect("hoist run");
        assert!(diag.diagnostics.iter().any(|d| d.code == codes::MMK0001));
        let helper = module.find_function(SINGLE_CHECK_FN).expect("helper");
        assert_eq!(module.function(helper).conv, CallConv::Fast);
        assert_eq!(module.function(helper).params.len(), 1);
    }

    #[test]
    fn test_entry_seeds_make_param_spill_check_redundant() {
        let mut types = TypeCtx::new();
        let sp = types.single_ptr_to(fixed::I32);
        let ptr_sp = types.ptr_to(sp);
        let raw = types.ptr_to(fixed::I32);
        let mut module = Module::new("prog");
        let (single, _) = check_helpers(&mut module, &mut types);
        let fid = module.add_function("g", vec![raw, fixed::I64], fixed::VOID);
        let func = module.function_mut(fid);
        let b0 = func.add_block();
        let b1 = func.add_block();
        let slot = func.push_inst(
            b0,
            Inst {
                ty: ptr_sp,
                op: Op::StackAlloc {
                    ty: sp,
                    align: 16,
                    multi_qualified: false,
                },
            },
        );
        let with_raw = func.push_inst(
            b0,
            Inst {
                ty: sp,
                op: Op::InsertField {
                    agg: Value::Const(Const {
                        ty: sp,
                        lit: mmsafe_ir::ConstLit::Undef,
                    }),
                    val: Value::Arg(0),
                    index: 0,
                },
            },
        );
        let with_key = func.push_inst(
            b0,
            Inst {
                ty: sp,
                op: Op::InsertField {
                    agg: Value::Inst(with_raw),
                    val: Value::Arg(1),
                    index: 1,
                },
            },
        );
        func.push_inst(
            b0,
            Inst {
                ty: fixed::VOID,
                op: Op::Store {
                    val: Value::Inst(with_key),
                    ptr: Value::Inst(slot),
                },
            },
        );
        func.set_terminator(b0, Terminator::Br(b1));
        let spill_check = module
            .function_mut(fid)
            .push_inst(b1, check_call(single, Value::Inst(slot)));
        module
            .function_mut(fid)
            .set_terminator(b1, Terminator::Ret(None));

        let finder = {
            let mut f = FreeFinder::new();
            f.run(&module);
            f
        };
        let splitter = SplitBlocks::new();

        // Without hoist mode the check must stay.
        let mut opt = CheckOpt::new(CheckOptOptions::default());
        let mut diag = DiagnosticBag::new(16);
        let mut probe = module.clone();
        assert_eq!(
            opt.run(&mut probe, &mut types, &splitter, &finder, &mut diag),
            Ok(false)
        );

        // With hoist mode the spilled parameter is pre-checked at entry.
        let mut opt = CheckOpt::new(CheckOptOptions {
            add_check_before_call: true,
        });
        assert_eq!(
            opt.run(&mut module, &mut types, &splitter, &finder, &mut diag),
            Ok(true)
        );
        assert_eq!(opt.removed, 1);
        assert_eq!(module.function(fid).inst(spill_check).op, Op::Removed);
    }
}
