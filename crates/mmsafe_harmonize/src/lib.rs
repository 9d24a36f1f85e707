//! Safe-pointer type harmonization.
//!
//! The front-end mutates the observed type of a safe-pointer value between
//! its aggregate form and the raw pointer it contains at certain dereference
//! sites, leaving ill-formed loads and stores behind. This pass repairs them:
//! an ill-formed load becomes a field address of the raw-pointer slot plus a
//! load of the raw pointer (with a whole-aggregate load spliced in for
//! `extractfield`/`insertfield` users), and an ill-formed store gets its
//! producing `insertfield` re-tagged to the aggregate type with an
//! `extractfield` recovering the raw pointer for loads that consumed it.

use mmsafe_diag::{codes, Diagnostic, DiagnosticBag};
use mmsafe_ir::{display_inst, FnId, Inst, InstId, Module, Op, TypeCtx, TypeId, TypeKind, Value};

/// Run the pass over every function. Returns `Ok(true)` iff any instruction
/// was repaired. An ill-formed store whose value producer is not an
/// `insertfield` is a fatal precondition error, reported before any rewrite.
#[allow(clippy::result_unit_err)]
pub fn harmonize_types(
    module: &mut Module,
    types: &mut TypeCtx,
    diag: &mut DiagnosticBag,
) -> Result<bool, ()> {
    let before = diag.error_count();
    let mut ill_loads: Vec<(FnId, InstId)> = Vec::new();
    let mut ill_stores: Vec<(FnId, InstId, InstId)> = Vec::new();

    for func in &module.functions {
        for block in &func.blocks {
            for &iid in &block.insts {
                let inst = func.inst(iid);
                match &inst.op {
                    Op::Load { ptr } => {
                        if let Some(pointee) = pointee_of_value(func, types, ptr) {
                            if types.is_safe_ptr(pointee) && !types.is_safe_ptr(inst.ty) {
                                ill_loads.push((func.id, iid));
                            }
                        }
                    }
                    Op::Store { val, ptr } => {
                        let Some(pointee) = pointee_of_value(func, types, ptr) else {
                            continue;
                        };
                        if !is_mistagged_store_value(func, types, val, pointee) {
                            continue;
                        }
                        match val {
                            Value::Inst(producer)
                                if matches!(
                                    func.inst(*producer).op,
                                    Op::InsertField { .. }
                                ) =>
                            {
                                ill_stores.push((func.id, iid, *producer));
                            }
                            _ => {
                                diag.emit(
                                    Diagnostic::error(
                                        codes::MMH0001,
                                        format!(
                                            "ill-formed store value is not produced by an insertfield in fn '{}'",
                                            func.name
                                        ),
                                    )
                                    .with_subject(display_inst(module, func, iid)),
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    if diag.error_count() > before {
        return Err(());
    }

    for &(fid, old) in &ill_loads {
        repair_load(module.function_mut(fid), types, old);
    }
    for &(fid, store, producer) in &ill_stores {
        repair_store(module.function_mut(fid), types, store, producer);
    }

    Ok(!ill_loads.is_empty() || !ill_stores.is_empty())
}

fn pointee_of_value(
    func: &mmsafe_ir::Function,
    types: &TypeCtx,
    ptr: &Value,
) -> Option<TypeId> {
    func.value_type(ptr)
        .and_then(|ty| types.element_type_of_pointer(ty))
}

/// The store writes a raw array-ptr where the slot holds the aggregate:
/// the value's type is `X*` while the pointee is `mmarrayptr<X>`.
fn is_mistagged_store_value(
    func: &mmsafe_ir::Function,
    types: &TypeCtx,
    val: &Value,
    pointee: TypeId,
) -> bool {
    let TypeKind::ArrayPtr { pointee: elem } = types.kind(pointee) else {
        return false;
    };
    let Some(val_ty) = func.value_type(val) else {
        return false;
    };
    matches!(types.kind(val_ty), TypeKind::Ptr { pointee: p, .. } if p == elem)
}

fn repair_load(func: &mut mmsafe_ir::Function, types: &mut TypeCtx, old: InstId) {
    let (ptr, raw_ty) = {
        let inst = func.inst(old);
        match &inst.op {
            Op::Load { ptr } => (ptr.clone(), inst.ty),
            _ => return,
        }
    };
    let Some(agg_ty) = func
        .value_type(&ptr)
        .and_then(|ty| types.element_type_of_pointer(ty))
    else {
        return;
    };
    let Some(bb) = func.inst_block(old) else {
        return;
    };

    let agg_users: Vec<InstId> = func
        .users_of(old)
        .into_iter()
        .filter(|&u| {
            matches!(
                func.inst(u).op,
                Op::ExtractField { .. } | Op::InsertField { .. }
            )
        })
        .collect();

    let raw_addr_ty = types.ptr_to(raw_ty);
    let mut prefix: Vec<InstId> = Vec::new();

    // The aggregate reload feeds extract/insert chains created for `*p++`.
    let agg_load = if agg_users.is_empty() {
        None
    } else {
        let id = func.new_inst(Inst {
            ty: agg_ty,
            op: Op::Load { ptr: ptr.clone() },
        });
        prefix.push(id);
        Some(id)
    };

    let raw_addr = func.new_inst(Inst {
        ty: raw_addr_ty,
        op: Op::FieldAddr {
            base: ptr,
            indices: vec![0, 0],
        },
    });
    prefix.push(raw_addr);
    let raw_load = func.new_inst(Inst {
        ty: raw_ty,
        op: Op::Load {
            ptr: Value::Inst(raw_addr),
        },
    });
    prefix.push(raw_load);
    func.insert_before(bb, old, &prefix);

    if let Some(agg_load) = agg_load {
        for u in agg_users {
            func.inst_mut(u).op.for_each_value_mut(|v| {
                if *v == Value::Inst(old) {
                    *v = Value::Inst(agg_load);
                }
            });
        }
    }
    func.replace_all_uses(old, &Value::Inst(raw_load));
    func.erase_inst(old);
}

fn repair_store(
    func: &mut mmsafe_ir::Function,
    types: &mut TypeCtx,
    store: InstId,
    producer: InstId,
) {
    let Some(agg_ty) = (match &func.inst(store).op {
        Op::Store { ptr, .. } => func
            .value_type(ptr)
            .and_then(|ty| types.element_type_of_pointer(ty)),
        _ => None,
    }) else {
        return;
    };
    let raw_ty = func.inst(producer).ty;
    let Some(bb) = func.inst_block(store) else {
        return;
    };

    // The front-end only mis-observed the insertfield's result type; its true
    // result is the aggregate.
    func.inst_mut(producer).ty = agg_ty;

    let extract = func.new_inst(Inst {
        ty: raw_ty,
        op: Op::ExtractField {
            agg: Value::Inst(producer),
            index: 0,
        },
    });
    func.insert_before(bb, store, &[extract]);

    let users = func.users_of(producer);
    for u in users {
        if u == extract || u == store {
            continue;
        }
        if let Op::Load { ptr } = &mut func.inst_mut(u).op {
            if *ptr == Value::Inst(producer) {
                *ptr = Value::Inst(extract);
            }
        }
    }
}
