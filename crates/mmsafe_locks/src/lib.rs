//! Lock insertion for multi-qualified storage.
//!
//! Every multi-qualified stack slot or global of type `T` is rewritten into a
//! lock-carrying aggregate: `{ i64 lock, T }` for plain `T`, or
//! `{ i64 pad, i64 lock, T }` when `T` is a safe pointer (the padding keeps
//! the safe-pointer payload at offset 16 under whole-struct alignment 16).
//! Stack locks initialize to 1, global locks to 2. All uses of the original
//! symbol are redirected to the inner payload field.

use mmsafe_diag::{codes, Diagnostic, DiagnosticBag};
use mmsafe_ir::{
    fixed, Const, ConstLit, FnId, Global, Inst, InstId, Linkage, Module, Op, TypeCtx, TypeId,
    Value,
};

/// Lock value stored for stack objects.
pub const STACK_LOCK: i64 = 1;
/// Lock value stored for global objects.
pub const GLOBAL_LOCK: i64 = 2;

/// Suffix appended to rewritten global names.
pub const GLOBAL_SUFFIX: &str = "_multiple";

/// Run the pass. Returns `Ok(true)` iff the module was changed. Rejects
/// thread-local multi-qualified storage before touching the module.
#[allow(clippy::result_unit_err)]
pub fn insert_locks(
    module: &mut Module,
    types: &mut TypeCtx,
    diag: &mut DiagnosticBag,
) -> Result<bool, ()> {
    let before = diag.error_count();
    for global in module.globals() {
        if global.multi_qualified && global.thread_local {
            diag.emit(
                Diagnostic::error(
                    codes::MML0001,
                    "thread-local storage cannot be multi-qualified",
                )
                .with_subject(format!("@{}", global.name)),
            );
        }
    }
    if diag.error_count() > before {
        return Err(());
    }

    let stack_changed = rewrite_stack_slots(module, types);
    let global_changed = rewrite_globals(module, types);
    Ok(stack_changed || global_changed)
}

/// Field layout of the lock-carrying wrapper for an inner type.
struct LockLayout {
    struct_ty: TypeId,
    lock_index: u32,
    inner_index: u32,
    align: u32,
}

fn lock_layout(types: &mut TypeCtx, inner: TypeId) -> LockLayout {
    if types.is_safe_ptr(inner) {
        let struct_ty = types.struct_of(vec![fixed::I64, fixed::I64, inner]);
        LockLayout {
            struct_ty,
            lock_index: 1,
            inner_index: 2,
            align: 16,
        }
    } else {
        let struct_ty = types.struct_of(vec![fixed::I64, inner]);
        let align = types.layout(struct_ty).align as u32;
        LockLayout {
            struct_ty,
            lock_index: 0,
            inner_index: 1,
            align,
        }
    }
}

fn rewrite_stack_slots(module: &mut Module, types: &mut TypeCtx) -> bool {
    // Collect first; the rewrite below splices into the entry block.
    let mut multi_slots: Vec<(FnId, InstId)> = Vec::new();
    for func in &module.functions {
        if func.is_declaration() {
            continue;
        }
        // All stack allocations reside in the entry block.
        let entry = &func.blocks[0];
        for &iid in &entry.insts {
            if let Op::StackAlloc {
                multi_qualified: true,
                ..
            } = func.inst(iid).op
            {
                multi_slots.push((func.id, iid));
            }
        }
    }

    for &(fid, old) in &multi_slots {
        let inner = match &module.function(fid).inst(old).op {
            Op::StackAlloc { ty, .. } => *ty,
            _ => continue,
        };
        let layout = lock_layout(types, inner);
        let ptr_struct = types.ptr_to(layout.struct_ty);
        let ptr_lock = types.ptr_to(fixed::I64);
        let ptr_inner = types.ptr_to(inner);

        let func = module.function_mut(fid);
        let entry_bb = func.blocks[0].id;
        let new_alloca = func.new_inst(Inst {
            ty: ptr_struct,
            op: Op::StackAlloc {
                ty: layout.struct_ty,
                align: layout.align,
                multi_qualified: false,
            },
        });
        let lock_addr = func.new_inst(Inst {
            ty: ptr_lock,
            op: Op::FieldAddr {
                base: Value::Inst(new_alloca),
                indices: vec![0, layout.lock_index],
            },
        });
        let lock_store = func.new_inst(Inst {
            ty: fixed::VOID,
            op: Op::Store {
                val: Value::Const(Const::int(fixed::I64, STACK_LOCK)),
                ptr: Value::Inst(lock_addr),
            },
        });
        let inner_addr = func.new_inst(Inst {
            ty: ptr_inner,
            op: Op::FieldAddr {
                base: Value::Inst(new_alloca),
                indices: vec![0, layout.inner_index],
            },
        });
        func.insert_before(entry_bb, old, &[new_alloca, lock_addr, lock_store, inner_addr]);
        func.replace_all_uses(old, &Value::Inst(inner_addr));
        func.erase_inst(old);
    }

    !multi_slots.is_empty()
}

fn rewrite_globals(module: &mut Module, types: &mut TypeCtx) -> bool {
    let multi_globals: Vec<_> = module
        .globals()
        .filter(|g| g.multi_qualified)
        .map(|g| g.id)
        .collect();

    for &gid in &multi_globals {
        // Common linkage only allows zero-initialization; promote so the
        // non-zero lock initializer can be attached.
        if let Some(global) = module.global_mut(gid) {
            if global.has_common_linkage() {
                global.linkage = Linkage::External;
            }
        }
        let Some(old) = module.global(gid).cloned() else {
            continue;
        };
        let Some(inner) = old.value_type(types) else {
            continue;
        };
        let addr_space = types.addr_space_of(old.ty);
        let layout = lock_layout(types, inner);
        let lock = Const::int(fixed::I64, GLOBAL_LOCK);
        let pad = Const::int(fixed::I64, 0);
        let init = old.init.clone().map(|init| Const {
            ty: layout.struct_ty,
            lit: if layout.inner_index == 2 {
                ConstLit::Struct(vec![pad, lock, init])
            } else {
                ConstLit::Struct(vec![lock, init])
            },
        });

        let new_ty = types.ptr_in(layout.struct_ty, addr_space);
        let new_gid = module.add_global(Global {
            id: gid, // reassigned by add_global
            name: format!("{}{}", old.name, GLOBAL_SUFFIX),
            ty: new_ty,
            is_const: old.is_const,
            init,
            linkage: old.linkage,
            thread_local: false,
            externally_initialized: old.externally_initialized,
            multi_qualified: false,
            align: Some(16),
        });

        let inner_ptr_ty = types.ptr_in(inner, addr_space);
        let inner_addr = Const {
            ty: inner_ptr_ty,
            lit: ConstLit::GlobalFieldAddr {
                global: new_gid,
                indices: vec![0, layout.inner_index],
            },
        };
        module.replace_global_uses(gid, &inner_addr);
        module.erase_global(gid);
    }

    !multi_globals.is_empty()
}
