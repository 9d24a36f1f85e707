//! mmsafe type system: type interning, safe-pointer representations, layout.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct TypeId(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct FnId(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct BlockId(pub u32);

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct InstId(pub u32);

/// The two memory-safe pointer kinds.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum SafePtrKind {
    Single,
    Array,
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum TypeKind {
    Void,
    Int(u32),
    Ptr { pointee: TypeId, addr_space: u32 },
    Struct { fields: Vec<TypeId> },
    /// Safe pointer to a single object; represented as `{ raw, key }`.
    SinglePtr { pointee: TypeId },
    /// Safe pointer with arithmetic; represented as `{ raw, key, keylock }`.
    ArrayPtr { pointee: TypeId },
    Fn { params: Vec<TypeId>, ret: TypeId },
}

/// Well-known type ids, interned by `TypeCtx::new` in this order.
pub mod fixed {
    use super::TypeId;
    pub const VOID: TypeId = TypeId(0);
    pub const I1: TypeId = TypeId(1);
    pub const I8: TypeId = TypeId(2);
    pub const I16: TypeId = TypeId(3);
    pub const I32: TypeId = TypeId(4);
    pub const I64: TypeId = TypeId(5);
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeLayout {
    pub size: u64,
    pub align: u64,
    /// Byte offset of each field; empty for non-aggregates.
    pub field_offsets: Vec<u64>,
}

/// Hash-consing type table. `TypeId`s are stable for the life of the context.
#[derive(Debug, Default)]
pub struct TypeCtx {
    types: Vec<TypeKind>,
    interned: HashMap<TypeKind, TypeId>,
}

impl TypeCtx {
    pub fn new() -> Self {
        let mut ctx = Self {
            types: Vec::with_capacity(32),
            interned: HashMap::new(),
        };
        for kind in [
            TypeKind::Void,
            TypeKind::Int(1),
            TypeKind::Int(8),
            TypeKind::Int(16),
            TypeKind::Int(32),
            TypeKind::Int(64),
        ] {
            ctx.intern(kind);
        }
        ctx
    }

    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(&id) = self.interned.get(&kind) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(kind.clone());
        self.interned.insert(kind, id);
        id
    }

    pub fn kind(&self, ty: TypeId) -> &TypeKind {
        &self.types[ty.0 as usize]
    }

    pub fn int(&mut self, width: u32) -> TypeId {
        self.intern(TypeKind::Int(width))
    }

    pub fn ptr_to(&mut self, pointee: TypeId) -> TypeId {
        self.ptr_in(pointee, 0)
    }

    pub fn ptr_in(&mut self, pointee: TypeId, addr_space: u32) -> TypeId {
        self.intern(TypeKind::Ptr { pointee, addr_space })
    }

    pub fn struct_of(&mut self, fields: Vec<TypeId>) -> TypeId {
        self.intern(TypeKind::Struct { fields })
    }

    pub fn single_ptr_to(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeKind::SinglePtr { pointee })
    }

    pub fn array_ptr_to(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeKind::ArrayPtr { pointee })
    }

    pub fn fn_of(&mut self, params: Vec<TypeId>, ret: TypeId) -> TypeId {
        self.intern(TypeKind::Fn { params, ret })
    }

    pub fn is_single_ptr(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::SinglePtr { .. })
    }

    pub fn is_array_ptr(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::ArrayPtr { .. })
    }

    pub fn is_safe_ptr(&self, ty: TypeId) -> bool {
        self.safe_ptr_kind(ty).is_some()
    }

    pub fn safe_ptr_kind(&self, ty: TypeId) -> Option<SafePtrKind> {
        match self.kind(ty) {
            TypeKind::SinglePtr { .. } => Some(SafePtrKind::Single),
            TypeKind::ArrayPtr { .. } => Some(SafePtrKind::Array),
            _ => None,
        }
    }

    /// Pointee of a raw or safe pointer type.
    pub fn pointee_of(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Ptr { pointee, .. }
            | TypeKind::SinglePtr { pointee }
            | TypeKind::ArrayPtr { pointee } => Some(*pointee),
            _ => None,
        }
    }

    /// Pointee of a plain pointer type only.
    pub fn element_type_of_pointer(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Ptr { pointee, .. } => Some(*pointee),
            _ => None,
        }
    }

    pub fn addr_space_of(&self, ty: TypeId) -> u32 {
        match self.kind(ty) {
            TypeKind::Ptr { addr_space, .. } => *addr_space,
            _ => 0,
        }
    }

    /// Field types of a safe pointer's in-memory representation:
    /// `{ raw, key }` for single-ptr, `{ raw, key, keylock }` for array-ptr.
    pub fn safe_ptr_repr_fields(&mut self, ty: TypeId) -> Option<Vec<TypeId>> {
        let kind = self.kind(ty).clone();
        match kind {
            TypeKind::SinglePtr { pointee } => {
                let raw = self.ptr_to(pointee);
                Some(vec![raw, fixed::I64])
            }
            TypeKind::ArrayPtr { pointee } => {
                let raw = self.ptr_to(pointee);
                let keylock = self.ptr_to(fixed::I64);
                Some(vec![raw, fixed::I64, keylock])
            }
            _ => None,
        }
    }

    /// Recognize a struct that is structurally a safe-pointer representation.
    /// Safe-pointer types themselves also match.
    pub fn matches_safe_ptr_repr(&self, ty: TypeId) -> Option<SafePtrKind> {
        if let Some(kind) = self.safe_ptr_kind(ty) {
            return Some(kind);
        }
        let TypeKind::Struct { fields } = self.kind(ty) else {
            return None;
        };
        let is_raw_ptr = |t: &TypeId| matches!(self.kind(*t), TypeKind::Ptr { .. });
        let is_key = |t: &TypeId| matches!(self.kind(*t), TypeKind::Int(64));
        let is_keylock = |t: &TypeId| match self.kind(*t) {
            TypeKind::Ptr { pointee, .. } => matches!(self.kind(*pointee), TypeKind::Int(64)),
            _ => false,
        };
        match fields.as_slice() {
            [raw, key] if is_raw_ptr(raw) && is_key(key) => Some(SafePtrKind::Single),
            [raw, key, kl] if is_raw_ptr(raw) && is_key(key) && is_keylock(kl) => {
                Some(SafePtrKind::Array)
            }
            _ => None,
        }
    }

    /// Type of field `index` within an aggregate, where safe pointers expose
    /// their representation fields.
    pub fn field_type(&mut self, agg: TypeId, index: u32) -> Option<TypeId> {
        match self.kind(agg).clone() {
            TypeKind::Struct { fields } => fields.get(index as usize).copied(),
            TypeKind::SinglePtr { .. } | TypeKind::ArrayPtr { .. } => self
                .safe_ptr_repr_fields(agg)
                .and_then(|fields| fields.get(index as usize).copied()),
            _ => None,
        }
    }

    /// C-style layout. Safe pointers get in-struct alignment 16: a single-ptr
    /// occupies 16 bytes; an array-ptr's 24-byte representation is padded to
    /// 32 while its placement alignment stays 16, so a `{ i64, i64, T }`
    /// wrapper puts the payload at offset 16. The 32-byte natural alignment
    /// of array-ptr values is carried by whole-object alignment.
    pub fn layout(&self, ty: TypeId) -> TypeLayout {
        match self.kind(ty) {
            TypeKind::Void | TypeKind::Fn { .. } => TypeLayout {
                size: 0,
                align: 1,
                field_offsets: Vec::new(),
            },
            TypeKind::Int(width) => {
                let size = u64::from((width + 7) / 8).max(1).next_power_of_two();
                TypeLayout {
                    size,
                    align: size,
                    field_offsets: Vec::new(),
                }
            }
            TypeKind::Ptr { .. } => TypeLayout {
                size: 8,
                align: 8,
                field_offsets: Vec::new(),
            },
            TypeKind::SinglePtr { .. } => TypeLayout {
                size: 16,
                align: 16,
                field_offsets: vec![0, 8],
            },
            TypeKind::ArrayPtr { .. } => TypeLayout {
                size: 32,
                align: 16,
                field_offsets: vec![0, 8, 16],
            },
            TypeKind::Struct { fields } => {
                let mut offset = 0u64;
                let mut align = 1u64;
                let mut field_offsets = Vec::with_capacity(fields.len());
                for &field in fields {
                    let fl = self.layout(field);
                    offset = round_up(offset, fl.align.max(1));
                    field_offsets.push(offset);
                    offset += fl.size;
                    align = align.max(fl.align);
                }
                TypeLayout {
                    size: round_up(offset, align),
                    align,
                    field_offsets,
                }
            }
        }
    }

    pub fn display(&self, ty: TypeId) -> String {
        match self.kind(ty) {
            TypeKind::Void => "void".to_string(),
            TypeKind::Int(w) => format!("i{w}"),
            TypeKind::Ptr { pointee, addr_space } => {
                if *addr_space == 0 {
                    format!("{}*", self.display(*pointee))
                } else {
                    format!("{}* as{}", self.display(*pointee), addr_space)
                }
            }
            TypeKind::Struct { fields } => {
                let inner = fields
                    .iter()
                    .map(|f| self.display(*f))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{ {inner} }}")
            }
            TypeKind::SinglePtr { pointee } => format!("mmptr<{}>", self.display(*pointee)),
            TypeKind::ArrayPtr { pointee } => format!("mmarrayptr<{}>", self.display(*pointee)),
            TypeKind::Fn { params, ret } => {
                let inner = params
                    .iter()
                    .map(|p| self.display(*p))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("fn({inner}) -> {}", self.display(*ret))
            }
        }
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}
