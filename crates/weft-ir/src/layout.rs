//! C-compatible data layout.
//!
//! Sizes, alignments and struct field offsets follow the platform C rules
//! (natural alignment, 8-byte pointers). The runtime's `#[repr(C)]`
//! argument structs and the offsets computed here therefore agree -- that
//! agreement is the ABI between lowered IR and the runtime.

use crate::module::{Module, TypeData, TypeId};

/// Size and alignment of a type, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: u64,
    pub align: u64,
}

fn align_up(offset: u64, align: u64) -> u64 {
    (offset + align - 1) & !(align - 1)
}

impl Module {
    /// Layout of a type. `Void` and function types are zero-sized; they
    /// cannot be stored.
    pub fn layout_of(&self, ty: TypeId) -> Layout {
        match self.type_data(ty) {
            TypeData::Void | TypeData::Fn { .. } => Layout { size: 0, align: 1 },
            TypeData::I1 | TypeData::I8 => Layout { size: 1, align: 1 },
            TypeData::I32 => Layout { size: 4, align: 4 },
            TypeData::I64 | TypeData::F64 => Layout { size: 8, align: 8 },
            TypeData::Ptr(_) => Layout { size: 8, align: 8 },
            TypeData::Struct(fields) => {
                let mut size = 0u64;
                let mut align = 1u64;
                for &f in fields {
                    let fl = self.layout_of(f);
                    size = align_up(size, fl.align) + fl.size;
                    align = align.max(fl.align);
                }
                Layout {
                    size: align_up(size, align),
                    align,
                }
            }
        }
    }

    /// Byte offset of field `field` within a struct type.
    pub fn field_offset(&self, strukt: TypeId, field: u32) -> u64 {
        let fields = self
            .struct_fields(strukt)
            .expect("field_offset requires a struct type");
        let mut offset = 0u64;
        for (i, &f) in fields.iter().enumerate() {
            let fl = self.layout_of(f);
            offset = align_up(offset, fl.align);
            if i as u32 == field {
                return offset;
            }
            offset += fl.size;
        }
        panic!("field index {field} out of bounds");
    }
}
