//! Field identity and the registry that assigns dense wire indices to it.
//!
//! A field's wire identity is `id` (u32, 0 = unset), `sub_id` (u32, 0 =
//! unset), and `name` (optional), all three carried independently, exactly
//! as the header record lays out: `id` is always present on the wire;
//! `sub_id` and `name` are each present only when their header flag is
//! set. A field may carry an id *and* a name at once; the identity rule
//! picks which one is authoritative for matching. The registry is the only
//! place that knows the mapping from identity to the dense 0-based index
//! actually carried in row/index tags. The registry also tracks the
//! table's struct (fixed-width) layout: which fields are struct members,
//! in what order, and whether that layout has been frozen by the first row
//! carrying struct data.

use colwire_base::Bitmap256;

use crate::tag::MAX_FIELDS;
use crate::types::ValueType;

/// A field's wire identity: `id`/`sub_id` (0 = unset) plus an optional
/// `name`. At least one of `id > 0` or `name` non-empty must hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub id: u32,
    pub sub_id: u32,
    pub name: Option<String>,
}

impl FieldKey {
    pub fn by_id(id: u32, sub_id: u32) -> Self {
        FieldKey { id, sub_id, name: None }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        FieldKey { id: 0, sub_id: 0, name: Some(name.into()) }
    }

    /// A field identified by both an id and a name at once: the header
    /// carries `HAS_NAME` alongside a nonzero `id` (and, if `sub_id != 0`,
    /// `HAS_SUBID` too); the two flags are independent.
    pub fn by_id_and_name(id: u32, sub_id: u32, name: impl Into<String>) -> Self {
        FieldKey { id, sub_id, name: Some(name.into()) }
    }

    /// The column-identity rule: two keys name the same column iff
    /// `(id, sub_id)` match when `id > 0`, else iff `name` matches.
    /// Not a general equivalence relation over all `FieldKey`s, only a
    /// rule for resolving a *new* key against one already in a registry.
    pub fn identifies_same_column(&self, other: &FieldKey) -> bool {
        if self.id > 0 {
            self.id == other.id && self.sub_id == other.sub_id
        } else {
            self.name == other.name
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub key: FieldKey,
    pub value_type: ValueType,
    /// `true` iff this field lives in the struct (fixed-width) region of a
    /// row rather than the variable region; corresponds to the wire's
    /// header `RAW` flag.
    pub raw: bool,
    /// Explicit struct-member width for `String`/`Bytes` struct fields.
    /// `None` for variable fields, and for numeric struct fields whose
    /// width is implied by `value_type`.
    pub fixed_len: Option<usize>,
}

impl FieldDef {
    pub fn by_id(id: u32, sub_id: u32, value_type: ValueType) -> Self {
        FieldDef {
            key: FieldKey::by_id(id, sub_id),
            value_type,
            raw: false,
            fixed_len: None,
        }
    }

    pub fn by_name(name: impl Into<String>, value_type: ValueType) -> Self {
        FieldDef {
            key: FieldKey::by_name(name),
            value_type,
            raw: false,
            fixed_len: None,
        }
    }

    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn with_fixed_len(mut self, len: usize) -> Self {
        self.fixed_len = Some(len);
        self
    }

    /// Width of this field's slot in the struct region, or `None` if it's
    /// a variable field.
    pub fn struct_len(&self) -> Option<usize> {
        if !self.raw {
            return None;
        }
        Some(self.fixed_len.unwrap_or_else(|| self.value_type.byte_size()))
    }
}

/// Runtime bookkeeping the registry keeps per registered field: the dense
/// index it was assigned, and (derived at registration) its struct-region
/// width if it is a struct member.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub def: FieldDef,
    pub index: u8,
    pub struct_len: Option<usize>,
}

/// Assigns dense 0-based wire indices to fields as they're first seen, in
/// both encoder and decoder, and tracks which indices already have a
/// header record on the wire (so it's written at most once, deferred
/// until just before the first row that uses it), plus the table's struct
/// layout: struct fields must all precede variable fields, and the layout
/// freezes on the first row carrying struct data.
#[derive(Debug, Default)]
pub struct Registry {
    fields: Vec<FieldInfo>,
    header_written: Bitmap256,
    struct_frozen: bool,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            fields: Vec::new(),
            header_written: Bitmap256::new(),
            struct_frozen: false,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: u8) -> Option<&FieldInfo> {
        self.fields.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter()
    }

    /// Find an already-registered field naming the same column as `key`,
    /// per `FieldKey::identifies_same_column`, not plain structural
    /// equality: a lookup by name must still hit an existing id+name
    /// field, for instance.
    pub fn find(&self, key: &FieldKey) -> Option<u8> {
        self.fields
            .iter()
            .position(|f| f.def.key.identifies_same_column(key))
            .map(|i| i as u8)
    }

    /// Register a new field, returning its assigned index. Fails (returns
    /// `None`) once `MAX_FIELDS` dense indices are exhausted (0..=126, the
    /// 127th slot is reserved by the index-reference high bit).
    pub fn register(&mut self, def: FieldDef) -> Option<u8> {
        if self.fields.len() >= MAX_FIELDS {
            return None;
        }
        let index = self.fields.len() as u8;
        let struct_len = def.struct_len();
        self.fields.push(FieldInfo {
            def,
            index,
            struct_len,
        });
        Some(index)
    }

    pub fn header_written(&self, index: u8) -> bool {
        self.header_written.get(index)
    }

    pub fn mark_header_written(&mut self, index: u8) {
        self.header_written.set(index, true);
    }

    /// Count of fields whose header has already gone out at or before
    /// `index`, used to cross-check decoder-side index monotonicity.
    pub fn headers_written_through(&self, index: u8) -> usize {
        self.header_written.rank(index)
    }

    /// Sum of struct-region widths across all registered struct fields.
    pub fn struct_total_len(&self) -> usize {
        self.fields.iter().filter_map(|f| f.struct_len).sum()
    }

    pub fn has_struct_fields(&self) -> bool {
        self.fields.iter().any(|f| f.struct_len.is_some())
    }

    pub fn has_variable_fields(&self) -> bool {
        self.fields.iter().any(|f| f.struct_len.is_none())
    }

    /// Struct-member fields in registration order, the order their bytes
    /// appear in the struct region.
    pub fn struct_fields(&self) -> Vec<&FieldInfo> {
        self.fields.iter().filter(|f| f.struct_len.is_some()).collect()
    }

    pub fn struct_layout_frozen(&self) -> bool {
        self.struct_frozen
    }

    pub fn freeze_struct_layout(&mut self) {
        self.struct_frozen = true;
    }

    /// Bitmask of value-type ordinals seen among registered fields, one bit
    /// per `ValueType` (used by `Decoder::type_mask`).
    pub fn type_mask(&self) -> u64 {
        self.fields
            .iter()
            .fold(0u64, |acc, f| acc | f.def.value_type.mask_bit())
    }

    pub fn reset(&mut self) {
        self.fields.clear();
        self.header_written.clear_all();
        self.struct_frozen = false;
    }
}
