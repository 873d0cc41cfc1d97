//! Encoder state machine: stages header, struct, and variable writes into
//! separate per-row buffers and merges them at flush time so headers
//! always precede the data that depends on them, regardless of write
//! order (the deferred-header discipline).

use tracing::trace;

use colwire_base::{err, Result};

use crate::buffer::GrowBuf;
use crate::field::{FieldDef, FieldKey, Registry};
use crate::primitive::{
    write_fixed32, write_fixed64, write_varint, zigzag_encode_32, zigzag_encode_64,
};
use crate::tag::{self};
use crate::types::ValueType;
use crate::value::Value;

/// Builds a byte stream field-header-first, row-data-second. A single
/// `Encoder` accumulates into one persistent output buffer across calls to
/// `flush`/`start_row`/`start_table`; `data()` exposes everything written
/// so far, `clear()` resets the encoder to start a fresh stream.
#[derive(Debug)]
pub struct Encoder {
    registry: Registry,
    output: GrowBuf,
    /// Field-definition records staged since the last row boundary.
    header_buf: GrowBuf,
    /// This row's struct (fixed-width) payload, set by `put_struct`.
    struct_buf: GrowBuf,
    /// This row's variable-field entries (index-ref tag + value, repeated).
    variable_buf: GrowBuf,
    /// Whether `put_struct` has been called for the row in progress.
    struct_provided: bool,
    /// Whether anything at all has been staged for the row in progress
    /// (a `put`, a `put_struct`, or a pending header): an empty encoder
    /// that's never been touched emits no spurious empty row on flush.
    row_dirty: bool,
    row_flags: u8,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            registry: Registry::new(),
            output: GrowBuf::new(),
            header_buf: GrowBuf::new(),
            struct_buf: GrowBuf::new(),
            variable_buf: GrowBuf::new(),
            struct_provided: false,
            row_dirty: false,
            row_flags: 0,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        let mut e = Self::new();
        e.output = GrowBuf::with_capacity(cap);
        e
    }

    /// Register a field ahead of use, or return its existing index if an
    /// equivalent one is already registered. Does not itself write a
    /// header record: that's deferred to the first `put` that needs it.
    pub fn declare_field(&mut self, def: FieldDef) -> Option<u8> {
        if let Some(existing) = self.registry.find(&def.key) {
            return Some(existing);
        }
        self.registry.register(def)
    }

    /// Declare a struct (fixed-width) field: one occupying a slot in the
    /// row's struct prefix rather than the variable region. Must be
    /// declared before any variable-length field in this table, and before
    /// the struct layout is frozen by the first `put_struct` call; either
    /// violation is a fatal producer error.
    pub fn declare_struct_field(
        &mut self,
        mut def: FieldDef,
        fixed_len: Option<usize>,
    ) -> Result<u8> {
        if self.registry.struct_layout_frozen() {
            return Err(err("cannot declare a struct field after the struct layout is frozen"));
        }
        if self.registry.has_variable_fields() {
            return Err(err("struct fields must be declared before variable fields"));
        }
        def.raw = true;
        def.fixed_len = fixed_len;
        self.registry
            .register(def)
            .ok_or_else(|| err("field registry exhausted: MAX_FIELDS wire indices in use"))
    }

    /// Emit a table record. `decorate` marks this table's rows as
    /// annotations of the table that follows rather than data of their
    /// own. Flushes any row in progress first, then clears the field
    /// registry and struct layout: a new table starts a fresh column
    /// namespace.
    pub fn start_table(&mut self, decorate: bool) {
        self.flush_row();
        let flags = if decorate { tag::TABLE_FLAG_DECORATE } else { 0 };
        self.output.push_byte(tag::table_tag(flags));
        self.registry.reset();
    }

    /// Explicitly end the row in progress and begin a new one. Rows are
    /// otherwise delimited implicitly by the next `start_row`/`start_table`
    /// call or by `flush`/`data` draining the encoder at end of stream.
    pub fn start_row(&mut self) {
        self.flush_row();
    }

    /// Set the 3-bit flags nibble carried by the row tag of the row in
    /// progress (the producer-opaque channel echoed to listeners on every
    /// `on_field`).
    pub fn set_row_flags(&mut self, flags: u8) {
        self.row_flags = flags & tag::FLAGS_MASK;
    }

    /// Write one field's value as a row record, registering the field and
    /// staging its header record if this is the first time it's used. A
    /// field not yet registered must be a variable field: struct fields
    /// can only be introduced via `declare_struct_field`, and writes of
    /// individual struct-field values are not supported through `put` at
    /// all: only `put_struct`'s whole-blob write can supply them.
    pub fn put(&mut self, key: FieldKey, value_type: ValueType, value: &Value) {
        assert_eq!(
            value.value_type(),
            value_type,
            "value {:?} does not match declared field type {:?}",
            value,
            value_type
        );
        let index = match self.registry.find(&key) {
            Some(idx) => {
                let info = self.registry.get(idx).unwrap();
                assert!(
                    info.struct_len.is_none(),
                    "put called on {:?}, which is a struct field: struct members can only be \
                     written as a whole blob via put_struct",
                    info.def.key
                );
                let existing_type = info.def.value_type;
                assert_eq!(
                    existing_type, value_type,
                    "field was first declared as {:?}, now put as {:?}",
                    existing_type, value_type
                );
                idx
            }
            None => {
                let def = FieldDef {
                    key,
                    value_type,
                    raw: false,
                    fixed_len: None,
                };
                self.registry
                    .register(def)
                    .expect("field registry exhausted: MAX_FIELDS wire indices in use")
            }
        };
        self.ensure_header(index);
        self.write_row(index, value);
        self.row_dirty = true;
    }

    /// Declare a field and emit its header with no value for this row: a
    /// null. The header still appears, no value bytes are emitted, and no
    /// index reference is appended.
    pub fn put_null(&mut self, key: FieldKey, value_type: ValueType) {
        let index = self.declare_field(FieldDef {
            key,
            value_type,
            raw: false,
            fixed_len: None,
        });
        if let Some(index) = index {
            self.ensure_header(index);
            self.row_dirty = true;
        }
    }

    /// Provide this row's whole struct (fixed-width) payload. Freezes the
    /// struct layout on first call. `bytes.len()` must equal the sum of
    /// registered struct fields' widths; a mismatch is a fatal producer
    /// error, as is calling this with no struct fields declared.
    pub fn put_struct(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.registry.has_struct_fields() {
            return Err(err("put_struct called with no struct fields declared"));
        }
        let expected = self.registry.struct_total_len();
        if bytes.len() != expected {
            return Err(err(format!(
                "put_struct length mismatch: expected {expected} bytes, got {}",
                bytes.len()
            )));
        }
        if !self.registry.struct_layout_frozen() {
            self.registry.freeze_struct_layout();
        }
        let struct_indices: Vec<u8> = self.registry.struct_fields().iter().map(|f| f.index).collect();
        for index in struct_indices {
            self.ensure_header(index);
        }

        self.struct_buf.clear();
        self.struct_buf.extend_from_slice(bytes);
        self.struct_provided = true;
        self.row_dirty = true;
        Ok(())
    }

    fn ensure_header(&mut self, index: u8) {
        if self.registry.header_written(index) {
            return;
        }
        let def = self.registry.get(index).unwrap().def.clone();
        self.write_header(index, &def);
        self.registry.mark_header_written(index);
        self.row_dirty = true;
    }

    fn write_header(&mut self, index: u8, def: &FieldDef) {
        let mut flags = 0u8;
        if def.raw {
            flags |= tag::HEADER_FLAG_RAW;
        }
        let has_subid = def.key.sub_id != 0;
        let has_name = def.key.name.is_some();
        if has_subid {
            flags |= tag::HEADER_FLAG_HAS_SUBID;
        }
        if has_name {
            flags |= tag::HEADER_FLAG_HAS_NAME;
        }

        self.header_buf.push_byte(tag::HEADER | flags);
        // The index equals the registry length just before this
        // definition: redundant with the decoder's own bookkeeping, but
        // on-wire so an independent decoder can cross-check it.
        self.header_buf.push_byte(index);
        self.header_buf.push_byte(def.value_type.ordinal());

        // `id` is unconditional (0 for a name-only field), followed by
        // `sub_id` iff `has_subid` and `name` iff `has_name`: the two
        // flags are independent, not an either/or choice.
        write_varint(def.key.id as u64, &mut self.header_buf);
        if has_subid {
            write_varint(def.key.sub_id as u64, &mut self.header_buf);
        }
        if let Some(name) = &def.key.name {
            debug_assert!(name.len() <= tag::MAX_NAME_LEN);
            write_varint(name.len() as u64, &mut self.header_buf);
            self.header_buf.extend_from_slice(name.as_bytes());
        }
        // Struct-member width, only for String/Bytes where it isn't
        // implied by the type.
        if def.raw && matches!(def.value_type, ValueType::String | ValueType::Bytes) {
            let width = def.fixed_len.unwrap_or(0);
            write_varint(width as u64, &mut self.header_buf);
        }
        trace!(key = ?def.key, "staged field header");
    }

    fn write_row(&mut self, index: u8, value: &Value) {
        self.variable_buf.push_byte(tag::index_ref_tag(index));
        self.encode_value(value);
    }

    fn encode_value(&mut self, value: &Value) {
        match value {
            Value::Int8(v) => self.variable_buf.push_byte(*v as u8),
            Value::UInt8(v) => self.variable_buf.push_byte(*v),
            Value::Int16(v) => {
                write_varint(zigzag_encode_32(*v as i32) as u64, &mut self.variable_buf)
            }
            Value::UInt16(v) => write_varint(*v as u64, &mut self.variable_buf),
            Value::Int32(v) => {
                write_varint(zigzag_encode_32(*v) as u64, &mut self.variable_buf)
            }
            Value::UInt32(v) => write_varint(*v as u64, &mut self.variable_buf),
            Value::Int64(v) => write_varint(zigzag_encode_64(*v), &mut self.variable_buf),
            Value::UInt64(v) => write_varint(*v, &mut self.variable_buf),
            Value::Float32(v) => write_fixed32(v.to_bits(), &mut self.variable_buf),
            Value::Float64(v) => write_fixed64(v.to_bits(), &mut self.variable_buf),
            Value::String(s) => {
                write_varint(s.len() as u64, &mut self.variable_buf);
                self.variable_buf.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                write_varint(b.len() as u64, &mut self.variable_buf);
                self.variable_buf.extend_from_slice(b);
            }
        }
    }

    /// Merge this row's staged buffers into the output buffer: header
    /// records first, then the row tag, then struct payload, then (iff
    /// both struct and variable fields are present) a varint byte count,
    /// then the variable entries. No-op if nothing has been staged since
    /// the last flush.
    fn flush_row(&mut self) {
        if !self.row_dirty {
            return;
        }
        self.output.drain_from(&mut self.header_buf);
        self.output.push_byte(tag::row_tag(self.row_flags));
        if self.registry.has_struct_fields() {
            assert!(
                self.struct_provided,
                "row flushed with struct fields declared but put_struct was never called for it"
            );
            self.output.drain_from(&mut self.struct_buf);
            if self.registry.has_variable_fields() {
                write_varint(self.variable_buf.size() as u64, &mut self.output);
            }
        }
        self.output.drain_from(&mut self.variable_buf);

        self.struct_provided = false;
        self.row_dirty = false;
        self.row_flags = 0;
    }

    /// Drain all staged regions into the output buffer. Returns the full
    /// contents of the output buffer accumulated so far (not just what was
    /// added by this call) for convenience; use `data()` for a borrowed
    /// view that doesn't allocate.
    pub fn flush(&mut self) -> Vec<u8> {
        self.flush_row();
        self.output.bottom().to_vec()
    }

    /// Flush, then append everything written so far to `sink`.
    pub fn flush_to(&mut self, sink: &mut Vec<u8>) {
        self.flush_row();
        sink.extend_from_slice(self.output.bottom());
    }

    pub fn data(&self) -> &[u8] {
        self.output.bottom()
    }

    pub fn size(&self) -> usize {
        self.output.size()
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty() && !self.row_dirty
    }

    /// Reset the encoder to start a fresh stream: clears the output
    /// buffer, all staging, and the field registry.
    pub fn clear(&mut self) {
        self.output.clear();
        self.header_buf.clear();
        self.struct_buf.clear();
        self.variable_buf.clear();
        self.struct_provided = false;
        self.row_dirty = false;
        self.row_flags = 0;
        self.registry.reset();
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod inline_tests {
    use super::*;
    use crate::decoder::Decoder;
    use crate::listener::RowRecorder;

    #[cfg(test)]
    use test_log::test;

    #[test]
    fn put_emits_header_once() {
        let mut enc = Encoder::new();
        enc.put(FieldKey::by_name("a".into()), ValueType::Int32, &Value::Int32(1));
        enc.put(FieldKey::by_name("a".into()), ValueType::Int32, &Value::Int32(2));
        let bytes = enc.flush();

        let mut dec = Decoder::new(&bytes);
        let mut listener = RowRecorder::default();
        dec.decode(&mut listener).unwrap();
        assert_eq!(listener.rows.len(), 2);
        assert_eq!(listener.rows[0].1, Value::Int32(1));
        assert_eq!(listener.rows[1].1, Value::Int32(2));
    }

    #[test]
    fn struct_field_after_variable_field_is_rejected() {
        let mut enc = Encoder::new();
        enc.put(FieldKey::by_name("v".into()), ValueType::Int32, &Value::Int32(1));
        let result = enc.declare_struct_field(
            FieldDef::by_name("s", ValueType::UInt8),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn put_struct_size_mismatch_is_rejected() {
        let mut enc = Encoder::new();
        enc.declare_struct_field(FieldDef::by_name("age", ValueType::Int32), None)
            .unwrap();
        assert!(enc.put_struct(&[0u8; 3]).is_err());
        assert!(enc.put_struct(&[0u8; 4]).is_ok());
    }

    #[test]
    fn struct_layout_frozen_after_first_put_struct() {
        let mut enc = Encoder::new();
        enc.declare_struct_field(FieldDef::by_name("age", ValueType::Int32), None)
            .unwrap();
        enc.put_struct(&[0u8; 4]).unwrap();
        let result = enc.declare_struct_field(
            FieldDef::by_name("extra", ValueType::UInt8),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    #[should_panic(expected = "struct field")]
    fn put_on_a_struct_field_panics_instead_of_corrupting_the_frame() {
        let mut enc = Encoder::new();
        enc.declare_struct_field(FieldDef::by_name("age", ValueType::Int32), None)
            .unwrap();
        enc.put_struct(&[0u8; 4]).unwrap();
        enc.put(FieldKey::by_name("age".into()), ValueType::Int32, &Value::Int32(1));
    }
}
