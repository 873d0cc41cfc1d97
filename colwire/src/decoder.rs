//! Tag-dispatch decode loop with sticky first-error semantics.
//!
//! The reference decoder guards every step with `if (_err == 0) return;`,
//! stated intent is "stop advancing once an error has been recorded", but
//! the guard is inverted and actually short-circuits on the *first*
//! success. We implement the stated intent: once `error` is set it stays
//! set, and no further bytes are consumed.

use std::fmt;

use tracing::{trace, warn};

use crate::field::{FieldDef, FieldInfo, FieldKey, Registry};
use crate::listener::{FieldDecision, Listener, StructDecision};
use crate::primitive::{read_fixed32, read_fixed64, read_varint};
use crate::tag::{self};
use crate::types::ValueType;
use crate::value::Value;

/// Numeric codes mirror POSIX errno values, matching the reference
/// decoder's `_err` field (`ENOSPC`, `EINVAL`, `ESPIPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorCode {
    /// Input ended before a record could be fully read. errno ENOSPC.
    Truncated,
    /// A tag byte, flag combination, or field reference was invalid.
    /// errno EINVAL.
    Malformed,
    /// An index reference pointed past the fields seen so far, or a
    /// struct-region read ran past its declared width. errno ESPIPE.
    Dangling,
}

impl DecodeErrorCode {
    pub fn errno(self) -> i32 {
        match self {
            DecodeErrorCode::Truncated => 28, // ENOSPC
            DecodeErrorCode::Malformed => 22, // EINVAL
            DecodeErrorCode::Dangling => 29,  // ESPIPE
        }
    }
}

impl fmt::Display for DecodeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeErrorCode::Truncated => write!(f, "truncated input (errno {})", self.errno()),
            DecodeErrorCode::Malformed => write!(f, "malformed record (errno {})", self.errno()),
            DecodeErrorCode::Dangling => write!(f, "dangling reference (errno {})", self.errno()),
        }
    }
}

impl std::error::Error for DecodeErrorCode {}

pub type DecodeResult<T> = Result<T, DecodeErrorCode>;

/// Decodes a byte stream built by [`crate::encoder::Encoder`], dispatching
/// each decoded record to a [`Listener`]. Borrows its input for its entire
/// lifetime: zero-copy, so strings/bytes handed to the listener point
/// into this buffer for the duration of the callback.
pub struct Decoder<'d> {
    data: &'d [u8],
    pos: usize,
    registry: Registry,
    error: Option<DecodeErrorCode>,
    skip_values: bool,

    decorate_current: bool,
    decorator_capture: Vec<(FieldDef, Value)>,
    last_decorators: Vec<(FieldDef, Value)>,

    row_open: bool,
    row_start_pos: usize,
    header_since_row_boundary: bool,
    current_row_flags: u8,
    total_rows: u64,
}

impl<'d> Decoder<'d> {
    pub fn new(data: &'d [u8]) -> Self {
        Decoder {
            data,
            pos: 0,
            registry: Registry::new(),
            error: None,
            skip_values: false,
            decorate_current: false,
            decorator_capture: Vec::new(),
            last_decorators: Vec::new(),
            row_open: false,
            row_start_pos: 0,
            header_since_row_boundary: false,
            current_row_flags: 0,
            total_rows: 0,
        }
    }

    pub fn error(&self) -> Option<DecodeErrorCode> {
        self.error
    }

    /// POSIX-style errno for the sticky decode error, or 0 if none.
    pub fn err_code(&self) -> i32 {
        self.error.map(|e| e.errno()).unwrap_or(0)
    }

    /// Bitmask of `ValueType` ordinals seen among fields registered in the
    /// current table.
    pub fn type_mask(&self) -> u64 {
        self.registry.type_mask()
    }

    /// The current table's field registry, in wire-index order.
    pub fn fields(&self) -> Vec<&FieldInfo> {
        self.registry.iter().collect()
    }

    /// Decode headers and framing only, skipping value materialization:
    /// bytes are still consumed correctly (so later rows decode right),
    /// but `on_field` is never called with a decoded `Value`.
    pub fn set_mode(&mut self, skip_values: bool) {
        self.skip_values = skip_values;
    }

    /// Whether the table currently open was declared a decorator table.
    pub fn in_decorator_table(&self) -> bool {
        self.decorate_current
    }

    fn mark_error(&mut self, code: DecodeErrorCode) -> DecodeErrorCode {
        if self.error.is_none() {
            warn!(?code, "decode error");
            self.error = Some(code);
            self.pos = self.data.len();
        }
        self.error.unwrap()
    }

    /// Decode every record in the input, feeding each to `listener`.
    /// Returns the total number of rows decoded, or the sticky error if
    /// one was ever recorded.
    pub fn decode(&mut self, listener: &mut dyn Listener) -> DecodeResult<u64> {
        loop {
            if self.decode_row(listener) {
                break;
            }
        }
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.total_rows),
        }
    }

    /// Decode one logical row: every tag up to (but not including) the
    /// next row-start/table-start tag, or end of input. Returns `true` once
    /// decoding is finished (end of input reached, or a sticky error was
    /// recorded), and `false` if a row was decoded and more may follow.
    pub fn decode_row(&mut self, listener: &mut dyn Listener) -> bool {
        if self.error.is_some() {
            return true;
        }
        if self.pos >= self.data.len() {
            if self.row_open {
                self.close_row(listener);
            }
            return true;
        }
        loop {
            if self.pos >= self.data.len() {
                if self.row_open {
                    self.close_row(listener);
                }
                return true;
            }
            let tagbyte = self.data[self.pos];
            if self.row_open && !tag::is_index_ref(tagbyte) {
                let id = tag::tag_id(tagbyte);
                if id == tag::ROW || id == tag::TABLE {
                    self.close_row(listener);
                    return false;
                }
            }
            if self.decode_one(listener).is_err() {
                return true;
            }
            if self.error.is_some() {
                return true;
            }
        }
    }

    fn close_row(&mut self, listener: &mut dyn Listener) {
        let row_len = self.pos.saturating_sub(self.row_start_pos);
        listener.on_row_end(self.header_since_row_boundary, row_len);
        self.row_open = false;
        self.header_since_row_boundary = false;
        // Decorator tables annotate the next data table; their rows don't
        // count toward `decode()`'s row total.
        if !self.decorate_current {
            self.total_rows += 1;
        }
    }

    fn decode_one(&mut self, listener: &mut dyn Listener) -> DecodeResult<()> {
        let tagbyte = self.data[self.pos];
        self.pos += 1;

        if tag::is_index_ref(tagbyte) {
            return self.decode_field(tag::index_of(tagbyte), listener);
        }

        match tag::tag_id(tagbyte) {
            tag::HEADER => self.decode_header(tagbyte, listener),
            tag::TABLE => self.decode_table(tagbyte, listener),
            tag::ROW => {
                let flags = tag::flags_of(tagbyte);
                self.decode_row_start(flags, listener)
            }
            tag::FLAGS => {
                self.current_row_flags = tag::flags_of(tagbyte);
                trace!(tagbyte, "flags-only tag");
                Ok(())
            }
            other => {
                let code = self.mark_error(DecodeErrorCode::Malformed);
                warn!(tag = other, "unrecognized or reserved tag id");
                Err(code)
            }
        }
    }

    fn decode_header(&mut self, tagbyte: u8, listener: &mut dyn Listener) -> DecodeResult<()> {
        let has_subid = tagbyte & tag::HEADER_FLAG_HAS_SUBID != 0;
        let has_name = tagbyte & tag::HEADER_FLAG_HAS_NAME != 0;
        let raw = tagbyte & tag::HEADER_FLAG_RAW != 0;

        let index_byte = self.read_byte()?;
        if index_byte as usize != self.registry.len() {
            // Invariant 1: the wire index must equal the registry length
            // just before this definition.
            return Err(self.mark_error(DecodeErrorCode::Malformed));
        }

        let type_ordinal = self.read_byte()?;
        let value_type = ValueType::from_ordinal(type_ordinal)
            .ok_or_else(|| self.mark_error(DecodeErrorCode::Malformed))?;

        // `id` is unconditional (0 for a name-only field), followed by
        // `sub_id` iff `has_subid` and `name` iff `has_name`: the two
        // flags are independent, a field may carry both.
        let id = self.read_varint()? as u32;
        let sub_id = if has_subid { self.read_varint()? as u32 } else { 0 };
        let name = if has_name {
            let len = self.read_varint()? as usize;
            if len > tag::MAX_NAME_LEN {
                return Err(self.mark_error(DecodeErrorCode::Malformed));
            }
            Some(self.read_str(len)?)
        } else {
            None
        };
        let key = FieldKey { id, sub_id, name };

        let fixed_len = if raw && matches!(value_type, ValueType::String | ValueType::Bytes) {
            Some(self.read_varint()? as usize)
        } else {
            None
        };

        let def = FieldDef {
            key: key.clone(),
            value_type,
            raw,
            fixed_len,
        };

        if raw && self.registry.has_variable_fields() {
            // Invariant 3: struct headers must all precede variable headers.
            return Err(self.mark_error(DecodeErrorCode::Malformed));
        }
        if raw && self.registry.struct_layout_frozen() {
            return Err(self.mark_error(DecodeErrorCode::Malformed));
        }

        let index = match self.registry.find(&key) {
            Some(existing) => existing,
            None => self
                .registry
                .register(def.clone())
                .ok_or_else(|| self.mark_error(DecodeErrorCode::Malformed))?,
        };
        self.registry.mark_header_written(index);
        self.header_since_row_boundary = true;

        listener.on_field_header(index, &def);
        Ok(())
    }

    fn decode_table(&mut self, tagbyte: u8, listener: &mut dyn Listener) -> DecodeResult<()> {
        if self.row_open {
            self.close_row(listener);
        }
        let flags = tagbyte & 0x70;
        let decorate = tag::table_is_decorator(flags);

        // A decorator table's captured row(s) are folded into
        // `last_decorators` when *that* table ends (i.e. here, as the
        // next table starts); a non-decorator table leaves
        // `last_decorators` untouched so it keeps applying forward.
        if self.decorate_current {
            self.last_decorators = std::mem::take(&mut self.decorator_capture);
        } else {
            self.decorator_capture.clear();
        }

        self.decorate_current = decorate;
        self.registry.reset();
        self.header_since_row_boundary = false;

        listener.on_table_start(flags, &self.last_decorators);
        Ok(())
    }

    fn decode_row_start(&mut self, flags: u8, listener: &mut dyn Listener) -> DecodeResult<()> {
        if self.row_open {
            self.close_row(listener);
        }
        self.row_open = true;
        self.row_start_pos = self.pos - 1; // include the row tag byte itself
        self.current_row_flags = flags;
        listener.on_row_start(flags);

        if !self.registry.has_struct_fields() {
            return Ok(());
        }
        self.registry.freeze_struct_layout();

        let struct_len = self.registry.struct_total_len();
        if self.data.len() - self.pos < struct_len {
            return Err(self.mark_error(DecodeErrorCode::Truncated));
        }
        let struct_bytes = &self.data[self.pos..self.pos + struct_len];
        self.pos += struct_len;

        let struct_fields = self.registry.struct_fields();
        let decision = listener.on_struct(struct_bytes, &struct_fields);

        if self.registry.has_variable_fields() {
            let vbytes = self.read_varint()? as usize;
            if self.data.len() - self.pos < vbytes {
                return Err(self.mark_error(DecodeErrorCode::Truncated));
            }
            if decision == StructDecision::SkipVariable {
                self.pos += vbytes;
            }
        }
        Ok(())
    }

    fn decode_field(&mut self, index: u8, listener: &mut dyn Listener) -> DecodeResult<()> {
        if self.registry.get(index).is_none() {
            return Err(self.mark_error(DecodeErrorCode::Dangling));
        }
        let def = self.registry.get(index).unwrap().def.clone();

        let decision = listener.on_field_start(index, &def);
        if self.skip_values || decision == FieldDecision::Skip {
            self.skip_value(&def)?;
            return Ok(());
        }

        let value = self.decode_value(&def)?;
        if self.decorate_current {
            self.decorator_capture.push((def, value));
        } else {
            listener.on_field(index, &value, self.current_row_flags);
        }
        Ok(())
    }

    fn decode_value(&mut self, def: &FieldDef) -> DecodeResult<Value> {
        use crate::primitive::{zigzag_decode_32, zigzag_decode_64};

        Ok(match def.value_type {
            ValueType::Int8 => Value::Int8(self.read_byte()? as i8),
            ValueType::UInt8 => Value::UInt8(self.read_byte()?),
            ValueType::Int16 => {
                let v = self.read_varint()?;
                Value::Int16(zigzag_decode_32(v as u32) as i16)
            }
            ValueType::UInt16 => Value::UInt16(self.read_varint()? as u16),
            ValueType::Int32 => {
                let v = self.read_varint()?;
                Value::Int32(zigzag_decode_32(v as u32))
            }
            ValueType::UInt32 => Value::UInt32(self.read_varint()? as u32),
            ValueType::Int64 => {
                let v = self.read_varint()?;
                Value::Int64(zigzag_decode_64(v))
            }
            ValueType::UInt64 => Value::UInt64(self.read_varint()?),
            ValueType::Float32 => {
                let bits = read_fixed32(self.data, &mut self.pos).map_err(|e| self.mark_error(e))?;
                Value::Float32(crate::primitive::decode_f32(bits))
            }
            ValueType::Float64 => {
                let bits = read_fixed64(self.data, &mut self.pos).map_err(|e| self.mark_error(e))?;
                Value::Float64(crate::primitive::decode_f64(bits))
            }
            ValueType::String => {
                let len = self.read_varint()? as usize;
                Value::String(self.read_str(len)?)
            }
            ValueType::Bytes => {
                let len = self.read_varint()? as usize;
                Value::Bytes(self.read_bytes(len)?.to_vec())
            }
        })
    }

    fn skip_value(&mut self, def: &FieldDef) -> DecodeResult<()> {
        match def.value_type {
            ValueType::Int8 | ValueType::UInt8 => {
                self.read_byte()?;
            }
            ValueType::Int16
            | ValueType::UInt16
            | ValueType::Int32
            | ValueType::UInt32
            | ValueType::Int64
            | ValueType::UInt64 => {
                self.read_varint()?;
            }
            ValueType::Float32 => {
                read_fixed32(self.data, &mut self.pos).map_err(|e| self.mark_error(e))?;
            }
            ValueType::Float64 => {
                read_fixed64(self.data, &mut self.pos).map_err(|e| self.mark_error(e))?;
            }
            ValueType::String | ValueType::Bytes => {
                let len = self.read_varint()? as usize;
                self.read_bytes(len)?;
            }
        }
        Ok(())
    }

    fn read_varint(&mut self) -> DecodeResult<u64> {
        read_varint(self.data, &mut self.pos).map_err(|e| self.mark_error(e))
    }

    fn read_byte(&mut self) -> DecodeResult<u8> {
        if self.pos >= self.data.len() {
            return Err(self.mark_error(DecodeErrorCode::Truncated));
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, len: usize) -> DecodeResult<&'d [u8]> {
        if self.data.len() - self.pos < len {
            return Err(self.mark_error(DecodeErrorCode::Truncated));
        }
        let s = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }

    fn read_str(&mut self, len: usize) -> DecodeResult<String> {
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.mark_error(DecodeErrorCode::Malformed))
    }
}
