//! Tagged header fields.
//!
//! Page headers are encoded through [`BufferField`] values: a closed set of
//! type tags plus an optional before/after-change hook pair, instead of a
//! subclass-per-field hierarchy. Fields encode little-endian through any
//! `io::Write` and decode from any `io::Read`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Width tag for a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTag {
    U8,
    U16,
    U32,
    U64,
}

impl FieldTag {
    /// Encoded width in bytes.
    pub fn width(self) -> usize {
        match self {
            FieldTag::U8 => 1,
            FieldTag::U16 => 2,
            FieldTag::U32 => 4,
            FieldTag::U64 => 8,
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

impl FieldValue {
    pub fn tag(self) -> FieldTag {
        match self {
            FieldValue::U8(_) => FieldTag::U8,
            FieldValue::U16(_) => FieldTag::U16,
            FieldValue::U32(_) => FieldTag::U32,
            FieldValue::U64(_) => FieldTag::U64,
        }
    }

    /// Widens to u64 for comparisons and display.
    pub fn as_u64(self) -> u64 {
        match self {
            FieldValue::U8(v) => v as u64,
            FieldValue::U16(v) => v as u64,
            FieldValue::U32(v) => v as u64,
            FieldValue::U64(v) => v,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}

/// Observer invoked around a field mutation with (old, new).
pub type ChangeHook = Arc<dyn Fn(FieldValue, FieldValue) + Send + Sync>;

/// One header field: a named, tagged value with optional change hooks.
pub struct BufferField {
    name: &'static str,
    value: FieldValue,
    before_change: Option<ChangeHook>,
    after_change: Option<ChangeHook>,
}

impl BufferField {
    pub fn new(name: &'static str, value: FieldValue) -> Self {
        Self {
            name,
            value,
            before_change: None,
            after_change: None,
        }
    }

    pub fn with_hooks(
        name: &'static str,
        value: FieldValue,
        before_change: Option<ChangeHook>,
        after_change: Option<ChangeHook>,
    ) -> Self {
        Self {
            name,
            value,
            before_change,
            after_change,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn value(&self) -> FieldValue {
        self.value
    }

    pub fn tag(&self) -> FieldTag {
        self.value.tag()
    }

    /// Assigns a new value, firing the change hooks when it differs.
    /// Returns whether the value changed. The tag of a field never
    /// changes; a mismatched assignment panics in debug builds and is
    /// coerced through the existing tag otherwise.
    pub fn set(&mut self, new_value: FieldValue) -> bool {
        debug_assert_eq!(new_value.tag(), self.value.tag(), "field {}", self.name);
        if new_value == self.value {
            return false;
        }
        if let Some(hook) = &self.before_change {
            hook(self.value, new_value);
        }
        let old = self.value;
        self.value = new_value;
        if let Some(hook) = &self.after_change {
            hook(old, new_value);
        }
        true
    }

    /// Writes the value little-endian at the field's width.
    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        match self.value {
            FieldValue::U8(v) => writer.write_u8(v),
            FieldValue::U16(v) => writer.write_u16::<LittleEndian>(v),
            FieldValue::U32(v) => writer.write_u32::<LittleEndian>(v),
            FieldValue::U64(v) => writer.write_u64::<LittleEndian>(v),
        }
    }

    /// Reads a value of the field's width, bypassing change hooks: a load
    /// is not a mutation.
    pub fn read_from(&mut self, reader: &mut impl Read) -> io::Result<()> {
        self.value = match self.value.tag() {
            FieldTag::U8 => FieldValue::U8(reader.read_u8()?),
            FieldTag::U16 => FieldValue::U16(reader.read_u16::<LittleEndian>()?),
            FieldTag::U32 => FieldValue::U32(reader.read_u32::<LittleEndian>()?),
            FieldTag::U64 => FieldValue::U64(reader.read_u64::<LittleEndian>()?),
        };
        Ok(())
    }
}

impl fmt::Debug for BufferField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferField")
            .field("name", &self.name)
            .field("value", &self.value)
            .finish()
    }
}
