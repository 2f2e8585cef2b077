//! A single row of flight data with lazily decoded fields.
use byteorder::{BigEndian, ByteOrder};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A typed row of application data. Fields map a unique name to an opaque
/// byte-encoded value which is only decoded when an accessor asks for it.
///
/// Records are built by a parser or transform and then travel by value inside
/// the [Envelope](super::Envelope) carrying them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    fields: IndexMap<String, Vec<u8>>,
}

/// Error decoding a single field of a [Record].
/// These are always local to one record: the affected record gets dropped and
/// logged, they never abort a stage.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    /// The record has no field of the requested name
    #[error("record has no field '{0}'")]
    Missing(String),
    /// The field exists but its value has the wrong byte length for the
    /// requested type
    #[error("field '{name}' is {got} bytes, expected {expected}")]
    Length {
        /// Name of the malformed field
        name: String,
        /// Byte length the requested type requires
        expected: usize,
        /// Byte length actually present
        got: usize,
    },
    /// The field value is not valid UTF-8
    #[error("field '{0}' is not valid UTF-8")]
    Utf8(String),
}

impl Record {
    /// Create a record from already encoded fields
    pub fn new(fields: IndexMap<String, Vec<u8>>) -> Self {
        Self { fields }
    }

    /// Number of fields in this record
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if this record carries no fields at all
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Get the raw encoded bytes of a field
    pub fn raw(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Decode a field as a 4-byte big-endian two's complement integer
    pub fn get_int(&self, name: &str) -> Result<i32, FieldError> {
        let value = self.fixed_width(name, 4)?;
        Ok(BigEndian::read_i32(value))
    }

    /// Decode a field as a 4-byte big-endian IEEE-754 float
    pub fn get_float(&self, name: &str) -> Result<f32, FieldError> {
        let value = self.fixed_width(name, 4)?;
        Ok(BigEndian::read_f32(value))
    }

    /// Decode a field as a UTF-8 string
    pub fn get_str(&self, name: &str) -> Result<&str, FieldError> {
        let value = self
            .fields
            .get(name)
            .ok_or_else(|| FieldError::Missing(name.to_string()))?;
        std::str::from_utf8(value).map_err(|_| FieldError::Utf8(name.to_string()))
    }

    /// Set a field to an encoded integer, replacing any previous value
    pub fn set_int(&mut self, name: impl Into<String>, value: i32) {
        let mut buf = vec![0u8; 4];
        BigEndian::write_i32(&mut buf, value);
        self.fields.insert(name.into(), buf);
    }

    /// Set a field to an encoded float, replacing any previous value
    pub fn set_float(&mut self, name: impl Into<String>, value: f32) {
        let mut buf = vec![0u8; 4];
        BigEndian::write_f32(&mut buf, value);
        self.fields.insert(name.into(), buf);
    }

    /// Set a field to a string value, replacing any previous value
    pub fn set_str(&mut self, name: impl Into<String>, value: &str) {
        self.fields.insert(name.into(), value.as_bytes().to_vec());
    }

    /// Set a field to raw bytes, replacing any previous value
    pub fn set_raw(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.fields.insert(name.into(), value);
    }

    /// Iterate over field names and their encoded values in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    fn fixed_width(&self, name: &str, width: usize) -> Result<&[u8], FieldError> {
        let value = self
            .fields
            .get(name)
            .ok_or_else(|| FieldError::Missing(name.to_string()))?;
        if value.len() != width {
            return Err(FieldError::Length {
                name: name.to_string(),
                expected: width,
                got: value.len(),
            });
        }
        Ok(value)
    }
}
