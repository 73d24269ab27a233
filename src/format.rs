//! Defines the physical binary layout of nbin files.
//!
//! # Layout
//! Everything is little-endian. The file is a header, two tables and the
//! raw instance region:
//!
//! ```text
//! [Magic "NBIN"]
//! [i32 T] [TypeRecord x T]
//! [i32 L] [LayoutRecord x L]
//! [i64 region size] [region bytes]
//! ```
//!
//! ## Type Record
//! `[i32 byte length of the rest] [i32 id] [str name] [u8 kind] [i32 M] [member x M]`
//!
//! A member is `[str name] [i32 array dims] [i32 type id]` for objects and
//! structs, `[str name] [i32 native value]` for enums. Strings are
//! `[i32 len] [UTF-8 bytes]`. Negative type ids are primitive codes.
//!
//! ## Layout Record
//! `[i32 type id] [i64 offset] [i32 size] [i32 length]`. Arrays carry their
//! element type id and a negated byte size. An object record always has a
//! size of at least 8 (its type tag), so a size of 0 is an empty array.

use std::io::Read;

use crate::error::{NbinError, Result};
use crate::io::{ByteReader, PutLe};
use crate::types::{PrimitiveKind, TypeKind};

/// Magic bytes identifying the file format: "NBIN".
pub const MAGIC_BYTES: [u8; 4] = *b"NBIN";

/// Reads and checks the magic bytes.
pub fn read_magic<R: Read>(reader: &mut ByteReader<R>) -> Result<()> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC_BYTES {
        return Err(NbinError::Format(format!(
            "Invalid Magic Bytes: {magic:02x?}"
        )));
    }
    Ok(())
}

/// Caps a preallocation driven by an untrusted count.
fn capacity(count: usize) -> usize {
    count.min(1024)
}

/// A field as described in the type table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRecord {
    /// Field name.
    pub name: String,
    /// Number of array dimensions, 0 for a plain field.
    pub dims: i32,
    /// Innermost type id; negative for a primitive code.
    pub type_id: i32,
}

impl FieldRecord {
    /// The primitive kind, if the member type id is a primitive code.
    pub fn primitive(&self) -> Option<PrimitiveKind> {
        PrimitiveKind::from_code(self.type_id)
    }
}

/// An enum constant as described in the type table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantRecord {
    /// Constant name.
    pub name: String,
    /// Native value, or ordinal.
    pub value: i32,
}

/// Members of a type record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Members {
    /// Object or struct fields.
    Fields(Vec<FieldRecord>),
    /// Enum constants.
    Constants(Vec<ConstantRecord>),
}

impl Members {
    /// Number of members.
    pub fn len(&self) -> usize {
        match self {
            Self::Fields(fields) => fields.len(),
            Self::Constants(constants) => constants.len(),
        }
    }

    /// True if the type has no member.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One entry of the type table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRecord {
    /// Type id, as used by tags and layout records.
    pub type_id: i32,
    /// Type name.
    pub name: String,
    /// Declared kind.
    pub kind: TypeKind,
    /// Fields or constants.
    pub members: Members,
}

impl TypeRecord {
    /// Serializes the record, length prefix included.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.put_i32(self.type_id);
        body.put_str(&self.name)?;
        body.put_u8(self.kind.code());
        body.put_i32(count(self.members.len())?);
        match &self.members {
            Members::Fields(fields) => {
                for field in fields {
                    body.put_str(&field.name)?;
                    body.put_i32(field.dims);
                    body.put_i32(field.type_id);
                }
            }
            Members::Constants(constants) => {
                for constant in constants {
                    body.put_str(&constant.name)?;
                    body.put_i32(constant.value);
                }
            }
        }
        let mut record = Vec::with_capacity(body.len() + 4);
        record.put_i32(count(body.len())?);
        record.extend_from_slice(&body);
        Ok(record)
    }

    /// Decodes one record. The declared length must match the decoded body exactly.
    pub fn read_from<R: Read>(reader: &mut ByteReader<R>) -> Result<Self> {
        let len = reader.read_len("type record length")?;
        let body = reader.read_bytes(len)?;
        let mut body_reader = ByteReader::new(&body[..]);
        let record = Self::decode_body(&mut body_reader)?;
        if body_reader.position() != len as u64 {
            return Err(NbinError::Format(format!(
                "type record {} declares {len} bytes, decoded {}",
                record.name,
                body_reader.position()
            )));
        }
        Ok(record)
    }

    fn decode_body(reader: &mut ByteReader<&[u8]>) -> Result<Self> {
        let type_id = reader.read_i32()?;
        let name = reader.read_str()?;
        let kind_code = reader.read_u8()?;
        let kind = TypeKind::from_code(kind_code)
            .ok_or_else(|| NbinError::Format(format!("unknown type kind {kind_code} for {name}")))?;
        let member_count = reader.read_len("member count")?;
        let members = if kind == TypeKind::Enum {
            let mut constants = Vec::with_capacity(capacity(member_count));
            for _ in 0..member_count {
                constants.push(ConstantRecord {
                    name: reader.read_str()?,
                    value: reader.read_i32()?,
                });
            }
            Members::Constants(constants)
        } else {
            let mut fields = Vec::with_capacity(capacity(member_count));
            for _ in 0..member_count {
                fields.push(FieldRecord {
                    name: reader.read_str()?,
                    dims: reader.read_i32()?,
                    type_id: reader.read_i32()?,
                });
            }
            Members::Fields(fields)
        };
        Ok(Self {
            type_id,
            name,
            kind,
            members,
        })
    }
}

/// One entry of the layout table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRecord {
    /// Object type id, or element type id for arrays (negative for primitives).
    pub type_id: i32,
    /// Offset in the instance region.
    pub offset: i64,
    /// Byte size, negated for arrays.
    pub size: i32,
    /// Array length, 1 for objects.
    pub length: i32,
}

impl LayoutRecord {
    /// The size in bytes of a serialized LayoutRecord.
    pub const SIZE: usize = 20; // 4 type id + 8 offset + 4 size + 4 length

    /// True for array entries.
    pub fn is_array(&self) -> bool {
        self.size <= 0
    }

    /// Absolute byte size.
    pub fn byte_size(&self) -> u32 {
        self.size.unsigned_abs()
    }

    /// Serializes to a fixed-size byte array (Little Endian).
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.type_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Decodes one record.
    pub fn read_from<R: Read>(reader: &mut ByteReader<R>) -> Result<Self> {
        Ok(Self {
            type_id: reader.read_i32()?,
            offset: reader.read_i64()?,
            size: reader.read_i32()?,
            length: reader.read_i32()?,
        })
    }
}

/// Converts a count to its `i32` wire form.
pub(crate) fn count(value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| NbinError::Format(format!("count {value} exceeds i32")))
}

/// The decoded header and tables of a file, without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTables {
    /// The type table.
    pub types: Vec<TypeRecord>,
    /// The layout table.
    pub entries: Vec<LayoutRecord>,
    /// Declared instance region size.
    pub region_size: u64,
    /// Offset of the region from the start of the file.
    pub region_offset: u64,
}

impl FileTables {
    /// Decodes magic, type table, layout table and region size.
    pub fn read_from<R: Read>(reader: &mut ByteReader<R>) -> Result<Self> {
        read_magic(reader)?;

        let type_count = reader.read_len("type count")?;
        let mut types = Vec::with_capacity(capacity(type_count));
        for _ in 0..type_count {
            types.push(TypeRecord::read_from(reader)?);
        }

        let entry_count = reader.read_len("layout entry count")?;
        let mut entries = Vec::with_capacity(capacity(entry_count));
        for _ in 0..entry_count {
            entries.push(LayoutRecord::read_from(reader)?);
        }

        let region_size = reader.read_i64()?;
        let region_size = u64::try_from(region_size)
            .map_err(|_| NbinError::Format(format!("negative region size {region_size}")))?;

        log::debug!(
            "read tables: {type_count} types, {entry_count} entries, region of {region_size} bytes at {}",
            reader.position()
        );
        Ok(Self {
            types,
            entries,
            region_size,
            region_offset: reader.position(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_record_is_self_describing() -> Result<()> {
        let record = TypeRecord {
            type_id: 3,
            name: "demo::Node".into(),
            kind: TypeKind::Object,
            members: Members::Fields(vec![FieldRecord {
                name: "values".into(),
                dims: 1,
                type_id: PrimitiveKind::Int.code(),
            }]),
        };
        let bytes = record.to_bytes()?;
        let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(declared as usize, bytes.len() - 4);

        let decoded = TypeRecord::read_from(&mut ByteReader::new(&bytes[..]))?;
        assert_eq!(decoded, record);
        let Members::Fields(fields) = &decoded.members else {
            panic!("expected fields");
        };
        assert_eq!(fields[0].primitive(), Some(PrimitiveKind::Int));
        Ok(())
    }

    #[test]
    fn inconsistent_length_is_rejected() -> Result<()> {
        let record = TypeRecord {
            type_id: 0,
            name: "demo::Mode".into(),
            kind: TypeKind::Enum,
            members: Members::Constants(vec![ConstantRecord {
                name: "On".into(),
                value: 42,
            }]),
        };
        let mut bytes = record.to_bytes()?;
        // Claim one more byte than the body holds.
        let len = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) + 1;
        bytes[0..4].copy_from_slice(&len.to_le_bytes());
        bytes.push(0);
        assert!(matches!(
            TypeRecord::read_from(&mut ByteReader::new(&bytes[..])),
            Err(NbinError::Format(_))
        ));
        Ok(())
    }

    #[test]
    fn layout_record_array_flag() {
        let object = LayoutRecord { type_id: 1, offset: 0, size: 24, length: 1 };
        let array = LayoutRecord { type_id: -3, offset: 24, size: -12, length: 3 };
        let empty = LayoutRecord { type_id: -3, offset: 40, size: 0, length: 0 };
        assert!(!object.is_array());
        assert!(array.is_array());
        assert_eq!(array.byte_size(), 12);
        assert!(empty.is_array());
        assert_eq!(object.to_bytes().len(), LayoutRecord::SIZE);
    }

    #[test]
    fn bad_magic_fails_first() {
        let bytes = b"NBIX\x00\x00\x00\x00";
        assert!(matches!(
            FileTables::read_from(&mut ByteReader::new(&bytes[..])),
            Err(NbinError::Format(_))
        ));
    }
}
