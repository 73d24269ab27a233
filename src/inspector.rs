//! Tools for inspecting the physical structure of nbin files.
//! Useful for checking what a writer produced without the types at hand.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::format::{FileTables, LayoutRecord, Members, TypeRecord};
use crate::io::ByteReader;
use crate::types::{PrimitiveKind, TypeKind};

/// A structural report of an nbin file.
#[derive(Debug, Clone, Serialize)]
pub struct DebugReport {
    /// Total size of the input.
    pub file_size: u64,
    /// Where the instance region starts.
    pub region_offset: u64,
    /// Declared size of the instance region.
    pub region_size: u64,
    /// The type table.
    pub types: Vec<TypeInfo>,
    /// The layout table, in file order.
    pub entries: Vec<EntryInfo>,
}

/// One type of the type table.
#[derive(Debug, Clone, Serialize)]
pub struct TypeInfo {
    /// Type id.
    pub type_id: i32,
    /// Type name.
    pub name: String,
    /// "object", "struct" or "enum".
    pub kind: String,
    /// Fields, for objects and structs.
    pub members: Vec<MemberInfo>,
    /// Constants, for enums.
    pub constants: Vec<ConstantInfo>,
}

/// One field of a type.
#[derive(Debug, Clone, Serialize)]
pub struct MemberInfo {
    /// Field name.
    pub name: String,
    /// Innermost type name.
    pub type_name: String,
    /// Array dimensions.
    pub dims: i32,
}

/// One enum constant.
#[derive(Debug, Clone, Serialize)]
pub struct ConstantInfo {
    /// Constant name.
    pub name: String,
    /// Stored integer.
    pub value: i32,
}

/// One layout entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    /// Object type name, or element type name for arrays.
    pub type_name: String,
    /// Offset in the instance region.
    pub offset: i64,
    /// Byte size.
    pub size: u32,
    /// Element count, for arrays.
    pub array_length: Option<i32>,
}

/// The nbin inspector tool.
#[derive(Debug)]
pub struct NbinInspector;

impl NbinInspector {
    /// Analyzes a file and returns a structural report.
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<DebugReport> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let tables = FileTables::read_from(&mut ByteReader::new(BufReader::new(file)))?;
        Ok(Self::report(&tables, file_size))
    }

    /// Analyzes a file image held in memory.
    pub fn inspect_bytes(bytes: &[u8]) -> Result<DebugReport> {
        let tables = FileTables::read_from(&mut ByteReader::new(bytes))?;
        Ok(Self::report(&tables, bytes.len() as u64))
    }

    fn report(tables: &FileTables, file_size: u64) -> DebugReport {
        let names: HashMap<i32, &str> = tables
            .types
            .iter()
            .map(|t| (t.type_id, t.name.as_str()))
            .collect();
        let name_of = |type_id: i32| match PrimitiveKind::from_code(type_id) {
            Some(kind) => kind.name().to_string(),
            None => names
                .get(&type_id)
                .map_or_else(|| format!("?{type_id}"), |name| (*name).to_string()),
        };

        DebugReport {
            file_size,
            region_offset: tables.region_offset,
            region_size: tables.region_size,
            types: tables.types.iter().map(|t| type_info(t, &name_of)).collect(),
            entries: tables
                .entries
                .iter()
                .map(|e| entry_info(e, &name_of))
                .collect(),
        }
    }
}

fn type_info(record: &TypeRecord, name_of: &dyn Fn(i32) -> String) -> TypeInfo {
    let kind = match record.kind {
        TypeKind::Object => "object",
        TypeKind::Struct => "struct",
        TypeKind::Enum => "enum",
    };
    let (members, constants) = match &record.members {
        Members::Fields(fields) => (
            fields
                .iter()
                .map(|f| MemberInfo {
                    name: f.name.clone(),
                    type_name: name_of(f.type_id),
                    dims: f.dims,
                })
                .collect(),
            Vec::new(),
        ),
        Members::Constants(constants) => (
            Vec::new(),
            constants
                .iter()
                .map(|c| ConstantInfo {
                    name: c.name.clone(),
                    value: c.value,
                })
                .collect(),
        ),
    };
    TypeInfo {
        type_id: record.type_id,
        name: record.name.clone(),
        kind: kind.to_string(),
        members,
        constants,
    }
}

fn entry_info(record: &LayoutRecord, name_of: &dyn Fn(i32) -> String) -> EntryInfo {
    EntryInfo {
        type_name: name_of(record.type_id),
        offset: record.offset,
        size: record.byte_size(),
        array_length: record.is_array().then_some(record.length),
    }
}

fn branch(is_last: bool) -> (&'static str, &'static str) {
    if is_last {
        ("└── ", "    ")
    } else {
        ("├── ", "│   ")
    }
}

impl fmt::Display for DebugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== NBIN INSPECTOR REPORT ===")?;
        writeln!(f, "File Size:      {}", self.file_size)?;
        writeln!(
            f,
            "Region:         {} bytes at offset {}",
            self.region_size, self.region_offset
        )?;

        writeln!(f, "\n[TYPES]")?;
        for (i, ty) in self.types.iter().enumerate() {
            let (connector, prefix) = branch(i + 1 == self.types.len());
            writeln!(f, "{connector}#{} {} ({})", ty.type_id, ty.name, ty.kind)?;
            for (j, member) in ty.members.iter().enumerate() {
                let (leaf, _) = branch(j + 1 == ty.members.len());
                let brackets = "[]".repeat(usize::try_from(member.dims).unwrap_or(0));
                writeln!(f, "{prefix}{leaf}{}: {}{brackets}", member.name, member.type_name)?;
            }
            for (j, constant) in ty.constants.iter().enumerate() {
                let (leaf, _) = branch(j + 1 == ty.constants.len());
                writeln!(f, "{prefix}{leaf}{} = {}", constant.name, constant.value)?;
            }
        }

        writeln!(f, "\n[LAYOUT]")?;
        for (i, entry) in self.entries.iter().enumerate() {
            let (connector, _) = branch(i + 1 == self.entries.len());
            match entry.array_length {
                Some(length) => writeln!(
                    f,
                    "{connector}@{} {}[{length}] ({}b)",
                    entry.offset, entry.type_name, entry.size
                )?,
                None => writeln!(
                    f,
                    "{connector}@{} {} ({}b)",
                    entry.offset, entry.type_name, entry.size
                )?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Nbin;
    use crate::graph::{ArrayInstance, Heap, Value};
    use crate::types::{FieldDef, TypeDef, ValueType};

    #[test]
    fn reports_tables_without_a_catalog() -> Result<()> {
        let node = TypeDef::object("demo::Node")
            .field(FieldDef::new("value", ValueType::Primitive(PrimitiveKind::Int)))
            .field(FieldDef::new(
                "data",
                ValueType::array_of(ValueType::Primitive(PrimitiveKind::Short)),
            ))
            .build();
        let mut heap = Heap::new();
        let root = heap.alloc_object(&node)?;
        let data = heap.insert_array(ArrayInstance::Short(vec![1, 2, 3]));
        heap.set_field(root, "data", Value::Ref(Some(data)))?;

        let mut bytes = Vec::new();
        Nbin::write(&mut bytes, &heap, Some(root))?;
        let report = NbinInspector::inspect_bytes(&bytes)?;

        assert_eq!(report.file_size, bytes.len() as u64);
        assert_eq!(report.types.len(), 1);
        assert_eq!(report.types[0].members[1].type_name, "short");
        assert_eq!(report.types[0].members[1].dims, 1);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[1].type_name, "short");
        assert_eq!(report.entries[1].array_length, Some(3));

        let text = report.to_string();
        assert!(text.contains("demo::Node (object)"));
        assert!(text.contains("data: short[]"));
        assert!(text.contains("short[3] (6b)"));

        let json = serde_json::to_value(&report).map_err(|e| crate::NbinError::Internal(e.to_string()))?;
        assert_eq!(json["entries"][0]["type_name"], "demo::Node");
        Ok(())
    }
}
