//! Human readable location of the value being transcoded, attached to
//! failures as `Type#field[index].nested`.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Type(String),
    Field(String),
    Index(usize),
}

/// A stack of path segments, pushed and popped while walking an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// An empty path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the path at an entry of type `name`, dropping previous segments.
    pub fn reset(&mut self, name: impl Into<String>) {
        self.segments.clear();
        self.segments.push(Segment::Type(name.into()));
    }

    /// Enters a field.
    pub fn push_field(&mut self, name: &str) {
        self.segments.push(Segment::Field(name.to_string()));
    }

    /// Enters an array element.
    pub fn push_index(&mut self, index: usize) {
        self.segments.push(Segment::Index(index));
    }

    /// Leaves the last field or element.
    pub fn pop(&mut self) {
        if self.segments.len() > 1 {
            self.segments.pop();
        }
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut after_type = false;
        for segment in &self.segments {
            match segment {
                Segment::Type(name) => {
                    f.write_str(name)?;
                    after_type = true;
                }
                Segment::Field(name) if after_type => {
                    write!(f, "#{name}")?;
                    after_type = false;
                }
                Segment::Field(name) => write!(f, ".{name}")?,
                Segment::Index(index) => {
                    write!(f, "[{index}]")?;
                    after_type = false;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_type_field_index_chain() {
        let mut path = FieldPath::new();
        path.reset("demo::Scene");
        path.push_field("nodes");
        assert_eq!(path.to_string(), "demo::Scene#nodes");
        path.pop();

        path.reset("demo::Transform[]");
        path.push_index(3);
        path.push_field("scale");
        path.push_field("x");
        assert_eq!(path.to_string(), "demo::Transform[][3].scale.x");

        path.pop();
        path.pop();
        path.pop();
        path.pop();
        assert_eq!(path.to_string(), "demo::Transform[]");
        assert_eq!(path.depth(), 1);
    }
}
