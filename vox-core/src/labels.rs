//! Fixed lookup tables: command codes carried in the first sample, and classifier output labels.

use serde::Serialize;

/// Requested operation, encoded in sample 0 of a session's first fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Command {
    #[serde(rename = "SELECT")]
    Select,
    #[serde(rename = "DELETE")]
    Delete,
}

impl Command {
    const TABLE: [Command; 2] = [Command::Select, Command::Delete];

    /// Look up a command code. Codes outside the table return None.
    pub fn from_code(code: i16) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::TABLE.get(i).copied())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Select => "SELECT",
            Command::Delete => "DELETE",
        }
    }
}

/// Classifier output category. Index order matches the accelerator's output words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    Chair,
    Table,
    Lamp,
    Tv,
    Bed,
    Plant,
    Sofa,
    /// Two output slots (7 and 8) both mean "ODM".
    Odm,
    Up,
    Down,
}

/// Output slot → label. Length equals the accelerator's output word count.
pub const LABELS: [Label; 11] = [
    Label::Chair,
    Label::Table,
    Label::Lamp,
    Label::Tv,
    Label::Bed,
    Label::Plant,
    Label::Sofa,
    Label::Odm,
    Label::Odm,
    Label::Up,
    Label::Down,
];

impl Label {
    pub fn from_index(index: usize) -> Option<Self> {
        LABELS.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Chair => "chair",
            Label::Table => "table",
            Label::Lamp => "lamp",
            Label::Tv => "TV",
            Label::Bed => "bed",
            Label::Plant => "plant",
            Label::Sofa => "sofa",
            Label::Odm => "ODM",
            Label::Up => "up",
            Label::Down => "down",
        }
    }
}

impl Serialize for Label {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
