use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;

pub const DEFAULT_ENDPOINT: &str = "https://graph.facebook.com/v19.0/";

/// Which notification campaign is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Fee reminder
    Fees,
    /// Grade report
    #[value(alias = "marks")]
    Grades,
}

impl Mode {
    /// Required semantic fields, in the order the mapper tries them.
    pub fn fields(self) -> &'static [FieldKey] {
        match self {
            Mode::Fees => &[
                FieldKey::StudentName,
                FieldKey::ClassName,
                FieldKey::PhoneNumber,
                FieldKey::FeeAmount,
            ],
            Mode::Grades => &[
                FieldKey::StudentName,
                FieldKey::ClassName,
                FieldKey::PhoneNumber,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Fees => "fees",
            Mode::Grades => "grades",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldKey {
    StudentName,
    ClassName,
    PhoneNumber,
    FeeAmount,
}

impl FieldKey {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKey::StudentName => "studentName",
            FieldKey::ClassName => "className",
            FieldKey::PhoneNumber => "phoneNumber",
            FieldKey::FeeAmount => "feeAmount",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FieldKey::StudentName => "Student Name",
            FieldKey::ClassName => "Class",
            FieldKey::PhoneNumber => "Parent Phone Number",
            FieldKey::FeeAmount => "Fee Amount",
        }
    }

    /// Substrings looked for in a normalised header.
    pub fn search_terms(self) -> &'static [&'static str] {
        match self {
            FieldKey::StudentName => &["student", "name"],
            FieldKey::ClassName => &["class", "grade", "standard"],
            FieldKey::PhoneNumber => &["phone", "mobile", "contact"],
            FieldKey::FeeAmount => &["fee", "amount", "due", "balance"],
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "studentname" | "student" => Ok(FieldKey::StudentName),
            "classname" | "class" => Ok(FieldKey::ClassName),
            "phonenumber" | "phone" => Ok(FieldKey::PhoneNumber),
            "feeamount" | "fee" => Ok(FieldKey::FeeAmount),
            _ => Err(format!(
                "unknown field `{value}` (expected studentName, className, phoneNumber or feeAmount)"
            )),
        }
    }
}

/// A raw spreadsheet cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Text(text) => f.write_str(text),
            // Whole numbers print without a trailing ".0".
            CellValue::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            CellValue::Number(n) => write!(f, "{n}"),
        }
    }
}

/// One uploaded row, cells kept in the file's column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    cells: Vec<(String, CellValue)>,
}

impl Record {
    pub fn new(cells: Vec<(String, CellValue)>) -> Self {
        Self { cells }
    }

    pub fn get(&self, header: &str) -> Option<&CellValue> {
        self.cells
            .iter()
            .find(|(name, _)| name == header)
            .map(|(_, value)| value)
    }

    /// Cell rendered as text; absent cells become the empty string.
    pub fn text(&self, header: &str) -> String {
        self.get(header).map(ToString::to_string).unwrap_or_default()
    }

    pub fn cells(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.cells.iter().map(|(name, value)| (name.as_str(), value))
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    pub headers: Vec<String>,
    pub records: Vec<Record>,
}

/// Semantic field to source column header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldMapping {
    fields: BTreeMap<FieldKey, String>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: FieldKey, header: impl Into<String>) {
        self.fields.insert(field, header.into());
    }

    pub fn get(&self, field: FieldKey) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    /// Matches by header, so a header mapped to two fields still counts once.
    pub fn uses_header(&self, header: &str) -> bool {
        self.iter().any(|(_, mapped)| mapped == header)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldKey, &str)> {
        self.fields.iter().map(|(field, header)| (*field, header.as_str()))
    }
}

impl<const N: usize> From<[(FieldKey, &str); N]> for FieldMapping {
    fn from(pairs: [(FieldKey, &str); N]) -> Self {
        let mut mapping = FieldMapping::new();
        for (field, header) in pairs {
            mapping.insert(field, header);
        }
        mapping
    }
}

/// A record seen through a [`FieldMapping`].
#[derive(Debug, Clone)]
pub struct MappedRow<'a> {
    pub student_name: String,
    pub class_name: String,
    pub phone_number: String,
    pub fee_amount: Option<String>,
    pub record: &'a Record,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeTextParams {
    pub fee_name: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub exam_name: Option<String>,
}

/// Positional text parameters for a provider template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchParameters(pub Vec<String>);

impl DispatchParameters {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Failed,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendStatus::Success => f.write_str("success"),
            SendStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub student_name: String,
    pub status: SendStatus,
    pub message: String,
}

/// The singleton provider configuration record.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    pub phone_number_id: String,
    pub waba_id: String,
    pub access_token: String,
    pub endpoint: String,
    pub fees_template_name: String,
    pub marks_template_name: String,
    pub lock_password: Option<String>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("phone_number_id", &self.phone_number_id)
            .field("waba_id", &self.waba_id)
            .field("access_token", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("fees_template_name", &self.fees_template_name)
            .field("marks_template_name", &self.marks_template_name)
            .field("lock_password", &self.lock_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Settings {
    /// Template configured for `mode`, if any.
    pub fn template_for(&self, mode: Mode) -> Option<&str> {
        let name = match mode {
            Mode::Fees => &self.fees_template_name,
            Mode::Grades => &self.marks_template_name,
        };
        let name = name.trim();
        (!name.is_empty()).then_some(name)
    }

    /// Names of the given fields that are blank.
    pub fn blank_fields(&self, required: &[&'static str]) -> Vec<&'static str> {
        required
            .iter()
            .copied()
            .filter(|field| {
                let value = match *field {
                    "phone_number_id" => &self.phone_number_id,
                    "waba_id" => &self.waba_id,
                    "access_token" => &self.access_token,
                    "endpoint" => &self.endpoint,
                    "fees_template_name" => &self.fees_template_name,
                    "marks_template_name" => &self.marks_template_name,
                    _ => return false,
                };
                value.trim().is_empty()
            })
            .collect()
    }
}
