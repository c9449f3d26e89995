use chrono::NaiveDate;

use crate::models::{DispatchParameters, FieldKey, FieldMapping, FreeTextParams, MappedRow, Mode, Record};

/// Builds the template's positional parameters for one record.
///
/// Fees: `[student (class), fee name, due date, fee amount]`.
/// Grades: `[student (class), exam name, grades list]`.
pub fn compose(
    record: &Record,
    mapping: &FieldMapping,
    mode: Mode,
    params: &FreeTextParams,
) -> DispatchParameters {
    let field = |key: FieldKey| {
        mapping
            .get(key)
            .map(|header| record.text(header))
            .unwrap_or_default()
    };
    let student_and_class = format!(
        "{} ({})",
        field(FieldKey::StudentName),
        field(FieldKey::ClassName)
    );

    let values = match mode {
        Mode::Fees => vec![
            student_and_class,
            params.fee_name.clone().unwrap_or_default(),
            params.due_date.map(format_long_date).unwrap_or_default(),
            field(FieldKey::FeeAmount),
        ],
        Mode::Grades => vec![
            student_and_class,
            params.exam_name.clone().unwrap_or_default(),
            grades_list(record, mapping),
        ],
    };
    DispatchParameters(values)
}

/// `Subject: Grade` lines for every column the mapping does not use, in column order.
pub fn grades_list(record: &Record, mapping: &FieldMapping) -> String {
    record
        .cells()
        .filter(|(header, _)| !mapping.uses_header(header))
        .map(|(subject, grade)| format!("{subject}: {grade}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_long_date(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

/// Human-readable rendering of the message a row will receive.
pub fn render_preview(
    row: &MappedRow<'_>,
    mapping: &FieldMapping,
    mode: Mode,
    params: &FreeTextParams,
) -> String {
    let student_and_class = format!(
        "{} ({})",
        or_placeholder(&row.student_name, "[Student]"),
        or_placeholder(&row.class_name, "[Class]")
    );

    match mode {
        Mode::Fees => {
            let fee_name = params.fee_name.as_deref().unwrap_or("");
            let due_date = params.due_date.map(format_long_date).unwrap_or_default();
            let fee_amount = row.fee_amount.as_deref().unwrap_or("");
            format!(
                "Hello! This is a gentle reminder that {student_and_class}'s {} is pending and is due on {}. \
                 Due Amount: {}. Kindly take care of it at your convenience.",
                or_placeholder(fee_name, "[Fee Name]"),
                or_placeholder(&due_date, "[Due Date]"),
                or_placeholder(fee_amount, "[N/A]"),
            )
        }
        Mode::Grades => {
            let grades = grades_list(row.record, mapping);
            let exam_name = params.exam_name.as_deref().unwrap_or("");
            format!(
                "Hello Parent, here is the report for {student_and_class} for the {} examination:\n\n\
                 Subject-wise Grades:\n{}",
                or_placeholder(exam_name, "[Exam Name]"),
                or_placeholder(&grades, "No grades available."),
            )
        }
    }
}

fn or_placeholder<'a>(value: &'a str, placeholder: &'a str) -> &'a str {
    if value.is_empty() {
        placeholder
    } else {
        value
    }
}
