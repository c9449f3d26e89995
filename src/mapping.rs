use crate::error::NotifyError;
use crate::models::{Dataset, FieldKey, FieldMapping, MappedRow, Mode, Record};

/// A header that also matched a field an earlier header had already claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingConflict {
    pub field: FieldKey,
    pub header: String,
    pub kept: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingProposal {
    pub mapping: FieldMapping,
    pub conflicts: Vec<MappingConflict>,
}

/// Greedy first-match proposal. Each header, in input order, is tested against
/// the mode's fields in order; its first matching field is claimed if still free.
pub fn propose_mapping(headers: &[String], mode: Mode) -> MappingProposal {
    let mut mapping = FieldMapping::new();
    let mut conflicts = Vec::new();

    for header in headers {
        let Some(field) = best_match(header, mode) else {
            continue;
        };

        if let Some(kept) = mapping.get(field) {
            conflicts.push(MappingConflict {
                field,
                header: header.clone(),
                kept: kept.to_string(),
            });
        } else if !mapping.uses_header(header) {
            mapping.insert(field, header.clone());
        }
    }

    for conflict in &conflicts {
        tracing::warn!(
            field = %conflict.field,
            header = %conflict.header,
            kept = %conflict.kept,
            "header also matches an already mapped field"
        );
    }

    MappingProposal { mapping, conflicts }
}

fn best_match(header: &str, mode: Mode) -> Option<FieldKey> {
    let normalized = normalize_header(header);
    mode.fields().iter().copied().find(|field| {
        field
            .search_terms()
            .iter()
            .any(|term| normalized.contains(term))
    })
}

pub fn normalize_header(header: &str) -> String {
    header
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

/// Replaces proposed headers with operator choices.
pub fn apply_overrides(mapping: &mut FieldMapping, overrides: &[(FieldKey, String)]) {
    for (field, header) in overrides {
        mapping.insert(*field, header.clone());
    }
}

/// Required fields for `mode` with no mapped header, or a header not in `headers`.
pub fn missing_fields(mapping: &FieldMapping, headers: &[String], mode: Mode) -> Vec<FieldKey> {
    mode.fields()
        .iter()
        .copied()
        .filter(|field| {
            !mapping
                .get(*field)
                .is_some_and(|header| headers.iter().any(|h| h == header))
        })
        .collect()
}

pub fn is_complete(mapping: &FieldMapping, headers: &[String], mode: Mode) -> bool {
    missing_fields(mapping, headers, mode).is_empty()
}

pub fn ensure_complete(
    mapping: &FieldMapping,
    headers: &[String],
    mode: Mode,
) -> Result<(), NotifyError> {
    let missing = missing_fields(mapping, headers, mode);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(NotifyError::IncompleteMapping { missing })
    }
}

pub fn map_rows<'a>(dataset: &'a Dataset, mapping: &FieldMapping, mode: Mode) -> Vec<MappedRow<'a>> {
    let lookup = |record: &Record, field: FieldKey| {
        mapping
            .get(field)
            .map(|header| record.text(header))
            .unwrap_or_default()
    };

    dataset
        .records
        .iter()
        .map(|record| MappedRow {
            student_name: lookup(record, FieldKey::StudentName),
            class_name: lookup(record, FieldKey::ClassName),
            phone_number: lookup(record, FieldKey::PhoneNumber),
            fee_amount: (mode == Mode::Fees).then(|| lookup(record, FieldKey::FeeAmount)),
            record,
        })
        .collect()
}
