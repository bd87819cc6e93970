//! Column detection over a batch of fetched rows.

use std::collections::HashMap;

use ksync_core::{
    control_collision, parse_timestamp, sanitize_identifier, ControlField, DetectedColumn,
    FetchedRow, ScalarKind,
};
use tracing::warn;

/// PostgreSQL silently truncates longer identifiers.
pub const MAX_COLUMN_NAME_LEN: usize = 63;

const PRESERVED_PREFIX: &str = "Q_";
const SAMPLES_KEPT: usize = 3;

/// Where a remote field lands in the destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnTarget {
    Column(String),
    /// Routed into the row metadata instead of a user column.
    Metadata(ControlField),
    /// Nothing usable survives sanitization; the value only lives in the payload.
    Unusable,
}

pub fn column_target(raw_key: &str) -> ColumnTarget {
    let Some(name) = sanitize_identifier(raw_key, MAX_COLUMN_NAME_LEN) else {
        return ColumnTarget::Unusable;
    };
    match control_collision(&name) {
        None => ColumnTarget::Column(name),
        Some(
            field @ (ControlField::SubmittedAt
            | ControlField::RespondentEmail
            | ControlField::RespondentName),
        ) => ColumnTarget::Metadata(field),
        Some(_) => {
            let keep = MAX_COLUMN_NAME_LEN - PRESERVED_PREFIX.len();
            ColumnTarget::Column(format!(
                "{PRESERVED_PREFIX}{}",
                name.chars().take(keep).collect::<String>()
            ))
        }
    }
}

/// Copy metadata-looking fields into the row metadata when it lacks them.
pub fn route_control_fields(row: &mut FetchedRow) {
    for (key, value) in &row.fields {
        let Some(value) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        let ColumnTarget::Metadata(field) = column_target(key) else {
            continue;
        };
        let meta = &mut row.metadata;
        match field {
            ControlField::SubmittedAt if meta.submitted_at.is_none() => {
                meta.submitted_at = parse_timestamp(value);
            }
            ControlField::RespondentEmail if meta.respondent_email.is_none() => {
                meta.respondent_email = Some(value.to_string());
            }
            ControlField::RespondentName if meta.respondent_name.is_none() => {
                meta.respondent_name = Some(value.to_string());
            }
            _ => {}
        }
    }
}

fn has_leading_zero(value: &str) -> bool {
    let digits = value.trim_start_matches('-');
    digits.len() > 1 && digits.starts_with('0') && digits.as_bytes()[1].is_ascii_digit()
}

fn is_integer(value: &str) -> bool {
    !value.starts_with('+') && !has_leading_zero(value) && value.parse::<i64>().is_ok()
}

fn is_decimal(value: &str) -> bool {
    !value.starts_with('+')
        && !has_leading_zero(value)
        && value.parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

#[derive(Debug)]
struct Accumulator {
    column: DetectedColumn,
    sampled: usize,
    integer: bool,
    decimal: bool,
    date: bool,
}

impl Accumulator {
    fn observe_sample(&mut self, value: &str) {
        self.sampled += 1;
        self.integer &= is_integer(value);
        self.decimal &= is_decimal(value);
        self.date &= parse_timestamp(value).is_some();
        if self.column.samples.len() < SAMPLES_KEPT && !self.column.samples.iter().any(|s| s == value) {
            self.column.samples.push(value.to_string());
        }
    }

    fn finish(mut self) -> DetectedColumn {
        self.column.kind = if self.sampled == 0 {
            ScalarKind::Text
        } else if self.integer {
            ScalarKind::Integer
        } else if self.decimal {
            ScalarKind::Decimal
        } else if self.date {
            ScalarKind::Date
        } else {
            ScalarKind::Text
        };
        self.column
    }
}

/// Infer the flat column set of `rows`.
///
/// Columns keep first-appearance order. Types come from the first `sample_size`
/// rows; `max_len` covers every row so later values can still trigger widening.
pub fn detect_columns(rows: &[FetchedRow], sample_size: usize) -> Vec<DetectedColumn> {
    let mut columns: Vec<Accumulator> = Vec::new();
    let mut by_key: HashMap<&str, Option<usize>> = HashMap::new();

    for (index, row) in rows.iter().enumerate() {
        for (key, value) in &row.fields {
            let slot = *by_key.entry(key.as_str()).or_insert_with(|| {
                let ColumnTarget::Column(name) = column_target(key) else {
                    return None;
                };
                if columns
                    .iter()
                    .any(|c| c.column.name.eq_ignore_ascii_case(&name))
                {
                    warn!(field = %key, column = %name, "field maps onto an existing column; skipping");
                    return None;
                }
                columns.push(Accumulator {
                    column: DetectedColumn {
                        name,
                        source_key: key.clone(),
                        kind: ScalarKind::Text,
                        max_len: 0,
                        samples: Vec::new(),
                    },
                    sampled: 0,
                    integer: true,
                    decimal: true,
                    date: true,
                });
                Some(columns.len() - 1)
            });
            let (Some(slot), Some(value)) = (slot, value.as_deref()) else {
                continue;
            };
            let acc = &mut columns[slot];
            acc.column.max_len = acc.column.max_len.max(value.chars().count());
            let trimmed = value.trim();
            if index < sample_size && !trimmed.is_empty() {
                acc.observe_sample(trimmed);
            }
        }
    }

    columns.into_iter().map(Accumulator::finish).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksync_core::{RowFields, RowMetadata};

    fn row(id: &str, fields: &[(&str, Option<&str>)]) -> FetchedRow {
        FetchedRow {
            natural_id: id.to_string(),
            metadata: RowMetadata::default(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(ToString::to_string)))
                .collect::<RowFields>(),
        }
    }

    #[test]
    fn empty_batches_detect_nothing() {
        assert!(detect_columns(&[], 20).is_empty());
    }

    #[test]
    fn types_follow_every_non_empty_sample() {
        let rows = vec![
            row("1", &[("Total", Some("12")), ("Monto", Some("1.5")), ("Fecha", Some("2026-02-24")), ("Nota", None)]),
            row("2", &[("Total", Some("-3")), ("Monto", Some("2")), ("Fecha", Some("24/02/2026")), ("Nota", Some(""))]),
        ];
        let cols = detect_columns(&rows, 20);
        let kinds = cols.iter().map(|c| (c.name.as_str(), c.kind)).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                ("Total", ScalarKind::Integer),
                ("Monto", ScalarKind::Decimal),
                ("Fecha", ScalarKind::Date),
                ("Nota", ScalarKind::Text),
            ]
        );
    }

    #[test]
    fn one_bad_sample_demotes_to_text_and_codes_keep_leading_zeros() {
        let rows = vec![
            row("1", &[("Total", Some("12")), ("Codigo", Some("0012"))]),
            row("2", &[("Total", Some("n/a")), ("Codigo", Some("0100"))]),
        ];
        let cols = detect_columns(&rows, 20);
        assert_eq!(cols[0].kind, ScalarKind::Text);
        assert_eq!(cols[1].kind, ScalarKind::Text);
    }

    #[test]
    fn rows_past_the_sample_still_count_towards_max_len() {
        let long = "x".repeat(400);
        let rows = vec![
            row("1", &[("Comentario", Some("corto"))]),
            row("2", &[("Comentario", Some(long.as_str())), ("Nueva", Some("7"))]),
        ];
        let cols = detect_columns(&rows, 1);
        assert_eq!(cols[0].max_len, 400);
        assert_eq!(cols[0].samples, vec!["corto".to_string()]);
        // Only seen outside the sample window: no evidence, so text.
        assert_eq!(cols[1].name, "Nueva");
        assert_eq!(cols[1].kind, ScalarKind::Text);
    }

    #[test]
    fn colliding_names_keep_the_first_field() {
        let rows = vec![row("1", &[("¿Local?", Some("a")), ("Local", Some("b")), ("local", Some("c"))])];
        let cols = detect_columns(&rows, 20);
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].source_key, "¿Local?");
    }

    #[test]
    fn control_names_are_routed_or_preserved() {
        assert_eq!(column_target("Submitted At"), ColumnTarget::Metadata(ControlField::SubmittedAt));
        assert_eq!(column_target("ID"), ColumnTarget::Column("Q_ID".into()));
        assert_eq!(column_target("payload_hash"), ColumnTarget::Column("Q_payload_hash".into()));
        assert_eq!(column_target("???"), ColumnTarget::Unusable);

        let mut r = row(
            "1",
            &[("Respondent Email", Some("ana@x.test")), ("Submitted_At", Some("2026-02-24 08:00:00"))],
        );
        route_control_fields(&mut r);
        assert_eq!(r.metadata.respondent_email.as_deref(), Some("ana@x.test"));
        assert!(r.metadata.submitted_at.is_some());
        assert!(detect_columns(&[r], 20).is_empty());
    }

    #[test]
    fn routing_never_overrides_existing_metadata() {
        let mut r = row("1", &[("RespondentName", Some("Otro"))]);
        r.metadata.respondent_name = Some("Ana".into());
        route_control_fields(&mut r);
        assert_eq!(r.metadata.respondent_name.as_deref(), Some("Ana"));
    }
}
