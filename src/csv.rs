use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::ledger::LedgerEntry;
use crate::{Amount, Command, CreatorId, RateModel, SourceRef};

/// Errors that can occur when reading accrual rows or writing the report
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized source type '{source_type}'")]
    UnrecognizedSource { line: usize, source_type: String },

    #[error("line {line}: negative rate {rate}")]
    NegativeRate { line: usize, rate: f64 },

    #[error("line {line}: unrecognized rate model '{model}'")]
    UnrecognizedModel { line: usize, model: String },

    #[error("line {line}: milestone needs a threshold")]
    MissingThreshold { line: usize },

    #[error("failed to write report: {0}")]
    Write(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct AccrualRow {
    creator: CreatorId,
    source_type: String,
    source_id: u64,
    rate: f64,
    views: u64,
    /// Empty means per view.
    #[serde(default)]
    model: Option<String>,
    /// Flat fee per video for `cpm`.
    #[serde(default)]
    flat: Option<f64>,
    /// View threshold for `milestone`, minimum views for `cpm_bonus`.
    #[serde(default)]
    threshold: Option<u64>,
}

impl AccrualRow {
    fn rate_model(&self, line: usize) -> Result<RateModel, CsvError> {
        for value in [Some(self.rate), self.flat].into_iter().flatten() {
            if value < 0.0 {
                return Err(CsvError::NegativeRate { line, rate: value });
            }
        }
        let rate = Amount::from_float(self.rate);
        Ok(match self.model.as_deref().unwrap_or("per_view") {
            "per_view" => RateModel::PerView { rate },
            "cpm" => RateModel::Cpm {
                rpm: rate,
                flat_per_video: Amount::from_float(self.flat.unwrap_or(0.0)),
            },
            "milestone" => RateModel::Milestone {
                threshold: self.threshold.ok_or(CsvError::MissingThreshold { line })?,
                bonus: rate,
            },
            "cpm_bonus" => RateModel::CpmBonus {
                rpm: rate,
                min_views: self.threshold.unwrap_or(0),
            },
            "flat" => RateModel::Flat { amount: rate },
            other => {
                return Err(CsvError::UnrecognizedModel {
                    line,
                    model: other.to_string(),
                });
            }
        })
    }
}

#[derive(Debug, Serialize)]
struct ReportRow {
    creator: CreatorId,
    source: String,
    accrued: String,
    paid: String,
    status: &'static str,
}

/// Read accrual rows (`creator,source_type,source_id,rate,views`) from a csv
/// file as accrue commands
///
/// Optional `model`, `flat` and `threshold` columns pick a rate model other
/// than per view; `rate` is then the RPM, bonus or flat amount.
pub fn read_accruals(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;
    Ok(parse_rows(reader))
}

/// Same as [`read_accruals`] over any reader
pub fn read_accruals_from(
    input: impl io::Read,
) -> impl Iterator<Item = Result<Command, CsvError>> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);
    parse_rows(reader)
}

fn parse_rows<R: io::Read>(
    reader: csv::Reader<R>,
) -> impl Iterator<Item = Result<Command, CsvError>> {
    reader
        .into_deserialize::<AccrualRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            let source = SourceRef::parse(&row.source_type, row.source_id).ok_or_else(|| {
                CsvError::UnrecognizedSource {
                    line,
                    source_type: row.source_type.clone(),
                }
            })?;
            let rate = row.rate_model(line)?;
            Ok(Command::Accrue {
                creator: row.creator,
                source,
                rate,
                views: row.views,
            })
        })
}

/// Write ledger entries in csv format, ordered by creator then source
pub fn write_ledger(
    output: impl io::Write,
    entries: impl IntoIterator<Item = LedgerEntry>,
) -> Result<(), CsvError> {
    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort_by_key(|e| (e.creator, e.source));

    let mut writer = csv::Writer::from_writer(output);
    for entry in entries {
        let row = ReportRow {
            creator: entry.creator,
            source: entry.source.to_string(),
            accrued: entry.accrued_amount.to_string(),
            paid: entry.paid_amount.to_string(),
            status: entry.status.as_str(),
        };
        writer.serialize(&row)?;
    }

    writer.flush().map_err(|e| CsvError::Write(e.into()))
}
