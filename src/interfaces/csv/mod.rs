//! Provider settlement reports.
//!
//! A report is fed row by row through [`MutationService::settle`], the same path
//! webhooks and the sweeper use, so importing a report twice changes nothing.

pub mod settlement_reader;

use crate::application::ledger::MutationService;
use crate::error::{LedgerError, Result};
use serde::Serialize;
use settlement_reader::{SettlementReader, SettlementRow};
use std::io::{Read, Write};
use tracing::warn;

pub const REPORT_ACTOR: &str = "report";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportOutcome {
    Applied,
    /// The ledger already reflected the reported outcome.
    Unchanged,
    Pending,
    /// Not applied; an audit record explains why.
    Rejected,
    UnknownReference,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportResult {
    pub reference: String,
    pub result: ImportOutcome,
}

/// Writes `reference,result` lines.
pub struct ResultWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> ResultWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write(&mut self, result: &ImportResult) -> Result<()> {
        self.writer.serialize(result)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub applied: usize,
    pub unchanged: usize,
    pub pending: usize,
    pub rejected: usize,
    pub unknown: usize,
    pub malformed: usize,
}

impl ImportSummary {
    fn count(&mut self, outcome: ImportOutcome) {
        match outcome {
            ImportOutcome::Applied => self.applied += 1,
            ImportOutcome::Unchanged => self.unchanged += 1,
            ImportOutcome::Pending => self.pending += 1,
            ImportOutcome::Rejected => self.rejected += 1,
            ImportOutcome::UnknownReference => self.unknown += 1,
        }
    }
}

/// Settles every readable row of `source`. Malformed rows are reported on stderr
/// and skipped; storage failures abort the import.
pub async fn import_report<R: Read, W: Write>(
    ledger: &MutationService,
    source: R,
    out: &mut ResultWriter<W>,
) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for row in SettlementReader::new(source).rows() {
        match row {
            Ok(row) => {
                let result = ImportResult {
                    result: settle_row(ledger, &row).await?,
                    reference: row.reference,
                };
                summary.count(result.result);
                out.write(&result)?;
            }
            Err(e) => {
                summary.malformed += 1;
                eprintln!("Error reading settlement row: {}", e);
            }
        }
    }
    out.flush()?;
    Ok(summary)
}

async fn settle_row(ledger: &MutationService, row: &SettlementRow) -> Result<ImportOutcome> {
    let Some(outcome) = row.status.settlement() else {
        return Ok(ImportOutcome::Pending);
    };
    match ledger
        .settle(&row.reference, outcome, row.amount, REPORT_ACTOR)
        .await
    {
        Ok(settlement) if settlement.changed => Ok(ImportOutcome::Applied),
        Ok(_) => Ok(ImportOutcome::Unchanged),
        Err(LedgerError::NotFound(_)) => Ok(ImportOutcome::UnknownReference),
        Err(
            e @ (LedgerError::InvalidTransition { .. }
            | LedgerError::AmountMismatch { .. }
            | LedgerError::Validation(_)),
        ) => {
            warn!(reference = %row.reference, "report row not applied: {e}");
            Ok(ImportOutcome::Rejected)
        }
        Err(e) => Err(e),
    }
}
