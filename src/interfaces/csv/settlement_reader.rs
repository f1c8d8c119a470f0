use crate::domain::provider::ProviderStatus;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One line of a provider settlement report: `reference,status,amount`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SettlementRow {
    pub reference: String,
    pub status: ProviderStatus,
    /// Left empty by providers that only report a status.
    #[serde(default)]
    pub amount: Option<Decimal>,
}

/// Reads settlement rows from a CSV source.
///
/// Whitespace around fields is trimmed and short rows are tolerated, so a missing
/// trailing `amount` column reads as `None`.
pub struct SettlementReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> SettlementReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes rows; a malformed row yields an error and reading continues.
    pub fn rows(self) -> impl Iterator<Item = Result<SettlementRow>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(LedgerError::from))
    }
}
