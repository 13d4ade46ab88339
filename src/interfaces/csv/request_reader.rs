use crate::application::host::StartRequest;
use crate::error::{ChargeError, Result};
use std::io::Read;

/// Reads start requests from a CSV source.
///
/// Expected header: `customer_id, amount, wait_seconds` with an optional trailing
/// `orchestration_id` column. Whitespace is trimmed and rows may omit the optional
/// column.
pub struct StartRequestReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> StartRequestReader<R> {
    /// Creates a new `StartRequestReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes requests.
    pub fn requests(self) -> impl Iterator<Item = Result<StartRequest>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(ChargeError::from))
    }
}
