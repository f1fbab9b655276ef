use std::{collections::BTreeMap, path::Path};

use crate::errors::Result;

/// Counts rows per table in the live database for the snapshot metadata.
///
/// The database engine belongs to the host application; the archiver only
/// records whatever the census reports.
pub trait RecordCensus: Send + Sync {
    fn count_records(&self, database: &Path) -> Result<BTreeMap<String, u64>>;
}

/// Census used when no database collaborator is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCensus;

impl RecordCensus for NoCensus {
    fn count_records(&self, _database: &Path) -> Result<BTreeMap<String, u64>> {
        Ok(BTreeMap::new())
    }
}

impl<F> RecordCensus for F
where
    F: Fn(&Path) -> Result<BTreeMap<String, u64>> + Send + Sync,
{
    fn count_records(&self, database: &Path) -> Result<BTreeMap<String, u64>> {
        self(database)
    }
}
