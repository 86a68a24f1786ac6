pub mod container;
pub mod models;
pub mod reader;
pub mod triple;
pub mod writer;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{CustomError, Result};

pub use container::Header;
pub use reader::{MatrixReader, MatrixRows, ReaderConfig};
pub use triple::{
    TripleReader, TripleReaderConfig, TripleRecords, TripleWriter, TripleWriterConfig,
};
pub use writer::{MatrixWriter, WriterConfig, save_matrix};

pub const GENOMATRIX_FORMAT: &str = "genotype-matrix";
pub const GENOTRIPLE_FORMAT: &str = "genotype-triple";

/// Version written by this crate.
pub const VERSION: u32 = 2;
/// Oldest reader version able to read what this crate writes.
pub const COMPAT_VERSION: u32 = 1;

pub const DEFAULT_WRITE_SCRATCH: usize = 16 * 1024 * 1024;
pub const DEFAULT_READ_SCRATCH: usize = 32 * 1024 * 1024;

/// Physical layout of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// Rows are loci, columns are samples.
    Ldat,
    /// Rows are samples, columns are loci.
    Sdat,
}

impl Orientation {
    pub fn transposed(self) -> Self {
        match self {
            Orientation::Ldat => Orientation::Sdat,
            Orientation::Sdat => Orientation::Ldat,
        }
    }
}

impl FromStr for Orientation {
    type Err = CustomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ldat" => Ok(Orientation::Ldat),
            "sdat" => Ok(Orientation::Sdat),
            other => Err(CustomError::Orientation(other.to_string())),
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Orientation::Ldat => "ldat",
            Orientation::Sdat => "sdat",
        })
    }
}

/// Reads only the header of a genopack file.
pub fn read_header(path: impl AsRef<Path>) -> Result<Header> {
    let container = container::Container::open(path)?;
    Ok(container.header().clone())
}

/// Version to interpret a file as, after checking its format tag.
///
/// Files newer than [`VERSION`] are read at their declared compatibility
/// level; files that require a newer reader are rejected.
pub(crate) fn effective_version(header: &Header, format: &str) -> Result<u32> {
    if header.format != format {
        return Err(CustomError::FormatMismatch {
            expected: format.to_string(),
            found: header.format.clone(),
        });
    }
    if header.compat_version > VERSION {
        return Err(CustomError::VersionUnsupported {
            version: header.version,
            compat_version: header.compat_version,
            supported: VERSION,
        });
    }
    if header.version > VERSION {
        Ok(header.compat_version)
    } else {
        Ok(header.version)
    }
}
