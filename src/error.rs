use thiserror::Error;

#[derive(Debug, Error)]
pub enum CustomError {
    #[error("could not read {path}")]
    ReadWithPath {
        #[source]
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[error("could not write to {path}")]
    Write {
        #[source]
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[error("could not create output directory")]
    OutputDir {
        #[source]
        source: std::io::Error,
    },

    #[error("could not write to CSV")]
    CsvWrite(#[from] csv::Error),

    #[error("could not serialize JSON")]
    Json(#[from] serde_json::Error),

    #[error("{path} is not a genopack file")]
    Magic { path: std::path::PathBuf },

    #[error("expected format \"{expected}\" (got \"{found}\")")]
    FormatMismatch { expected: String, found: String },

    #[error(
        "file requires reader version {compat_version} (file version {version}, supported {supported})"
    )]
    VersionUnsupported {
        version: u32,
        compat_version: u32,
        supported: u32,
    },

    #[error("schema violation: {0}")]
    SchemaViolation(#[from] SchemaError),

    #[error(
        "cannot add allele {allele:?}: model with max_alleles={max_alleles} is limited to {bit_width} bit(s)"
    )]
    CapacityExceeded {
        allele: String,
        max_alleles: u16,
        bit_width: u8,
    },

    #[error("model does not allow hemizygous genotype {genotype}")]
    InvalidHemizygote { genotype: String },

    #[error("genotype {genotype} is not defined by the model")]
    UnknownGenotype { genotype: String },

    #[error("expected {expected} item(s) (got {found})")]
    LengthMismatch { expected: usize, found: usize },

    #[error("genotype index {index} out of range for model with {n_genotypes} genotype(s)")]
    GenotypeIndex { index: u32, n_genotypes: usize },

    #[error("writer closed")]
    ClosedHandle,

    #[error("table \"{table}\" is corrupt: {reason}")]
    CorruptTable { table: String, reason: String },

    #[error("table \"{table}\" is missing")]
    MissingTable { table: String },

    #[error("invalid orientation \"{0}\" (expected \"ldat\" or \"sdat\")")]
    Orientation(String),

    #[error("minor allele requires at most 2 alleles (got {n_alleles})")]
    NotBiallelic { n_alleles: usize },
}

/// Structural problems with the rows, labels or models handed to a codec.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("row {label} has {found} column(s), expected {expected}")]
    RowWidth {
        label: String,
        expected: usize,
        found: usize,
    },

    #[error("ldat row {label} does not use a single model")]
    MixedRowModels { label: String },

    #[error("duplicate {axis} label {label}")]
    DuplicateLabel { axis: &'static str, label: String },

    #[error("table \"{table}\" has {found} record(s), expected {expected}")]
    TableLength {
        table: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("locus {locus} is bound to a different model in the registry")]
    LocusModel { locus: String },

    #[error("locus {locus} changed model between triples")]
    TripleModel { locus: String },
}

pub type Result<T> = std::result::Result<T, CustomError>;
