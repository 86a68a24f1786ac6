//! Bit-packed genotype models and arrays, plus a chunked binary matrix
//! format with streaming transposition between locus-major (`ldat`) and
//! sample-major (`sdat`) layouts.

pub mod binary;
pub mod error;
pub mod genoarray;
pub mod locus;
pub mod model;
pub mod stats;

pub use binary::{
    MatrixReader, MatrixRows, MatrixWriter, Orientation, ReaderConfig, TripleReader,
    TripleReaderConfig, TripleWriter, TripleWriterConfig, WriterConfig, save_matrix,
};
pub use error::{CustomError, Result, SchemaError};
pub use genoarray::{GenotypeArray, GenotypeArrayDescriptor};
pub use locus::{Genome, Locus, Strand};
pub use model::{Allele, Genotype, GenotypeClass, Model, model_from_alleles, model_from_genotypes};
