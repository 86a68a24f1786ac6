//! Binary genotype triple files: `(sample, locus, genotype)` records.
//!
//! Each record is three little-endian `i32`: sample index, locus index and
//! genotype index within the locus model. Labels get indices in the order
//! they are first written.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::binary::container::{
    ChunkRecord, Container, ContainerWriter, Header, decode_chunks, decode_strings, encode_chunks,
    encode_strings,
};
use crate::binary::models::ModelTable;
use crate::binary::reader::check_unique;
use crate::binary::{COMPAT_VERSION, GENOTRIPLE_FORMAT, VERSION, effective_version};
use crate::error::{CustomError, Result, SchemaError};
use crate::locus::{Genome, Locus};
use crate::model::{Genotype, Model};

const RECORD_SIZE: usize = 12;
const TRIPLE_LAYOUT: &str = "triple";

#[derive(Debug, Clone)]
pub struct TripleWriterConfig {
    pub compress: bool,
    /// Bytes of records per chunk.
    pub chunk_bytes: usize,
}

impl Default for TripleWriterConfig {
    fn default() -> Self {
        Self {
            compress: true,
            chunk_bytes: 232_960,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TripleReaderConfig {
    /// Registry to recode loaded models into.
    pub genome: Option<Genome>,
    /// Reject files with repeated sample or locus labels.
    pub unique: bool,
}

impl Default for TripleReaderConfig {
    fn default() -> Self {
        Self {
            genome: None,
            unique: true,
        }
    }
}

#[derive(Debug, Default)]
struct LabelIndex {
    labels: Vec<String>,
    index: HashMap<String, u32>,
}

impl LabelIndex {
    /// Index of `label` and whether it was new.
    fn intern(&mut self, label: &str) -> (u32, bool) {
        if let Some(&id) = self.index.get(label) {
            return (id, false);
        }
        let id = self.labels.len() as u32;
        self.labels.push(label.to_string());
        self.index.insert(label.to_string(), id);
        (id, true)
    }
}

struct OpenTriples {
    out: ContainerWriter,
    samples: LabelIndex,
    loci: LabelIndex,
    locus_models: Vec<Model>,
    buffer: Vec<u8>,
    chunk_records: usize,
    chunks: Vec<ChunkRecord>,
}

pub struct TripleWriter {
    genome: Genome,
    state: Option<Box<OpenTriples>>,
}

impl TripleWriter {
    pub fn create(path: impl AsRef<Path>, genome: Genome, config: TripleWriterConfig) -> Result<Self> {
        let header = Header {
            format: GENOTRIPLE_FORMAT.to_string(),
            version: VERSION,
            compat_version: COMPAT_VERSION,
            layout: TRIPLE_LAYOUT.to_string(),
            compressed: config.compress,
        };
        let out = ContainerWriter::create(path, &header)?;
        Ok(Self {
            genome,
            state: Some(Box::new(OpenTriples {
                out,
                samples: LabelIndex::default(),
                loci: LabelIndex::default(),
                locus_models: Vec::new(),
                buffer: Vec::new(),
                chunk_records: (config.chunk_bytes / RECORD_SIZE).max(1),
                chunks: Vec::new(),
            })),
        })
    }

    /// Appends one call. Every call for a locus must use the same model.
    pub fn write(&mut self, sample: &str, locus: &str, genotype: &Genotype) -> Result<()> {
        let open = self.state.as_mut().ok_or(CustomError::ClosedHandle)?;
        let (locus_idx, new_locus) = open.loci.intern(locus);
        if new_locus {
            open.locus_models.push(genotype.model().clone());
        } else if !open.locus_models[locus_idx as usize].ptr_eq(genotype.model()) {
            return Err(SchemaError::TripleModel {
                locus: locus.to_string(),
            }
            .into());
        }
        let (sample_idx, _) = open.samples.intern(sample);

        for value in [sample_idx, locus_idx, genotype.index()] {
            open.buffer.extend_from_slice(&(value as i32).to_le_bytes());
        }
        if open.buffer.len() >= open.chunk_records * RECORD_SIZE {
            open.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        let mut open = self.state.take().ok_or(CustomError::ClosedHandle)?;
        open.flush()?;
        let table = ModelTable::build(&open.loci.labels, &self.genome, &open.locus_models)?;
        let samples = encode_strings(&open.samples.labels);
        let loci = encode_strings(&open.loci.labels);
        let chunks = encode_chunks(&open.chunks);
        open.out.write_table("samples", &samples)?;
        open.out.write_table("loci", &loci)?;
        open.out.write_table("chunks", &chunks)?;
        table.save(&mut open.out)?;
        debug!(
            samples = open.samples.labels.len(),
            loci = open.loci.labels.len(),
            chunks = open.chunks.len(),
            "closed triple writer"
        );
        open.out.finish()
    }
}

impl OpenTriples {
    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let block = self.out.write_block(&self.buffer)?;
        self.chunks.push(ChunkRecord {
            block,
            n_records: self.buffer.len() / RECORD_SIZE,
        });
        self.buffer.clear();
        Ok(())
    }
}

impl Drop for TripleWriter {
    fn drop(&mut self) {
        if self.state.is_some()
            && let Err(e) = self.close()
        {
            warn!(error = %e, "could not close triple writer");
        }
    }
}

/// Reader for triple files; models are rebuilt eagerly and records are
/// decoded one chunk at a time.
pub struct TripleReader {
    container: Container,
    samples: Vec<String>,
    loci: Vec<String>,
    chunks: Vec<ChunkRecord>,
    n_records: usize,
    file_models: Vec<Model>,
    models: Vec<Model>,
    genome: Genome,
}

impl TripleReader {
    pub fn open(path: impl AsRef<Path>, config: TripleReaderConfig) -> Result<Self> {
        let container = Container::open(path)?;
        let version = effective_version(container.header(), GENOTRIPLE_FORMAT)?;
        let samples = decode_strings("samples", &container.table("samples")?)?;
        let loci = decode_strings("loci", &container.table("loci")?)?;
        if config.unique {
            check_unique("sample", &samples)?;
            check_unique("locus", &loci)?;
        }

        let chunks = decode_chunks(&container.table("chunks")?)?;
        let mut n_records = 0usize;
        for (i, chunk) in chunks.iter().enumerate() {
            let corrupt = || CustomError::CorruptTable {
                table: "chunks".to_string(),
                reason: format!("chunk {i} does not hold {} record(s)", chunk.n_records),
            };
            let bytes = chunk
                .n_records
                .checked_mul(RECORD_SIZE)
                .ok_or_else(corrupt)?;
            if chunk.block.raw_len != bytes as u64 {
                return Err(corrupt());
            }
            n_records = n_records.checked_add(chunk.n_records).ok_or_else(corrupt)?;
        }

        let (file_models, file_genome) = ModelTable::load(&container, version)?.reconstruct(&loci)?;
        let (models, genome) = match config.genome {
            Some(mut target) => {
                let models = loci
                    .iter()
                    .zip(&file_models)
                    .map(|(name, model)| {
                        let locus = file_genome
                            .get(name)
                            .cloned()
                            .unwrap_or_else(|| Locus::new(name.as_str()));
                        target.unify(&locus, model)
                    })
                    .collect();
                (models, target)
            }
            None => (file_models.clone(), file_genome),
        };

        Ok(Self {
            container,
            samples,
            loci,
            chunks,
            n_records,
            file_models,
            models,
            genome,
        })
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn loci(&self) -> &[String] {
        &self.loci
    }

    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    pub fn n_records(&self) -> usize {
        self.n_records
    }

    pub fn triples(self) -> TripleRecords {
        TripleRecords {
            reader: Some(self),
            chunk: 0,
            data: Vec::new(),
            pos: 0,
        }
    }

    fn decode(&self, record: &[u8]) -> Result<(String, String, Genotype)> {
        let field = |i: usize| {
            i32::from_le_bytes([
                record[4 * i],
                record[4 * i + 1],
                record[4 * i + 2],
                record[4 * i + 3],
            ])
        };
        let corrupt = |reason: String| CustomError::CorruptTable {
            table: "chunks".to_string(),
            reason,
        };
        let (sample, locus, index) = (field(0), field(1), field(2));
        let sample = usize::try_from(sample)
            .ok()
            .and_then(|s| self.samples.get(s))
            .ok_or_else(|| corrupt(format!("invalid sample index {sample}")))?;
        let locus_idx = usize::try_from(locus)
            .ok()
            .filter(|&l| l < self.loci.len())
            .ok_or_else(|| corrupt(format!("invalid locus index {locus}")))?;

        let model = &self.file_models[locus_idx];
        let geno = u32::try_from(index)
            .ok()
            .and_then(|i| model.genotype(i))
            .ok_or_else(|| CustomError::GenotypeIndex {
                index: index as u32,
                n_genotypes: model.n_genotypes(),
            })?;
        let target = &self.models[locus_idx];
        let geno = if target.ptr_eq(model) {
            geno
        } else {
            target.add_genotype(geno.alleles())?
        };
        Ok((sample.clone(), self.loci[locus_idx].clone(), geno))
    }
}

/// Forward-only stream of `(sample, locus, genotype)` records.
pub struct TripleRecords {
    reader: Option<TripleReader>,
    chunk: usize,
    data: Vec<u8>,
    pos: usize,
}

impl TripleRecords {
    pub fn close(&mut self) {
        self.reader = None;
    }

    fn next_record(&mut self) -> Result<Option<(String, String, Genotype)>> {
        let Some(reader) = &self.reader else {
            return Ok(None);
        };
        while self.pos >= self.data.len() {
            let Some(chunk) = reader.chunks.get(self.chunk) else {
                return Ok(None);
            };
            self.data = reader.container.block(&chunk.block, "chunks")?.into_owned();
            self.pos = 0;
            self.chunk += 1;
        }
        let record = &self.data[self.pos..self.pos + RECORD_SIZE];
        self.pos += RECORD_SIZE;
        reader.decode(record).map(Some)
    }
}

impl Iterator for TripleRecords {
    type Item = Result<(String, String, Genotype)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.reader = None;
                None
            }
            Err(e) => {
                self.reader = None;
                Some(Err(e))
            }
        }
    }
}
