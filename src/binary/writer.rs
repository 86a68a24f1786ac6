use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::binary::container::{ChunkRecord, ContainerWriter, Header, encode_chunks, encode_strings};
use crate::binary::models::ModelTable;
use crate::binary::{COMPAT_VERSION, DEFAULT_WRITE_SCRATCH, GENOMATRIX_FORMAT, Orientation, VERSION};
use crate::error::{CustomError, Result, SchemaError};
use crate::genoarray::{GenotypeArray, GenotypeArrayDescriptor};
use crate::locus::Genome;
use crate::model::Model;

const MIN_CHUNK_ROWS: usize = 8;
const MAX_CHUNK_ROWS: usize = 8192;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub compress: bool,
    /// Bytes of packed rows buffered before a chunk is written.
    pub scratch: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            compress: true,
            scratch: DEFAULT_WRITE_SCRATCH,
        }
    }
}

enum WriterState {
    NotOpen,
    Open(Box<OpenMatrix>),
    Closed,
}

struct OpenMatrix {
    out: ContainerWriter,
    labels: Vec<String>,
    // ldat only: the model of each row
    row_models: Vec<Model>,
    // sdat only: the layout shared by every row
    descriptor: Option<Rc<GenotypeArrayDescriptor>>,
    chunk: Vec<u8>,
    chunk_len: usize,
    chunk_rows: usize,
    chunks: Vec<ChunkRecord>,
}

/// Streams rows of a genotype matrix into a new file.
///
/// The file is created by the first row; the first row's packed width
/// sets how many rows go into each chunk.
pub struct MatrixWriter {
    path: PathBuf,
    orientation: Orientation,
    columns: Vec<String>,
    genome: Genome,
    config: WriterConfig,
    state: WriterState,
}

impl MatrixWriter {
    /// `columns` are samples for ldat and loci for sdat. `genome` supplies
    /// locus metadata and, for an empty sdat matrix, the column models.
    pub fn new(
        path: impl AsRef<Path>,
        orientation: Orientation,
        columns: Vec<String>,
        genome: Genome,
        config: WriterConfig,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            orientation,
            columns,
            genome,
            config,
            state: WriterState::NotOpen,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn write_row(&mut self, label: &str, row: &GenotypeArray) -> Result<()> {
        if matches!(self.state, WriterState::Closed) {
            return Err(CustomError::ClosedHandle);
        }
        if row.len() != self.columns.len() {
            return Err(SchemaError::RowWidth {
                label: label.to_string(),
                expected: self.columns.len(),
                found: row.len(),
            }
            .into());
        }
        let row_model = match self.orientation {
            Orientation::Ldat => Some(self.ldat_model(label, row)?),
            Orientation::Sdat => None,
        };

        if matches!(self.state, WriterState::NotOpen) {
            let open = self.open(row)?;
            self.state = WriterState::Open(Box::new(open));
        }
        let WriterState::Open(open) = &mut self.state else {
            unreachable!("writer is open after the first row");
        };

        match (&open.descriptor, row_model) {
            (_, Some(model)) => {
                if row.descriptor().initial_offset() == 0 {
                    open.chunk.extend_from_slice(row.as_bytes());
                } else {
                    let n = row.len();
                    let packed = row.recoded(Rc::new(GenotypeArrayDescriptor::repeated(
                        model.clone(),
                        n,
                        0,
                    )))?;
                    open.chunk.extend_from_slice(packed.as_bytes());
                }
                open.row_models.push(model);
            }
            (Some(descriptor), None) => {
                if Rc::ptr_eq(row.descriptor(), descriptor) || row.descriptor().same_layout(descriptor)
                {
                    open.chunk.extend_from_slice(row.as_bytes());
                } else {
                    let packed = row.recoded(descriptor.clone())?;
                    open.chunk.extend_from_slice(packed.as_bytes());
                }
            }
            (None, None) => unreachable!("sdat writer without a descriptor"),
        }
        open.labels.push(label.to_string());
        open.chunk_len += 1;
        if open.chunk_len >= open.chunk_rows {
            open.flush_chunk()?;
        }
        Ok(())
    }

    pub fn write_rows<I, S>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, GenotypeArray)>,
        S: AsRef<str>,
    {
        for (label, row) in rows {
            self.write_row(label.as_ref(), &row)?;
        }
        Ok(())
    }

    /// Flushes buffered rows and writes the label and model tables.
    ///
    /// A writer that never received a row still produces a valid, empty
    /// matrix. Closing twice fails with [`CustomError::ClosedHandle`].
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Closed => Err(CustomError::ClosedHandle),
            WriterState::NotOpen => {
                let descriptor = match self.orientation {
                    Orientation::Sdat => Some(Rc::new(GenotypeArrayDescriptor::new(
                        self.columns
                            .iter()
                            .map(|c| self.genome.model(c).cloned().unwrap_or_else(|| Model::new(false, 2)))
                            .collect(),
                    ))),
                    Orientation::Ldat => None,
                };
                let out = ContainerWriter::create(&self.path, &self.header())?;
                let open = OpenMatrix::new(out, descriptor, MIN_CHUNK_ROWS);
                self.finish(open)
            }
            WriterState::Open(open) => self.finish(*open),
        }
    }

    fn header(&self) -> Header {
        Header {
            format: GENOMATRIX_FORMAT.to_string(),
            version: VERSION,
            compat_version: COMPAT_VERSION,
            layout: self.orientation.to_string(),
            compressed: self.config.compress,
        }
    }

    fn ldat_model(&self, label: &str, row: &GenotypeArray) -> Result<Model> {
        if let Some(model) = row.descriptor().uniform_model() {
            return Ok(model.clone());
        }
        if row.is_empty() {
            return Ok(self
                .genome
                .model(label)
                .cloned()
                .unwrap_or_else(|| Model::new(false, 2)));
        }
        Err(SchemaError::MixedRowModels {
            label: label.to_string(),
        }
        .into())
    }

    fn open(&self, first: &GenotypeArray) -> Result<OpenMatrix> {
        let descriptor = match self.orientation {
            Orientation::Sdat if first.descriptor().initial_offset() == 0 => {
                Some(first.descriptor().clone())
            }
            Orientation::Sdat => Some(Rc::new(GenotypeArrayDescriptor::new(
                first.descriptor().models().cloned().collect(),
            ))),
            Orientation::Ldat => None,
        };
        let row_bytes = first.descriptor().byte_size().max(1);
        let chunk_rows = (self.config.scratch / row_bytes).clamp(MIN_CHUNK_ROWS, MAX_CHUNK_ROWS);
        let out = ContainerWriter::create(&self.path, &self.header())?;
        debug!(
            path = %self.path.display(),
            orientation = %self.orientation,
            columns = self.columns.len(),
            chunk_rows,
            "opened matrix writer"
        );
        Ok(OpenMatrix::new(out, descriptor, chunk_rows))
    }

    fn finish(&self, mut open: OpenMatrix) -> Result<()> {
        open.flush_chunk()?;
        let (loci, models): (&[String], Vec<Model>) = match self.orientation {
            Orientation::Ldat => (open.labels.as_slice(), open.row_models.clone()),
            Orientation::Sdat => (
                self.columns.as_slice(),
                open.descriptor
                    .as_ref()
                    .map(|d| d.models().cloned().collect())
                    .unwrap_or_default(),
            ),
        };
        let table = ModelTable::build(loci, &self.genome, &models)?;

        let rows = encode_strings(&open.labels);
        let chunks = encode_chunks(&open.chunks);
        open.out.write_table("rows", &rows)?;
        open.out.write_table("cols", &encode_strings(&self.columns))?;
        open.out.write_table("chunks", &chunks)?;
        table.save(&mut open.out)?;
        debug!(
            path = %self.path.display(),
            rows = open.labels.len(),
            chunks = open.chunks.len(),
            models = table.models.len(),
            "closed matrix writer"
        );
        open.out.finish()
    }
}

impl OpenMatrix {
    fn new(
        out: ContainerWriter,
        descriptor: Option<Rc<GenotypeArrayDescriptor>>,
        chunk_rows: usize,
    ) -> Self {
        Self {
            out,
            labels: Vec::new(),
            row_models: Vec::new(),
            descriptor,
            chunk: Vec::new(),
            chunk_len: 0,
            chunk_rows,
            chunks: Vec::new(),
        }
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.chunk_len == 0 {
            return Ok(());
        }
        let block = self.out.write_block(&self.chunk)?;
        self.chunks.push(ChunkRecord {
            block,
            n_records: self.chunk_len,
        });
        debug!(rows = self.chunk_len, bytes = self.chunk.len(), "flushed chunk");
        self.chunk.clear();
        self.chunk_len = 0;
        Ok(())
    }
}

impl Drop for MatrixWriter {
    fn drop(&mut self) {
        if !matches!(self.state, WriterState::Closed)
            && let Err(e) = self.close()
        {
            warn!(path = %self.path.display(), error = %e, "could not close matrix writer");
        }
    }
}

/// Writes a whole matrix in one call.
pub fn save_matrix<I, S>(
    path: impl AsRef<Path>,
    orientation: Orientation,
    columns: Vec<String>,
    genome: Genome,
    rows: I,
    config: WriterConfig,
) -> Result<()>
where
    I: IntoIterator<Item = (S, GenotypeArray)>,
    S: AsRef<str>,
{
    let mut writer = MatrixWriter::new(path, orientation, columns, genome, config);
    writer.write_rows(rows)?;
    writer.close()
}
