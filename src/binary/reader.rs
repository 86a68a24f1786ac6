use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;

use itertools::Itertools;
use ndarray::Array2;
use tracing::{debug, trace};

use crate::binary::container::{ChunkRecord, Container, Header, decode_chunks, decode_strings};
use crate::binary::models::ModelTable;
use crate::binary::{DEFAULT_READ_SCRATCH, GENOMATRIX_FORMAT, Orientation, effective_version};
use crate::error::{CustomError, Result, SchemaError};
use crate::genoarray::{GenotypeArray, GenotypeArrayDescriptor};
use crate::locus::{Genome, Locus};
use crate::model::Model;

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Orientation of the produced rows; the stored one when `None`.
    pub orientation: Option<Orientation>,
    /// Registry to recode loaded models into.
    pub genome: Option<Genome>,
    /// Reject files with repeated row or column labels.
    pub unique: bool,
    /// Bytes of packed genotypes decoded per transposition window.
    pub scratch: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            orientation: None,
            genome: None,
            unique: true,
            scratch: DEFAULT_READ_SCRATCH,
        }
    }
}

/// Where a stored row lives inside the inflated chunks.
#[derive(Debug, Clone, Copy)]
struct RowSpan {
    chunk: usize,
    start: usize,
    len: usize,
}

/// An open matrix file. Labels and models are loaded eagerly; genotype
/// chunks are read on demand by [`MatrixReader::rows`].
pub struct MatrixReader {
    container: Container,
    version: u32,
    stored: Orientation,
    output: Orientation,
    rows: Vec<String>,
    columns: Vec<String>,
    chunks: Vec<ChunkRecord>,
    spans: Vec<RowSpan>,
    file_models: Vec<Model>,
    models: Vec<Model>,
    genome: Genome,
    scratch: usize,
}

impl MatrixReader {
    pub fn open(path: impl AsRef<Path>, config: ReaderConfig) -> Result<Self> {
        let container = Container::open(path)?;
        let version = effective_version(container.header(), GENOMATRIX_FORMAT)?;
        let stored: Orientation = container.header().layout.parse()?;

        let rows = decode_strings("rows", &container.table("rows")?)?;
        let columns = decode_strings("cols", &container.table("cols")?)?;
        if config.unique {
            check_unique("row", &rows)?;
            check_unique("column", &columns)?;
        }

        let loci = match stored {
            Orientation::Ldat => &rows,
            Orientation::Sdat => &columns,
        };
        let table = ModelTable::load(&container, version)?;
        let (file_models, file_genome) = table.reconstruct(loci)?;

        let chunks = decode_chunks(&container.table("chunks")?)?;
        let spans = layout_rows(stored, &chunks, &file_models, rows.len(), columns.len())?;

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

        debug!(
            path = %container.path().display(),
            version,
            orientation = %stored,
            rows = rows.len(),
            columns = columns.len(),
            chunks = chunks.len(),
            models = table.models.len(),
            "opened matrix"
        );
        Ok(Self {
            container,
            version,
            stored,
            output: config.orientation.unwrap_or(stored),
            rows,
            columns,
            chunks,
            spans,
            file_models,
            models,
            genome,
            scratch: config.scratch.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        self.container.path()
    }

    pub fn header(&self) -> &Header {
        self.container.header()
    }

    /// Format version the file is interpreted as.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn stored_orientation(&self) -> Orientation {
        self.stored
    }

    /// Orientation of the rows produced by [`MatrixReader::rows`].
    pub fn orientation(&self) -> Orientation {
        self.output
    }

    pub fn row_labels(&self) -> &[String] {
        if self.output == self.stored {
            &self.rows
        } else {
            &self.columns
        }
    }

    pub fn column_labels(&self) -> &[String] {
        if self.output == self.stored {
            &self.columns
        } else {
            &self.rows
        }
    }

    pub fn samples(&self) -> &[String] {
        match self.stored {
            Orientation::Ldat => &self.columns,
            Orientation::Sdat => &self.rows,
        }
    }

    pub fn loci(&self) -> &[String] {
        match self.stored {
            Orientation::Ldat => &self.rows,
            Orientation::Sdat => &self.columns,
        }
    }

    /// Model of each locus, in locus order.
    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    pub fn n_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Number of distinct model instances across all loci.
    pub fn n_distinct_models(&self) -> usize {
        self.models.iter().map(Model::id).collect::<HashSet<_>>().len()
    }

    /// Consumes the reader and streams its rows.
    pub fn rows(self) -> MatrixRows {
        let file_sdat = Rc::new(GenotypeArrayDescriptor::new(self.file_models.clone()));
        let recode = self
            .models
            .iter()
            .zip(&self.file_models)
            .any(|(target, file)| !target.ptr_eq(file));
        let target_sdat = if recode {
            Rc::new(GenotypeArrayDescriptor::new(self.models.clone()))
        } else {
            file_sdat.clone()
        };
        let max_width = self.file_models.iter().map(Model::bit_width).max().unwrap_or(0);
        let labels = if self.output == self.stored {
            self.rows
        } else {
            self.columns.clone()
        };

        let stream = RowStream {
            container: self.container,
            cursor: ChunkCursor::new(self.chunks),
            spans: self.spans,
            stored: self.stored,
            output: self.output,
            labels,
            n_columns: self.columns.len(),
            file_models: self.file_models,
            models: self.models,
            recode,
            file_sdat,
            target_sdat,
            ldat_descriptors: HashMap::new(),
            scratch: self.scratch,
            index_bytes: index_bytes(max_width),
            next: 0,
            window: None,
        };
        MatrixRows {
            state: RowsState::Streaming(Box::new(stream)),
        }
    }
}

pub(crate) fn check_unique(axis: &'static str, labels: &[String]) -> Result<()> {
    match labels.iter().duplicates().next() {
        Some(label) => Err(SchemaError::DuplicateLabel {
            axis,
            label: label.clone(),
        }
        .into()),
        None => Ok(()),
    }
}

/// Locates every stored row and checks the chunks against the labels.
fn layout_rows(
    stored: Orientation,
    chunks: &[ChunkRecord],
    file_models: &[Model],
    n_rows: usize,
    n_columns: usize,
) -> Result<Vec<RowSpan>> {
    let total = chunks
        .iter()
        .try_fold(0usize, |total, c| total.checked_add(c.n_records))
        .ok_or_else(|| CustomError::CorruptTable {
            table: "chunks".to_string(),
            reason: "record counts overflow".to_string(),
        })?;
    if total != n_rows {
        return Err(SchemaError::TableLength {
            table: "chunks",
            expected: n_rows,
            found: total,
        }
        .into());
    }

    let sdat_bytes = match stored {
        Orientation::Sdat => GenotypeArrayDescriptor::new(file_models.to_vec()).byte_size(),
        Orientation::Ldat => 0,
    };
    let row_bytes = |row: usize| match stored {
        Orientation::Sdat => sdat_bytes,
        Orientation::Ldat => (n_columns * file_models[row].bit_width() as usize).div_ceil(8),
    };

    let mut spans = Vec::with_capacity(n_rows);
    let mut row = 0;
    for (i, chunk) in chunks.iter().enumerate() {
        let mut start = 0;
        for _ in 0..chunk.n_records {
            let len = row_bytes(row);
            spans.push(RowSpan {
                chunk: i,
                start,
                len,
            });
            start += len;
            row += 1;
        }
        if start as u64 != chunk.block.raw_len {
            return Err(CustomError::CorruptTable {
                table: "chunks".to_string(),
                reason: format!(
                    "chunk {i} holds {} byte(s), rows need {start}",
                    chunk.block.raw_len
                ),
            });
        }
    }
    Ok(spans)
}

/// Columns per transposition window: the per-row share of `scratch`,
/// counted in decoded indices, and never less than one.
fn window_columns(scratch: usize, n_rows: usize, index_bytes: usize) -> usize {
    (scratch / n_rows.max(1) / index_bytes).max(1)
}

/// Keeps the most recently inflated chunk.
struct ChunkCursor {
    chunks: Vec<ChunkRecord>,
    loaded: Option<(usize, Vec<u8>)>,
}

impl ChunkCursor {
    fn new(chunks: Vec<ChunkRecord>) -> Self {
        Self {
            chunks,
            loaded: None,
        }
    }

    fn row(&mut self, container: &Container, span: RowSpan) -> Result<&[u8]> {
        if self.loaded.as_ref().map(|(i, _)| *i) != Some(span.chunk) {
            let data = container
                .block(&self.chunks[span.chunk].block, "chunks")?
                .into_owned();
            trace!(chunk = span.chunk, bytes = data.len(), "loaded chunk");
            self.loaded = Some((span.chunk, data));
        }
        match &self.loaded {
            Some((_, data)) => Ok(&data[span.start..span.start + span.len]),
            None => unreachable!("chunk was just loaded"),
        }
    }
}

/// Bytes per decoded genotype index for models up to `max_width` bits.
fn index_bytes(max_width: u8) -> usize {
    match max_width {
        0..=8 => 1,
        9..=16 => 2,
        _ => 4,
    }
}

/// Decoded genotype indices, held at the narrowest width that fits every
/// stored model.
enum WindowBlock {
    Narrow(Array2<u8>),
    Medium(Array2<u16>),
    Wide(Array2<u32>),
}

impl WindowBlock {
    fn zeros(index_bytes: usize, shape: (usize, usize)) -> Self {
        match index_bytes {
            1 => WindowBlock::Narrow(Array2::zeros(shape)),
            2 => WindowBlock::Medium(Array2::zeros(shape)),
            _ => WindowBlock::Wide(Array2::zeros(shape)),
        }
    }

    // callers have checked the index against the model
    fn set(&mut self, row: usize, column: usize, index: u32) {
        match self {
            WindowBlock::Narrow(block) => block[[row, column]] = index as u8,
            WindowBlock::Medium(block) => block[[row, column]] = index as u16,
            WindowBlock::Wide(block) => block[[row, column]] = index,
        }
    }

    fn column(&self, column: usize) -> Vec<u32> {
        match self {
            WindowBlock::Narrow(block) => {
                block.column(column).iter().map(|&i| u32::from(i)).collect()
            }
            WindowBlock::Medium(block) => {
                block.column(column).iter().map(|&i| u32::from(i)).collect()
            }
            WindowBlock::Wide(block) => block.column(column).to_vec(),
        }
    }

    fn bytes(&self) -> usize {
        match self {
            WindowBlock::Narrow(block) => block.len(),
            WindowBlock::Medium(block) => block.len() * 2,
            WindowBlock::Wide(block) => block.len() * 4,
        }
    }
}

/// Decoded genotype indices for stored columns `start..end` of every stored row.
struct Window {
    start: usize,
    end: usize,
    block: WindowBlock,
}

struct RowStream {
    container: Container,
    cursor: ChunkCursor,
    spans: Vec<RowSpan>,
    stored: Orientation,
    output: Orientation,
    labels: Vec<String>,
    n_columns: usize,
    file_models: Vec<Model>,
    models: Vec<Model>,
    recode: bool,
    file_sdat: Rc<GenotypeArrayDescriptor>,
    target_sdat: Rc<GenotypeArrayDescriptor>,
    // ldat rows always span every sample, so the model identifies the layout
    ldat_descriptors: HashMap<usize, Rc<GenotypeArrayDescriptor>>,
    scratch: usize,
    index_bytes: usize,
    next: usize,
    window: Option<Window>,
}

impl RowStream {
    fn next_row(&mut self) -> Result<Option<(String, GenotypeArray)>> {
        let k = self.next;
        if k >= self.labels.len() {
            return Ok(None);
        }
        let array = if self.output == self.stored {
            self.direct(k)?
        } else {
            self.transposed(k)?
        };
        self.next += 1;
        Ok(Some((self.labels[k].clone(), array)))
    }

    fn n_samples(&self) -> usize {
        match self.stored {
            Orientation::Ldat => self.n_columns,
            Orientation::Sdat => self.spans.len(),
        }
    }

    fn ldat_descriptor(&mut self, model: &Model) -> Rc<GenotypeArrayDescriptor> {
        let n = self.n_samples();
        self.ldat_descriptors
            .entry(model.id())
            .or_insert_with(|| Rc::new(GenotypeArrayDescriptor::repeated(model.clone(), n, 0)))
            .clone()
    }

    /// Output ldat row for locus `k`, recoded into its target model.
    fn finish_ldat(&mut self, k: usize, array: GenotypeArray) -> Result<GenotypeArray> {
        if self.models[k].ptr_eq(&self.file_models[k]) {
            return Ok(array);
        }
        let target = self.models[k].clone();
        array.recoded(self.ldat_descriptor(&target))
    }

    fn finish_sdat(&self, array: GenotypeArray) -> Result<GenotypeArray> {
        if self.recode {
            array.recoded(self.target_sdat.clone())
        } else {
            Ok(array)
        }
    }

    fn direct(&mut self, k: usize) -> Result<GenotypeArray> {
        let bytes = self.cursor.row(&self.container, self.spans[k])?.to_vec();
        match self.stored {
            Orientation::Sdat => {
                let array = GenotypeArray::from_bytes(self.file_sdat.clone(), bytes)?;
                self.finish_sdat(array)
            }
            Orientation::Ldat => {
                let model = self.file_models[k].clone();
                let array = GenotypeArray::from_bytes(self.ldat_descriptor(&model), bytes)?;
                self.finish_ldat(k, array)
            }
        }
    }

    fn transposed(&mut self, k: usize) -> Result<GenotypeArray> {
        let cached = self
            .window
            .as_ref()
            .is_some_and(|w| w.start <= k && k < w.end);
        if !cached {
            self.window = Some(self.load_window(k)?);
        }
        let column = match &self.window {
            Some(window) => window.block.column(k - window.start),
            None => unreachable!("window was just loaded"),
        };

        match self.stored {
            // stored sample rows, emitting the locus row `k`
            Orientation::Sdat => {
                let model = self.file_models[k].clone();
                let mut array = GenotypeArray::new(self.ldat_descriptor(&model));
                for (r, &index) in column.iter().enumerate() {
                    array.set_index(r, index);
                }
                self.finish_ldat(k, array)
            }
            // stored locus rows, emitting the sample row `k`
            Orientation::Ldat => {
                let mut array = GenotypeArray::new(self.file_sdat.clone());
                for (r, &index) in column.iter().enumerate() {
                    array.set_index(r, index);
                }
                self.finish_sdat(array)
            }
        }
    }

    /// Decodes the widest run of stored columns starting at `start` whose
    /// decoded indices fit the scratch budget.
    fn load_window(&mut self, start: usize) -> Result<Window> {
        let n_rows = self.spans.len();
        let columns = window_columns(self.scratch, n_rows, self.index_bytes);
        let end = (start + columns).min(self.n_columns);

        let mut block = WindowBlock::zeros(self.index_bytes, (n_rows, end - start));
        for r in 0..n_rows {
            let (sub, start_bit, end_bit) = match self.stored {
                Orientation::Sdat => {
                    let start_bit = self.file_sdat.offset(start);
                    let end_bit = self.file_sdat.offset(end);
                    let sub = self.file_sdat.slice(start..end, start_bit % 8);
                    (sub, start_bit, end_bit)
                }
                Orientation::Ldat => {
                    let model = &self.file_models[r];
                    let width = model.bit_width() as usize;
                    let (start_bit, end_bit) = (start * width, end * width);
                    let sub = GenotypeArrayDescriptor::repeated(
                        model.clone(),
                        end - start,
                        start_bit % 8,
                    );
                    (sub, start_bit, end_bit)
                }
            };

            let row = self.cursor.row(&self.container, self.spans[r])?;
            let bytes = row[start_bit / 8..end_bit.div_ceil(8)].to_vec();
            let view = GenotypeArray::from_bytes(Rc::new(sub), bytes)?;
            for c in 0..view.len() {
                let index = view.get_index(c);
                let n_genotypes = view.descriptor().model(c).n_genotypes();
                if index as usize >= n_genotypes {
                    return Err(CustomError::GenotypeIndex { index, n_genotypes });
                }
                block.set(r, c, index);
            }
        }
        trace!(
            start,
            end,
            rows = n_rows,
            bytes = block.bytes(),
            "decoded transposition window"
        );
        Ok(Window { start, end, block })
    }
}

enum RowsState {
    Streaming(Box<RowStream>),
    Closed,
}

/// Forward-only stream of `(label, row)` pairs.
///
/// The file stays mapped until the stream is exhausted, fails, is closed,
/// or is dropped.
pub struct MatrixRows {
    state: RowsState,
}

impl MatrixRows {
    /// Stops the stream early and releases the file.
    pub fn close(&mut self) {
        self.state = RowsState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, RowsState::Closed)
    }
}

impl Iterator for MatrixRows {
    type Item = Result<(String, GenotypeArray)>;

    fn next(&mut self) -> Option<Self::Item> {
        let RowsState::Streaming(stream) = &mut self.state else {
            return None;
        };
        match stream.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.state = RowsState::Closed;
                None
            }
            Err(e) => {
                self.state = RowsState::Closed;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.state {
            RowsState::Streaming(stream) => {
                let left = stream.labels.len() - stream.next;
                (0, Some(left))
            }
            RowsState::Closed => (0, Some(0)),
        }
    }
}
