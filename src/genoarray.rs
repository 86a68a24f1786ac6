use std::ops::Range;
use std::rc::Rc;

use crate::error::{CustomError, Result};
use crate::model::{Allele, Genotype, Model};

/// Reads `width` bits starting at bit `start`.
///
/// Bits are little-endian within the byte: buffer bit `b` is bit `b % 8` of
/// byte `b / 8`, and value bit `k` lives at buffer bit `start + k`.
pub fn get_bits(data: &[u8], start: usize, width: u8) -> u32 {
    let mut value = 0u32;
    let mut done = 0usize;
    let mut bit = start;
    while done < width as usize {
        let shift = bit % 8;
        let take = (8 - shift).min(width as usize - done);
        let mask = ((1u16 << take) - 1) as u8;
        let chunk = (data[bit / 8] >> shift) & mask;
        value |= (chunk as u32) << done;
        done += take;
        bit += take;
    }
    value
}

/// Writes the low `width` bits of `value` starting at bit `start`.
pub fn set_bits(data: &mut [u8], start: usize, width: u8, value: u32) {
    let mut done = 0usize;
    let mut bit = start;
    while done < width as usize {
        let shift = bit % 8;
        let take = (8 - shift).min(width as usize - done);
        let mask = ((1u16 << take) - 1) as u8;
        let chunk = ((value >> done) as u8) & mask;
        let byte = &mut data[bit / 8];
        *byte = (*byte & !(mask << shift)) | (chunk << shift);
        done += take;
        bit += take;
    }
}

#[derive(Debug, Clone)]
enum ModelSeq {
    Repeated(Model, usize),
    Each(Vec<Model>),
}

/// Bit layout of a row: one model per position plus cumulative offsets.
///
/// When every model has the same width the offsets are implicit and
/// position `i` starts at `initial_offset + i * width`.
#[derive(Debug, Clone)]
pub struct GenotypeArrayDescriptor {
    models: ModelSeq,
    initial_offset: usize,
    offsets: Option<Vec<usize>>,
    width: Option<u8>,
    bit_size: usize,
}

impl GenotypeArrayDescriptor {
    pub fn new(models: Vec<Model>) -> Self {
        Self::with_offset(models, 0)
    }

    pub fn with_offset(models: Vec<Model>, initial_offset: usize) -> Self {
        let width = match models.first() {
            Some(first) if models.iter().all(|m| m.bit_width() == first.bit_width()) => {
                Some(first.bit_width())
            }
            Some(_) => None,
            None => Some(0),
        };

        let (offsets, bit_size) = match width {
            Some(w) => (None, initial_offset + models.len() * w as usize),
            None => {
                let mut offsets = Vec::with_capacity(models.len() + 1);
                let mut end = initial_offset;
                offsets.push(end);
                for model in &models {
                    end += model.bit_width() as usize;
                    offsets.push(end);
                }
                (Some(offsets), end)
            }
        };

        Self {
            models: ModelSeq::Each(models),
            initial_offset,
            offsets,
            width,
            bit_size,
        }
    }

    /// The same model at each of `n` positions.
    pub fn repeated(model: Model, n: usize, initial_offset: usize) -> Self {
        let width = model.bit_width();
        Self {
            models: ModelSeq::Repeated(model, n),
            initial_offset,
            offsets: None,
            width: Some(width),
            bit_size: initial_offset + n * width as usize,
        }
    }

    pub fn len(&self) -> usize {
        match &self.models {
            ModelSeq::Repeated(_, n) => *n,
            ModelSeq::Each(models) => models.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn model(&self, i: usize) -> &Model {
        match &self.models {
            ModelSeq::Repeated(model, n) => {
                assert!(i < *n, "position {i} out of range for {n} model(s)");
                model
            }
            ModelSeq::Each(models) => &models[i],
        }
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> + '_ {
        (0..self.len()).map(move |i| self.model(i))
    }

    /// Bit offset of position `i`; `offset(len())` is the end of the row.
    pub fn offset(&self, i: usize) -> usize {
        match (&self.offsets, self.width) {
            (Some(offsets), _) => offsets[i],
            (None, Some(w)) => self.initial_offset + i * w as usize,
            (None, None) => unreachable!("descriptor without offsets or width"),
        }
    }

    pub fn initial_offset(&self) -> usize {
        self.initial_offset
    }

    pub fn bit_size(&self) -> usize {
        self.bit_size
    }

    pub fn byte_size(&self) -> usize {
        self.bit_size.div_ceil(8)
    }

    /// Shared bit width when all positions use the same width.
    pub fn homogeneous(&self) -> Option<u8> {
        self.width
    }

    /// The single model used at every position, if there is one.
    pub fn uniform_model(&self) -> Option<&Model> {
        match &self.models {
            ModelSeq::Repeated(model, n) if *n > 0 => Some(model),
            ModelSeq::Repeated(..) => None,
            ModelSeq::Each(models) => {
                let first = models.first()?;
                models.iter().all(|m| m.ptr_eq(first)).then_some(first)
            }
        }
    }

    /// Whether both descriptors place the same model instances at the same bits.
    pub fn same_layout(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.initial_offset == other.initial_offset
            && self.models().zip(other.models()).all(|(a, b)| a.ptr_eq(b))
    }

    /// Largest `end` such that positions `start..end` span at most
    /// `max_bits`, but always at least one position.
    pub fn span_end(&self, start: usize, max_bits: usize) -> usize {
        let n = self.len();
        if start >= n {
            return n;
        }
        let end = match (&self.offsets, self.width) {
            (None, Some(0)) => n,
            (None, Some(w)) => start.saturating_add(max_bits / w as usize).min(n),
            (Some(offsets), _) => {
                let limit = offsets[start] + max_bits;
                start + offsets[start + 1..=n].partition_point(|&o| o <= limit)
            }
            (None, None) => unreachable!("descriptor without offsets or width"),
        };
        end.max(start + 1)
    }

    /// Layout of positions `range`, with the first one starting at bit
    /// `initial_offset` of a fresh buffer.
    pub fn slice(&self, range: Range<usize>, initial_offset: usize) -> Self {
        match &self.models {
            ModelSeq::Repeated(model, _) => {
                Self::repeated(model.clone(), range.len(), initial_offset)
            }
            ModelSeq::Each(models) => Self::with_offset(models[range].to_vec(), initial_offset),
        }
    }
}

/// Anything that can be stored at a position with a given model.
pub trait IntoGenotype {
    fn into_genotype(self, model: &Model) -> Result<Genotype>;
}

impl IntoGenotype for Genotype {
    fn into_genotype(self, model: &Model) -> Result<Genotype> {
        if self.model().ptr_eq(model) {
            Ok(self)
        } else {
            model.add_genotype(self.alleles())
        }
    }
}

impl IntoGenotype for &Genotype {
    fn into_genotype(self, model: &Model) -> Result<Genotype> {
        if self.model().ptr_eq(model) {
            Ok(self.clone())
        } else {
            model.add_genotype(self.alleles())
        }
    }
}

impl<A, B> IntoGenotype for (A, B)
where
    A: Into<Allele>,
    B: Into<Allele>,
{
    fn into_genotype(self, model: &Model) -> Result<Genotype> {
        model.add_genotype(self)
    }
}

/// Packed genotypes laid out by a shared descriptor.
#[derive(Debug, Clone)]
pub struct GenotypeArray {
    descriptor: Rc<GenotypeArrayDescriptor>,
    data: Vec<u8>,
}

impl GenotypeArray {
    /// An array with every position missing.
    pub fn new(descriptor: Rc<GenotypeArrayDescriptor>) -> Self {
        let data = vec![0u8; descriptor.byte_size()];
        Self { descriptor, data }
    }

    pub fn from_genotypes<I, G>(descriptor: Rc<GenotypeArrayDescriptor>, genos: I) -> Result<Self>
    where
        I: IntoIterator<Item = G>,
        G: IntoGenotype,
    {
        let mut array = Self::new(descriptor);
        let n = array.len();
        array.set_range(0..n, genos)?;
        Ok(array)
    }

    pub fn from_bytes(descriptor: Rc<GenotypeArrayDescriptor>, data: Vec<u8>) -> Result<Self> {
        if data.len() != descriptor.byte_size() {
            return Err(CustomError::LengthMismatch {
                expected: descriptor.byte_size(),
                found: data.len(),
            });
        }
        Ok(Self { descriptor, data })
    }

    pub fn descriptor(&self) -> &Rc<GenotypeArrayDescriptor> {
        &self.descriptor
    }

    pub fn len(&self) -> usize {
        self.descriptor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Raw genotype index at position `i`.
    pub fn get_index(&self, i: usize) -> u32 {
        let width = self.descriptor.model(i).bit_width();
        get_bits(&self.data, self.descriptor.offset(i), width)
    }

    pub(crate) fn set_index(&mut self, i: usize, index: u32) {
        let width = self.descriptor.model(i).bit_width();
        set_bits(&mut self.data, self.descriptor.offset(i), width, index);
    }

    pub fn get(&self, i: usize) -> Result<Genotype> {
        let index = self.get_index(i);
        let model = self.descriptor.model(i);
        model.genotype(index).ok_or_else(|| CustomError::GenotypeIndex {
            index,
            n_genotypes: model.n_genotypes(),
        })
    }

    pub fn set(&mut self, i: usize, geno: impl IntoGenotype) -> Result<()> {
        let geno = geno.into_genotype(self.descriptor.model(i))?;
        self.set_index(i, geno.index());
        Ok(())
    }

    pub fn get_range(&self, range: Range<usize>) -> Result<Vec<Genotype>> {
        range.map(|i| self.get(i)).collect()
    }

    /// Replaces positions `range`; nothing is written unless every
    /// genotype resolves and the count matches.
    pub fn set_range<I, G>(&mut self, range: Range<usize>, genos: I) -> Result<()>
    where
        I: IntoIterator<Item = G>,
        G: IntoGenotype,
    {
        let mut indices = Vec::with_capacity(range.len());
        for (k, geno) in genos.into_iter().enumerate() {
            let i = range.start + k;
            if i >= range.end {
                return Err(CustomError::LengthMismatch {
                    expected: range.len(),
                    found: k + 1,
                });
            }
            indices.push(geno.into_genotype(self.descriptor.model(i))?.index());
        }
        if indices.len() != range.len() {
            return Err(CustomError::LengthMismatch {
                expected: range.len(),
                found: indices.len(),
            });
        }
        for (i, index) in range.zip(indices) {
            self.set_index(i, index);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Genotype>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    pub fn to_vec(&self) -> Result<Vec<Genotype>> {
        self.iter().collect()
    }

    /// The same calls expressed under another layout.
    pub fn recoded(&self, descriptor: Rc<GenotypeArrayDescriptor>) -> Result<Self> {
        if descriptor.len() != self.len() {
            return Err(CustomError::LengthMismatch {
                expected: descriptor.len(),
                found: self.len(),
            });
        }
        let mut out = Self::new(descriptor);
        for i in 0..self.len() {
            out.set(i, self.get(i)?)?;
        }
        Ok(out)
    }
}
