use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use crate::error::{CustomError, Result};

thread_local! {
    static ALLELE_POOL: RefCell<HashSet<Rc<str>>> = RefCell::new(HashSet::new());
}

/// An allele symbol, or the missing allele.
///
/// Symbols are interned per thread: equal alleles share one allocation, so
/// comparing them is a pointer check. Missing sorts before every named
/// allele, so canonical genotype pairs always carry the missing allele first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Allele(Option<Rc<str>>);

impl Allele {
    pub fn missing() -> Self {
        Self(None)
    }

    pub fn is_missing(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl From<&str> for Allele {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            return Self(None);
        }
        ALLELE_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            if let Some(symbol) = pool.get(s) {
                return Self(Some(symbol.clone()));
            }
            let symbol: Rc<str> = Rc::from(s);
            pool.insert(symbol.clone());
            Self(Some(symbol))
        })
    }
}

impl From<String> for Allele {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<Option<&str>> for Allele {
    fn from(s: Option<&str>) -> Self {
        s.map_or(Self(None), Self::from)
    }
}

impl From<&Allele> for Allele {
    fn from(a: &Allele) -> Self {
        a.clone()
    }
}

impl fmt::Display for Allele {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("?"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenotypeClass {
    Missing,
    Hemizygous,
    Homozygous,
    Heterozygous,
}

impl GenotypeClass {
    fn of(a1: &Allele, a2: &Allele) -> Self {
        match (a1.is_missing(), a2.is_missing()) {
            (true, true) => GenotypeClass::Missing,
            (true, false) | (false, true) => GenotypeClass::Hemizygous,
            _ if a1 == a2 => GenotypeClass::Homozygous,
            _ => GenotypeClass::Heterozygous,
        }
    }
}

/// Bits needed to store every genotype over `n` alleles.
pub fn genotype_bit_width(n: usize, allow_hemizygote: bool) -> u8 {
    let n = n as u64;
    let m = if allow_hemizygote {
        (n + 1) * (n + 2) / 2
    } else {
        n * (n + 1) / 2 + 1
    };
    if m <= 1 {
        0
    } else {
        (u64::BITS - (m - 1).leading_zeros()) as u8
    }
}

#[derive(Debug, Clone, Copy)]
struct GenotypeEntry {
    alleles: (u16, u16),
    class: GenotypeClass,
}

#[derive(Debug)]
struct ModelState {
    // Index 0 is always the missing allele.
    alleles: Vec<Allele>,
    allele_index: HashMap<Allele, u16>,
    genotypes: Vec<GenotypeEntry>,
    genomap: HashMap<(u16, u16), u32>,
}

#[derive(Debug)]
struct ModelInner {
    max_alleles: u16,
    allow_hemizygote: bool,
    bit_width: u8,
    state: RefCell<ModelState>,
}

/// Shared handle to the genotype space of one locus.
///
/// Cloning a `Model` clones the handle; all clones see genotypes added
/// through any of them. The bit width is fixed when the model is built.
#[derive(Clone)]
pub struct Model {
    inner: Rc<ModelInner>,
}

/// Structural identity of a model, used to collapse equal definitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ModelKey {
    pub max_alleles: u16,
    pub allow_hemizygote: bool,
    pub genotypes: Vec<(Allele, Allele)>,
}

impl Model {
    pub fn new(allow_hemizygote: bool, max_alleles: u16) -> Self {
        let max_alleles = max_alleles.max(2);
        let missing = Allele::missing();
        let state = ModelState {
            alleles: vec![missing.clone()],
            allele_index: HashMap::from([(missing, 0)]),
            genotypes: vec![GenotypeEntry {
                alleles: (0, 0),
                class: GenotypeClass::Missing,
            }],
            genomap: HashMap::from([((0, 0), 0)]),
        };
        Self {
            inner: Rc::new(ModelInner {
                max_alleles,
                allow_hemizygote,
                bit_width: genotype_bit_width(max_alleles as usize, allow_hemizygote),
                state: RefCell::new(state),
            }),
        }
    }

    pub fn max_alleles(&self) -> u16 {
        self.inner.max_alleles
    }

    pub fn allow_hemizygote(&self) -> bool {
        self.inner.allow_hemizygote
    }

    pub fn bit_width(&self) -> u8 {
        self.inner.bit_width
    }

    /// All alleles, starting with the missing allele.
    pub fn alleles(&self) -> Vec<Allele> {
        self.inner.state.borrow().alleles.clone()
    }

    pub fn n_alleles(&self) -> usize {
        self.inner.state.borrow().alleles.len()
    }

    pub fn n_genotypes(&self) -> usize {
        self.inner.state.borrow().genotypes.len()
    }

    pub fn get_allele(&self, allele: &Allele) -> Option<u16> {
        self.inner.state.borrow().allele_index.get(allele).copied()
    }

    pub fn add_allele(&self, allele: impl Into<Allele>) -> Result<u16> {
        let allele = allele.into();
        if let Some(idx) = self.get_allele(&allele) {
            return Ok(idx);
        }
        self.check_capacity(&[&allele])?;
        Ok(self.inner.state.borrow_mut().intern(allele))
    }

    /// Returns the genotype for an allele pair, adding it (and any new
    /// alleles) when the model has room.
    pub fn add_genotype<A, B>(&self, pair: (A, B)) -> Result<Genotype>
    where
        A: Into<Allele>,
        B: Into<Allele>,
    {
        let (a1, a2) = canonical(pair.0.into(), pair.1.into());
        if let Some(index) = self.lookup(&a1, &a2) {
            return Ok(self.genotype_unchecked(index));
        }

        let class = GenotypeClass::of(&a1, &a2);
        if class == GenotypeClass::Hemizygous && !self.inner.allow_hemizygote {
            return Err(CustomError::InvalidHemizygote {
                genotype: format!("{a1}/{a2}"),
            });
        }

        let mut new_alleles: Vec<&Allele> = Vec::with_capacity(2);
        for a in [&a1, &a2] {
            if self.get_allele(a).is_none() && !new_alleles.contains(&a) {
                new_alleles.push(a);
            }
        }
        self.check_capacity(&new_alleles)?;

        let mut state = self.inner.state.borrow_mut();
        let i1 = state.intern(a1);
        let i2 = state.intern(a2);
        let index = state.genotypes.len() as u32;
        state.genotypes.push(GenotypeEntry {
            alleles: (i1, i2),
            class,
        });
        state.genomap.insert((i1, i2), index);
        drop(state);
        Ok(self.genotype_unchecked(index))
    }

    /// Looks up an existing genotype without growing the model.
    pub fn get_genotype<A, B>(&self, pair: (A, B)) -> Result<Genotype>
    where
        A: Into<Allele>,
        B: Into<Allele>,
    {
        let (a1, a2) = canonical(pair.0.into(), pair.1.into());
        self.lookup(&a1, &a2)
            .map(|index| self.genotype_unchecked(index))
            .ok_or_else(|| CustomError::UnknownGenotype {
                genotype: format!("{a1}/{a2}"),
            })
    }

    pub fn genotype(&self, index: u32) -> Option<Genotype> {
        ((index as usize) < self.n_genotypes()).then(|| self.genotype_unchecked(index))
    }

    pub fn genotypes(&self) -> Vec<Genotype> {
        (0..self.n_genotypes() as u32)
            .map(|index| self.genotype_unchecked(index))
            .collect()
    }

    /// Whether both handles refer to the same model instance.
    pub fn ptr_eq(&self, other: &Model) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Address-based identity, stable for the lifetime of the model.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn key(&self) -> ModelKey {
        let state = self.inner.state.borrow();
        let genotypes = state.genotypes[1..]
            .iter()
            .map(|g| {
                (
                    state.alleles[g.alleles.0 as usize].clone(),
                    state.alleles[g.alleles.1 as usize].clone(),
                )
            })
            .collect();
        ModelKey {
            max_alleles: self.inner.max_alleles,
            allow_hemizygote: self.inner.allow_hemizygote,
            genotypes,
        }
    }

    fn lookup(&self, a1: &Allele, a2: &Allele) -> Option<u32> {
        let state = self.inner.state.borrow();
        let i1 = *state.allele_index.get(a1)?;
        let i2 = *state.allele_index.get(a2)?;
        state.genomap.get(&(i1, i2)).copied()
    }

    fn check_capacity(&self, new_alleles: &[&Allele]) -> Result<()> {
        let named = self.n_alleles() - 1;
        let mut needed = named;
        for allele in new_alleles.iter().filter(|a| !a.is_missing()) {
            needed += 1;
            if genotype_bit_width(needed, self.inner.allow_hemizygote) > self.inner.bit_width {
                return Err(CustomError::CapacityExceeded {
                    allele: allele.to_string(),
                    max_alleles: self.inner.max_alleles,
                    bit_width: self.inner.bit_width,
                });
            }
        }
        Ok(())
    }

    fn genotype_unchecked(&self, index: u32) -> Genotype {
        Genotype {
            model: self.clone(),
            index,
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Model")
            .field("max_alleles", &self.inner.max_alleles)
            .field("allow_hemizygote", &self.inner.allow_hemizygote)
            .field("bit_width", &self.inner.bit_width)
            .field("alleles", &state.alleles)
            .field("n_genotypes", &state.genotypes.len())
            .finish()
    }
}

impl ModelState {
    fn intern(&mut self, allele: Allele) -> u16 {
        if let Some(&idx) = self.allele_index.get(&allele) {
            return idx;
        }
        let idx = self.alleles.len() as u16;
        self.alleles.push(allele.clone());
        self.allele_index.insert(allele, idx);
        idx
    }
}

fn canonical(a1: Allele, a2: Allele) -> (Allele, Allele) {
    if a2 < a1 { (a2, a1) } else { (a1, a2) }
}

/// One genotype of a model, identified by its dense index.
#[derive(Clone)]
pub struct Genotype {
    model: Model,
    index: u32,
}

impl Genotype {
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn entry(&self) -> GenotypeEntry {
        self.model.inner.state.borrow().genotypes[self.index as usize]
    }

    pub fn allele_indices(&self) -> (u16, u16) {
        self.entry().alleles
    }

    pub fn alleles(&self) -> (Allele, Allele) {
        let (i1, i2) = self.entry().alleles;
        let state = self.model.inner.state.borrow();
        (
            state.alleles[i1 as usize].clone(),
            state.alleles[i2 as usize].clone(),
        )
    }

    pub fn class(&self) -> GenotypeClass {
        self.entry().class
    }

    pub fn is_missing(&self) -> bool {
        self.index == 0
    }

    pub fn is_hemizygous(&self) -> bool {
        self.class() == GenotypeClass::Hemizygous
    }

    pub fn is_homozygous(&self) -> bool {
        self.class() == GenotypeClass::Homozygous
    }

    pub fn is_heterozygous(&self) -> bool {
        self.class() == GenotypeClass::Heterozygous
    }
}

impl PartialEq for Genotype {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.model.ptr_eq(&other.model)
    }
}

impl Eq for Genotype {}

impl fmt::Debug for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Genotype({}, #{})", self, self.index)
    }
}

impl fmt::Display for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (a1, a2) = self.alleles();
        write!(f, "{a1}/{a2}")
    }
}

/// Builds a model holding every genotype over the given alleles.
///
/// Alleles are sorted and deduplicated first. With hemizygotes allowed the
/// single-allele genotypes come before the diploid ones.
pub fn model_from_alleles<I, A>(
    alleles: I,
    allow_hemizygote: bool,
    max_alleles: Option<u16>,
) -> Result<Model>
where
    I: IntoIterator<Item = A>,
    A: Into<Allele>,
{
    let mut alleles: Vec<Allele> = alleles
        .into_iter()
        .map(Into::into)
        .filter(|a| !a.is_missing())
        .collect();
    alleles.sort();
    alleles.dedup();

    let model = Model::new(
        allow_hemizygote,
        max_alleles.unwrap_or(alleles.len() as u16),
    );
    if allow_hemizygote {
        alleles.insert(0, Allele::missing());
    }
    for (i, a1) in alleles.iter().enumerate() {
        for a2 in &alleles[i..] {
            model.add_genotype((a1, a2))?;
        }
    }
    Ok(model)
}

/// Builds a model from observed genotypes, allowing hemizygotes only when
/// one was observed.
pub fn model_from_genotypes<I, A, B>(genotypes: I, max_alleles: Option<u16>) -> Result<Model>
where
    I: IntoIterator<Item = (A, B)>,
    A: Into<Allele>,
    B: Into<Allele>,
{
    let pairs: Vec<(Allele, Allele)> = genotypes
        .into_iter()
        .map(|(a, b)| canonical(a.into(), b.into()))
        .collect();
    let hemizygous = pairs
        .iter()
        .any(|(a1, a2)| GenotypeClass::of(a1, a2) == GenotypeClass::Hemizygous);

    let mut alleles: Vec<&Allele> = pairs
        .iter()
        .flat_map(|(a1, a2)| [a1, a2])
        .filter(|a| !a.is_missing())
        .collect();
    alleles.sort();
    alleles.dedup();

    let n = alleles.len() as u16;
    let max_alleles = match max_alleles {
        Some(max) if n > max => {
            return Err(CustomError::CapacityExceeded {
                allele: alleles[max as usize].to_string(),
                max_alleles: max,
                bit_width: genotype_bit_width(max as usize, hemizygous),
            });
        }
        Some(max) => max,
        None => n,
    };

    let model = Model::new(hemizygous, max_alleles);
    let mut alleles: Vec<Allele> = alleles.into_iter().cloned().collect();
    for allele in &alleles {
        model.add_allele(allele)?;
    }
    for (a1, a2) in &pairs {
        model.add_genotype((a1, a2))?;
    }

    // complete the model over every allele seen
    if hemizygous {
        alleles.insert(0, Allele::missing());
    }
    for (i, a1) in alleles.iter().enumerate() {
        for a2 in &alleles[i..] {
            model.add_genotype((a1, a2))?;
        }
    }
    Ok(model)
}
