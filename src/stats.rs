use crate::error::{CustomError, Result};
use crate::genoarray::GenotypeArray;
use crate::model::{Allele, Genotype, Model};

/// Count of each genotype of `model`, indexed by genotype index.
///
/// Genotypes bound to other models are matched by alleles.
pub fn count_genotypes<'a, I>(model: &Model, genos: I) -> Result<Vec<u64>>
where
    I: IntoIterator<Item = &'a Genotype>,
{
    let mut counts = vec![0u64; model.n_genotypes()];
    for geno in genos {
        let index = if geno.model().ptr_eq(model) {
            geno.index()
        } else {
            model.get_genotype(geno.alleles())?.index()
        };
        counts[index as usize] += 1;
    }
    Ok(counts)
}

/// Count of each allele of `model` (missing first) from genotype counts.
pub fn count_alleles(model: &Model, genocounts: &[u64]) -> Result<Vec<u64>> {
    let genotypes = model.genotypes();
    if genotypes.len() != genocounts.len() {
        return Err(CustomError::LengthMismatch {
            expected: genotypes.len(),
            found: genocounts.len(),
        });
    }
    let mut counts = vec![0u64; model.n_alleles()];
    for (geno, &n) in genotypes.iter().zip(genocounts) {
        let (i1, i2) = geno.allele_indices();
        counts[i1 as usize] += n;
        counts[i2 as usize] += n;
    }
    Ok(counts)
}

/// Least frequent allele and its frequency among non-missing alleles.
///
/// Models with fewer than two named alleles have no minor allele.
pub fn minor_allele(model: &Model, allelecounts: &[u64]) -> Result<(Option<Allele>, f64)> {
    let n = allelecounts.len();
    if n != model.n_alleles() {
        return Err(CustomError::LengthMismatch {
            expected: model.n_alleles(),
            found: n,
        });
    }
    if n > 3 {
        return Err(CustomError::NotBiallelic { n_alleles: n - 1 });
    }
    if n < 3 {
        return Ok((None, 0.0));
    }

    let informative = &allelecounts[1..];
    let total: u64 = informative.iter().sum();
    if total == 0 {
        return Ok((None, 0.0));
    }
    let Some((i, &f)) = informative.iter().enumerate().min_by_key(|&(i, &c)| (c, i)) else {
        return Ok((None, 0.0));
    };
    let alleles = model.alleles();
    Ok((Some(alleles[i + 1].clone()), f as f64 / total as f64))
}

/// Proportion of non-missing genotypes; 0 when nothing was observed.
pub fn completion_rate(genocounts: &[u64]) -> f64 {
    let n: u64 = genocounts.iter().sum();
    if n == 0 {
        return 0.0;
    }
    1.0 - genocounts[0] as f64 / n as f64
}

/// Proportion of missing genotypes; 1 when nothing was observed.
pub fn missing_rate(genocounts: &[u64]) -> f64 {
    let n: u64 = genocounts.iter().sum();
    if n == 0 {
        return 1.0;
    }
    genocounts[0] as f64 / n as f64
}

/// `(concordant, comparisons)` over positions where both calls are present.
pub fn concordance(a: &GenotypeArray, b: &GenotypeArray) -> Result<(usize, usize)> {
    if a.len() != b.len() {
        return Err(CustomError::LengthMismatch {
            expected: a.len(),
            found: b.len(),
        });
    }
    let mut concordant = 0;
    let mut comparisons = 0;
    for i in 0..a.len() {
        let (ga, gb) = (a.get(i)?, b.get(i)?);
        if ga.is_missing() || gb.is_missing() {
            continue;
        }
        if ga == gb || ga.alleles() == gb.alleles() {
            concordant += 1;
        }
        comparisons += 1;
    }
    Ok((concordant, comparisons))
}
