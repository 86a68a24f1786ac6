#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use genopack::binary::{MatrixReader, ReaderConfig};
use genopack::genoarray::{GenotypeArray, GenotypeArrayDescriptor};
use genopack::locus::{Genome, Locus, Strand};
use genopack::model::{Model, model_from_alleles};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// A fresh directory for one test.
pub fn test_dir(label: &str) -> PathBuf {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join("genopack-tests").join(format!(
        "{}-{}-{}",
        std::process::id(),
        id,
        label
    ));
    if dir.exists() {
        fs::remove_dir_all(&dir).unwrap();
    }
    fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn names(prefix: &str, n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("{prefix}{i}")).collect()
}

/// A locus-major dataset: one model and one row of calls per locus.
pub struct Dataset {
    pub samples: Vec<String>,
    pub loci: Vec<String>,
    pub models: Vec<Model>,
    /// `calls[locus][sample]`, `None` for a missing call.
    pub calls: Vec<Vec<Option<(String, String)>>>,
    pub genome: Genome,
}

impl Dataset {
    pub fn ldat_rows(&self) -> Vec<(String, GenotypeArray)> {
        self.loci
            .iter()
            .zip(&self.models)
            .zip(&self.calls)
            .map(|((name, model), calls)| {
                let descriptor = Rc::new(GenotypeArrayDescriptor::repeated(
                    model.clone(),
                    self.samples.len(),
                    0,
                ));
                let genos: Vec<(String, String)> = calls
                    .iter()
                    .map(|c| c.clone().unwrap_or_default())
                    .collect();
                (name.clone(), GenotypeArray::from_genotypes(descriptor, genos).unwrap())
            })
            .collect()
    }

    pub fn sdat_rows(&self) -> Vec<(String, GenotypeArray)> {
        let descriptor = Rc::new(GenotypeArrayDescriptor::new(self.models.clone()));
        self.samples
            .iter()
            .enumerate()
            .map(|(s, name)| {
                let genos: Vec<(String, String)> = self
                    .calls
                    .iter()
                    .map(|row| row[s].clone().unwrap_or_default())
                    .collect();
                (
                    name.clone(),
                    GenotypeArray::from_genotypes(descriptor.clone(), genos).unwrap(),
                )
            })
            .collect()
    }

    /// Expected `(allele1, allele2)` for a sample and locus; missing is `("", "")`.
    pub fn call(&self, sample: usize, locus: usize) -> (String, String) {
        self.calls[locus][sample].clone().unwrap_or_default()
    }
}

/// Loci with 2, 3, 5 and 17 alleles so per-locus widths differ
/// (2, 3, 4 and 8 bits).
pub fn mixed_width_dataset(n_samples: usize) -> Dataset {
    let allele_sets: Vec<Vec<String>> = [2usize, 3, 5, 17, 2, 3]
        .iter()
        .map(|&n| (0..n).map(|i| format!("a{i}")).collect())
        .collect();
    let samples = names("s", n_samples);
    let loci = names("rs", allele_sets.len());
    let mut models = Vec::new();
    let mut calls = Vec::new();
    let mut genome = Genome::new();
    for (l, alleles) in allele_sets.iter().enumerate() {
        let model = model_from_alleles(alleles.iter().map(String::as_str), false, None).unwrap();
        let row = (0..n_samples)
            .map(|s| {
                if (s + l) % 7 == 3 {
                    return None;
                }
                let a = &alleles[(s * 3 + l) % alleles.len()];
                let b = &alleles[(s + 2 * l) % alleles.len()];
                let (a, b) = if a <= b { (a, b) } else { (b, a) };
                Some((a.clone(), b.clone()))
            })
            .collect();
        genome.insert(Locus {
            name: loci[l].clone(),
            model: Some(model.clone()),
            chromosome: Some(format!("{}", l % 3 + 1)),
            location: Some(1000 * (l as i32 + 1)),
            strand: if l % 2 == 0 { Strand::Forward } else { Strand::Reverse },
        });
        models.push(model);
        calls.push(row);
    }
    Dataset {
        samples,
        loci,
        models,
        calls,
        genome,
    }
}

/// Every row of a matrix as allele pairs, in file order.
pub fn read_all(path: &Path, config: ReaderConfig) -> (Vec<String>, Vec<Vec<(String, String)>>) {
    let reader = MatrixReader::open(path, config).unwrap();
    let mut labels = Vec::new();
    let mut rows = Vec::new();
    for row in reader.rows() {
        let (label, row) = row.unwrap();
        labels.push(label);
        rows.push(
            row.to_vec()
                .unwrap()
                .iter()
                .map(|g| {
                    let (a, b) = g.alleles();
                    (
                        a.as_str().unwrap_or("").to_string(),
                        b.as_str().unwrap_or("").to_string(),
                    )
                })
                .collect(),
        );
    }
    (labels, rows)
}

/// Overwrites the version pair in a file header.
pub fn patch_version(path: &Path, version: u32, compat_version: u32) {
    let mut data = fs::read(path).unwrap();
    // magic, header length, format string length
    let format_len = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;
    let at = 16 + format_len;
    data[at..at + 4].copy_from_slice(&version.to_le_bytes());
    data[at + 4..at + 8].copy_from_slice(&compat_version.to_le_bytes());
    fs::write(path, data).unwrap();
}

/// Byte position of a table's block reference (`offset`, `stored_len`,
/// `raw_len`, `compressed`) inside the directory.
pub fn table_entry_at(data: &[u8], name: &str) -> usize {
    let footer = data.len() - 16;
    let mut at = u64::from_le_bytes(data[footer..footer + 8].try_into().unwrap()) as usize;
    let n = u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
    at += 4;
    for _ in 0..n {
        let len = u32::from_le_bytes(data[at..at + 4].try_into().unwrap()) as usize;
        let entry = &data[at + 4..at + 4 + len];
        at += 4 + len;
        if entry == name.as_bytes() {
            return at;
        }
        at += 25;
    }
    panic!("no table named {name}");
}

pub fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}
