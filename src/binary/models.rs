//! Deduplicated model tables.
//!
//! Loci whose models have the same structure share one stored definition.
//! Alleles and chromosome names are pooled, with index 0 of each pool
//! reserved for the missing/unknown value.

use std::collections::HashMap;

use tracing::debug;

use crate::binary::container::{
    Container, ContainerWriter, TableBuf, TableCursor, decode_strings, encode_strings,
};
use crate::error::{CustomError, Result, SchemaError};
use crate::locus::{Genome, Locus, Strand};
use crate::model::{Allele, Model, ModelKey};

const LOCUS_RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocusModelRecord {
    pub model: u32,
    pub chromosome: u32,
    /// -1 when unknown.
    pub location: i32,
    pub strand: Strand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRecord {
    pub max_alleles: u16,
    pub allow_hemizygote: bool,
}

/// Non-missing genotype `(allele1, allele2)` of a stored model, by pool index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenotypeRecord {
    pub model: u32,
    pub allele1: u32,
    pub allele2: u32,
}

#[derive(Debug, Default)]
struct StringPool {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringPool {
    fn with_empty() -> Self {
        let mut pool = Self::default();
        pool.intern("");
        pool
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), id);
        id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelTable {
    pub locus_models: Vec<LocusModelRecord>,
    pub models: Vec<ModelRecord>,
    pub model_genotypes: Vec<GenotypeRecord>,
    pub alleles: Vec<String>,
    pub chromosomes: Vec<String>,
}

impl ModelTable {
    /// Collapses the models of `loci` into shared definitions.
    ///
    /// Locus metadata comes from `genome`; a locus the registry binds to a
    /// different model instance is rejected.
    pub fn build(loci: &[String], genome: &Genome, models: &[Model]) -> Result<Self> {
        if loci.len() != models.len() {
            return Err(SchemaError::TableLength {
                table: "locus_models",
                expected: loci.len(),
                found: models.len(),
            }
            .into());
        }

        let mut table = ModelTable::default();
        let mut alleles = StringPool::with_empty();
        let mut chromosomes = StringPool::with_empty();
        let mut by_key: HashMap<ModelKey, u32> = HashMap::new();
        let mut by_instance: HashMap<usize, u32> = HashMap::new();

        for (name, model) in loci.iter().zip(models) {
            let locus = genome.get(name);
            if let Some(bound) = locus.and_then(|l| l.model.as_ref())
                && !bound.ptr_eq(model)
            {
                return Err(SchemaError::LocusModel {
                    locus: name.clone(),
                }
                .into());
            }

            let model_index = match by_instance.get(&model.id()) {
                Some(&idx) => idx,
                None => {
                    let key = model.key();
                    let idx = match by_key.get(&key) {
                        Some(&idx) => idx,
                        None => {
                            let idx = table.models.len() as u32;
                            table.models.push(ModelRecord {
                                max_alleles: key.max_alleles,
                                allow_hemizygote: key.allow_hemizygote,
                            });
                            for (a1, a2) in &key.genotypes {
                                table.model_genotypes.push(GenotypeRecord {
                                    model: idx,
                                    allele1: alleles.intern(a1.as_str().unwrap_or("")),
                                    allele2: alleles.intern(a2.as_str().unwrap_or("")),
                                });
                            }
                            by_key.insert(key, idx);
                            idx
                        }
                    };
                    by_instance.insert(model.id(), idx);
                    idx
                }
            };

            let chromosome = locus
                .and_then(|l| l.chromosome.as_deref())
                .map_or(0, |c| chromosomes.intern(c));
            table.locus_models.push(LocusModelRecord {
                model: model_index,
                chromosome,
                location: locus.and_then(|l| l.location).unwrap_or(-1),
                strand: locus.map_or(Strand::Unknown, |l| l.strand),
            });
        }

        table.alleles = alleles.strings;
        table.chromosomes = chromosomes.strings;
        debug!(
            loci = loci.len(),
            models = table.models.len(),
            alleles = table.alleles.len(),
            "built model table"
        );
        Ok(table)
    }

    pub fn save(&self, out: &mut ContainerWriter) -> Result<()> {
        let mut buf = TableBuf::new();
        buf.put_u64(self.locus_models.len() as u64);
        for record in &self.locus_models {
            buf.put_u32(record.model);
            buf.put_u32(record.chromosome);
            buf.put_i32(record.location);
            buf.put_u32(record.strand.code() as u32);
        }
        out.write_table("locus_models", &buf.into_bytes())?;

        let mut buf = TableBuf::new();
        buf.put_u64(self.models.len() as u64);
        for record in &self.models {
            buf.put_u16(record.max_alleles);
            buf.put_u16(record.allow_hemizygote as u16);
        }
        out.write_table("models", &buf.into_bytes())?;

        let mut buf = TableBuf::new();
        buf.put_u64(self.model_genotypes.len() as u64);
        for record in &self.model_genotypes {
            buf.put_u32(record.model);
            buf.put_u32(record.allele1);
            buf.put_u32(record.allele2);
        }
        out.write_table("model_genotypes", &buf.into_bytes())?;

        out.write_table("model_alleles", &encode_strings(&self.alleles))?;
        out.write_table("chromosomes", &encode_strings(&self.chromosomes))?;
        Ok(())
    }

    /// Reads the tables of a file at format `version`.
    ///
    /// Version 1 carries only the model of each locus; the chromosome,
    /// location and strand fields are ignored.
    pub fn load(container: &Container, version: u32) -> Result<Self> {
        let data = container.table("locus_models")?;
        let mut cur = TableCursor::new("locus_models", &data);
        let n = cur.get_len()?;
        let mut locus_models = Vec::with_capacity(n);
        for _ in 0..n {
            let model = cur.get_u32()?;
            if version < 2 {
                cur.skip(LOCUS_RECORD_SIZE - 4)?;
                locus_models.push(LocusModelRecord {
                    model,
                    chromosome: 0,
                    location: -1,
                    strand: Strand::Unknown,
                });
                continue;
            }
            let chromosome = cur.get_u32()?;
            let location = cur.get_i32()?;
            let strand = u8::try_from(cur.get_u32()?)
                .map_err(|_| cur.corrupt("strand code out of range"))
                .and_then(Strand::from_code)?;
            locus_models.push(LocusModelRecord {
                model,
                chromosome,
                location,
                strand,
            });
        }
        cur.finish()?;

        let data = container.table("models")?;
        let mut cur = TableCursor::new("models", &data);
        let n = cur.get_len()?;
        let mut models = Vec::with_capacity(n);
        for _ in 0..n {
            models.push(ModelRecord {
                max_alleles: cur.get_u16()?,
                allow_hemizygote: cur.get_u16()? != 0,
            });
        }
        cur.finish()?;

        let data = container.table("model_genotypes")?;
        let mut cur = TableCursor::new("model_genotypes", &data);
        let n = cur.get_len()?;
        let mut model_genotypes = Vec::with_capacity(n);
        for _ in 0..n {
            model_genotypes.push(GenotypeRecord {
                model: cur.get_u32()?,
                allele1: cur.get_u32()?,
                allele2: cur.get_u32()?,
            });
        }
        cur.finish()?;

        let alleles = decode_strings("model_alleles", &container.table("model_alleles")?)?;
        let chromosomes = if version >= 2 {
            decode_strings("chromosomes", &container.table("chromosomes")?)?
        } else {
            vec![String::new()]
        };

        let table = Self {
            locus_models,
            models,
            model_genotypes,
            alleles,
            chromosomes,
        };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        let corrupt = |table: &str, reason: String| CustomError::CorruptTable {
            table: table.to_string(),
            reason,
        };
        if self.alleles.first().map(String::as_str) != Some("") {
            return Err(corrupt("model_alleles", "index 0 is not the missing allele".into()));
        }
        for (i, record) in self.locus_models.iter().enumerate() {
            if record.model as usize >= self.models.len() {
                return Err(corrupt("locus_models", format!("locus {i} names model {}", record.model)));
            }
            if record.chromosome as usize >= self.chromosomes.len() {
                return Err(corrupt(
                    "locus_models",
                    format!("locus {i} names chromosome {}", record.chromosome),
                ));
            }
        }
        for record in &self.model_genotypes {
            if record.model as usize >= self.models.len()
                || record.allele1 as usize >= self.alleles.len()
                || record.allele2 as usize >= self.alleles.len()
            {
                return Err(corrupt("model_genotypes", format!("invalid record {record:?}")));
            }
        }
        Ok(())
    }

    /// Rebuilds one model per distinct definition and binds loci to them.
    ///
    /// Loci sharing a definition receive handles to the same instance.
    pub fn reconstruct(&self, loci: &[String]) -> Result<(Vec<Model>, Genome)> {
        if loci.len() != self.locus_models.len() {
            return Err(SchemaError::TableLength {
                table: "locus_models",
                expected: loci.len(),
                found: self.locus_models.len(),
            }
            .into());
        }

        let mut genotypes: Vec<Vec<&GenotypeRecord>> = vec![Vec::new(); self.models.len()];
        for record in &self.model_genotypes {
            genotypes[record.model as usize].push(record);
        }

        let mut by_key: HashMap<ModelKey, Model> = HashMap::new();
        let mut stored = Vec::with_capacity(self.models.len());
        for (record, genos) in self.models.iter().zip(&genotypes) {
            let model = Model::new(record.allow_hemizygote, record.max_alleles);
            for (expected, g) in (1u32..).zip(genos) {
                let geno = model.add_genotype((
                    self.alleles[g.allele1 as usize].as_str(),
                    self.alleles[g.allele2 as usize].as_str(),
                ))?;
                if geno.index() != expected {
                    return Err(CustomError::CorruptTable {
                        table: "model_genotypes".to_string(),
                        reason: format!("genotype {geno} is listed twice"),
                    });
                }
            }
            let shared = by_key.entry(model.key()).or_insert(model).clone();
            stored.push(shared);
        }

        let mut models = Vec::with_capacity(loci.len());
        let mut genome = Genome::new();
        for (name, record) in loci.iter().zip(&self.locus_models) {
            let model = stored[record.model as usize].clone();
            let chromosome = (record.chromosome != 0)
                .then(|| self.chromosomes[record.chromosome as usize].clone());
            genome.insert(Locus {
                name: name.clone(),
                model: Some(model.clone()),
                chromosome,
                location: (record.location != -1).then_some(record.location),
                strand: record.strand,
            });
            models.push(model);
        }
        debug!(loci = loci.len(), models = by_key.len(), "reconstructed models");
        Ok((models, genome))
    }

    /// Genotype allele pairs of stored model `index`, missing as `None`.
    pub fn genotypes_of(&self, index: u32) -> Vec<(Allele, Allele)> {
        self.model_genotypes
            .iter()
            .filter(|g| g.model == index)
            .map(|g| {
                (
                    Allele::from(self.alleles[g.allele1 as usize].as_str()),
                    Allele::from(self.alleles[g.allele2 as usize].as_str()),
                )
            })
            .collect()
    }
}
