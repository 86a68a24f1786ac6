use std::collections::HashMap;
use std::fmt;

use crate::error::{CustomError, Result};
use crate::model::Model;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strand {
    #[default]
    Unknown = 0,
    Forward = 1,
    Reverse = 2,
}

impl Strand {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Strand::Unknown),
            1 => Ok(Strand::Forward),
            2 => Ok(Strand::Reverse),
            _ => Err(CustomError::CorruptTable {
                table: "locus_models".to_string(),
                reason: format!("invalid strand code {code}"),
            }),
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strand::Unknown => "",
            Strand::Forward => "+",
            Strand::Reverse => "-",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Locus {
    pub name: String,
    pub model: Option<Model>,
    pub chromosome: Option<String>,
    pub location: Option<i32>,
    pub strand: Strand,
}

impl Locus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Per-locus metadata keyed by locus name.
#[derive(Debug, Clone, Default)]
pub struct Genome {
    loci: HashMap<String, Locus>,
}

impl Genome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.loci.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loci.is_empty()
    }

    pub fn insert(&mut self, locus: Locus) {
        self.loci.insert(locus.name.clone(), locus);
    }

    pub fn get(&self, name: &str) -> Option<&Locus> {
        self.loci.get(name)
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.loci.get(name).and_then(|l| l.model.as_ref())
    }

    pub fn set_model(&mut self, name: &str, model: Model) {
        self.loci
            .entry(name.to_string())
            .or_insert_with(|| Locus::new(name))
            .model = Some(model);
    }

    /// Model to use for `name` when merging a file into this registry.
    ///
    /// An existing binding wins; otherwise the file's model (and metadata
    /// from `file_locus`) is adopted.
    pub fn unify(&mut self, file_locus: &Locus, file_model: &Model) -> Model {
        let entry = self
            .loci
            .entry(file_locus.name.clone())
            .or_insert_with(|| Locus {
                model: None,
                ..file_locus.clone()
            });
        entry.model.get_or_insert_with(|| file_model.clone()).clone()
    }
}
