use std::path::Path;

use genopack::error::{CustomError, Result};
use genopack::locus::Locus;

/// Summary of one locus across every sample of a matrix.
#[derive(Debug, Clone)]
pub struct LocusStats {
    pub locus: Locus,
    pub n_alleles: usize,
    pub n_samples: usize,
    pub missing_rate: f64,
    /// `None` for loci that are not biallelic or have no calls.
    pub minor_allele: Option<(String, f64)>,
}

pub fn write_locus_stats(stats: &[LocusStats], path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "locus",
        "chromosome",
        "location",
        "strand",
        "n_alleles",
        "n_samples",
        "missing_rate",
        "minor_allele",
        "maf",
    ])?;

    for s in stats {
        let (minor, maf) = match &s.minor_allele {
            Some((allele, freq)) => (Some(allele.as_str()), Some(*freq)),
            None => (None, None),
        };
        wtr.serialize((
            s.locus.name.as_str(),
            s.locus.chromosome.as_deref(),
            s.locus.location,
            s.locus.strand.to_string(),
            s.n_alleles,
            s.n_samples,
            s.missing_rate,
            minor,
            maf,
        ))?;
    }
    wtr.flush().map_err(|e| CustomError::Write {
        source: e,
        path: path.to_path_buf(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use genopack::locus::Strand;

    #[test]
    fn locus_stats_csv_has_one_line_per_locus() {
        let dir = std::env::temp_dir().join("genopack-unit");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}-locus_stats.csv", std::process::id()));

        let mut rs1 = Locus::new("rs1");
        rs1.chromosome = Some("2".to_string());
        rs1.location = Some(1500);
        rs1.strand = Strand::Forward;
        let stats = vec![
            LocusStats {
                locus: rs1,
                n_alleles: 2,
                n_samples: 4,
                missing_rate: 0.25,
                minor_allele: Some(("G".to_string(), 0.5)),
            },
            LocusStats {
                locus: Locus::new("rs2"),
                n_alleles: 3,
                n_samples: 4,
                missing_rate: 0.0,
                minor_allele: None,
            },
        ];
        write_locus_stats(&stats, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "locus,chromosome,location,strand,n_alleles,n_samples,missing_rate,minor_allele,maf",
                "rs1,2,1500,+,2,4,0.25,G,0.5",
                "rs2,,,,3,4,0.0,,",
            ]
        );
    }
}
