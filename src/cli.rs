use std::path::Path;

use genopack::binary::{
    GENOMATRIX_FORMAT, GENOTRIPLE_FORMAT, MatrixReader, MatrixWriter, Orientation, ReaderConfig,
    TripleReader, TripleReaderConfig, WriterConfig, read_header,
};
use genopack::error::{CustomError, Result};
use genopack::stats::{count_alleles, count_genotypes, minor_allele, missing_rate};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

use crate::output::{LocusStats, write_locus_stats};

pub fn run_info(path: &Path, as_json: bool) -> Result<()> {
    let header = read_header(path)?;
    let mut info = json!({
        "path": path.display().to_string(),
        "format": header.format,
        "version": header.version,
        "compat_version": header.compat_version,
        "layout": header.layout,
        "compressed": header.compressed,
    });

    if header.format == GENOMATRIX_FORMAT {
        let config = ReaderConfig {
            unique: false,
            ..Default::default()
        };
        let reader = MatrixReader::open(path, config)?;
        info["rows"] = json!(reader.row_labels().len());
        info["columns"] = json!(reader.column_labels().len());
        info["samples"] = json!(reader.samples().len());
        info["loci"] = json!(reader.loci().len());
        info["chunks"] = json!(reader.n_chunks());
        info["models"] = json!(reader.n_distinct_models());
    } else if header.format == GENOTRIPLE_FORMAT {
        let config = TripleReaderConfig {
            unique: false,
            ..Default::default()
        };
        let reader = TripleReader::open(path, config)?;
        info["samples"] = json!(reader.samples().len());
        info["loci"] = json!(reader.loci().len());
        info["records"] = json!(reader.n_records());
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }
    if let Some(fields) = info.as_object() {
        for (key, value) in fields {
            match value.as_str() {
                Some(s) => println!("{key:<15}{s}"),
                None => println!("{key:<15}{value}"),
            }
        }
    }
    Ok(())
}

/// Rewrites a matrix, transposing it when `orientation` differs from the
/// stored one.
pub fn run_convert(
    input: &Path,
    output: &Path,
    orientation: Option<Orientation>,
    compress: bool,
    scratch: usize,
) -> Result<()> {
    let config = ReaderConfig {
        orientation,
        scratch,
        ..Default::default()
    };
    let reader = MatrixReader::open(input, config)?;
    if reader.path() == output {
        return Err(CustomError::Write {
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "output would overwrite the input",
            ),
            path: output.to_path_buf(),
        });
    }

    let target = reader.orientation();
    let n_rows = reader.row_labels().len();
    let columns = reader.column_labels().to_vec();
    let genome = reader.genome().clone();
    println!(
        "Writing {} matrix ({} x {}) to {}...",
        target,
        n_rows,
        columns.len(),
        output.display()
    );

    let mut writer = MatrixWriter::new(
        output,
        target,
        columns,
        genome,
        WriterConfig {
            compress,
            ..Default::default()
        },
    );
    let pb = ProgressBar::new(n_rows as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:30} {pos}/{len} rows").unwrap(),
    );
    for row in reader.rows() {
        let (label, row) = row?;
        writer.write_row(&label, &row)?;
        pb.inc(1);
    }
    pb.abandon();
    writer.close()
}

pub fn run_stats(input: &Path, output_dir: &Path) -> Result<()> {
    let config = ReaderConfig {
        orientation: Some(Orientation::Ldat),
        ..Default::default()
    };
    let reader = MatrixReader::open(input, config)?;
    let genome = reader.genome().clone();
    let n_samples = reader.samples().len();

    let pb = ProgressBar::new(reader.loci().len() as u64);
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {bar:30} {pos}/{len} loci").unwrap(),
    );
    let mut stats = Vec::with_capacity(reader.loci().len());
    for row in reader.rows() {
        let (name, row) = row?;
        let genos = row.to_vec()?;
        let Some(model) = genos
            .first()
            .map(|g| g.model().clone())
            .or_else(|| genome.model(&name).cloned())
        else {
            continue;
        };
        let genocounts = count_genotypes(&model, &genos)?;
        let allelecounts = count_alleles(&model, &genocounts)?;
        let minor = match minor_allele(&model, &allelecounts) {
            Ok((Some(allele), freq)) => Some((allele.to_string(), freq)),
            Ok((None, _)) | Err(CustomError::NotBiallelic { .. }) => None,
            Err(e) => return Err(e),
        };
        stats.push(LocusStats {
            locus: genome.get(&name).cloned().unwrap_or_else(|| genopack::Locus::new(name)),
            n_alleles: model.n_alleles() - 1,
            n_samples,
            missing_rate: missing_rate(&genocounts),
            minor_allele: minor,
        });
        pb.inc(1);
    }
    pb.abandon();

    let stats_path = output_dir.join("locus_stats.csv");
    println!("Writing per-locus statistics to {}...", stats_path.display());
    write_locus_stats(&stats, &stats_path)
}
