mod common;

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use genopack::binary::{Orientation, ReaderConfig, WriterConfig, save_matrix};

fn run_genopack(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_genopack"))
        .args(args)
        .output()
        .expect("failed to run genopack")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "genopack failed: stdout={} stderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn write_dataset(path: &Path, n_samples: usize) -> common::Dataset {
    let data = common::mixed_width_dataset(n_samples);
    save_matrix(
        path,
        Orientation::Ldat,
        data.samples.clone(),
        data.genome.clone(),
        data.ldat_rows(),
        WriterConfig::default(),
    )
    .unwrap();
    data
}

#[test]
fn info_reports_header_and_dimensions_as_json() {
    let dir = common::test_dir("cli-info");
    let path = dir.join("matrix.gpk");
    write_dataset(&path, 7);

    let output = run_genopack(&["info", path.to_str().unwrap(), "--json"]);
    assert_success(&output);

    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["format"], "genotype-matrix");
    assert_eq!(info["version"], 2);
    assert_eq!(info["compat_version"], 1);
    assert_eq!(info["layout"], "ldat");
    assert_eq!(info["compressed"], true);
    assert_eq!(info["samples"], 7);
    assert_eq!(info["loci"], 6);
    // rs1/rs5 and rs2/rs6 share definitions
    assert_eq!(info["models"], 4);
}

#[test]
fn convert_transposes_a_matrix() {
    let dir = common::test_dir("cli-convert");
    let input = dir.join("ldat.gpk");
    let output_path = dir.join("sdat.gpk");
    let data = write_dataset(&input, 10);

    let output = run_genopack(&[
        "convert",
        input.to_str().unwrap(),
        output_path.to_str().unwrap(),
        "--orientation",
        "sdat",
        "--no-compress",
        "--scratch",
        "3",
    ]);
    assert_success(&output);

    let header = genopack::binary::read_header(&output_path).unwrap();
    assert_eq!(header.layout, "sdat");
    assert!(!header.compressed);

    let (labels, rows) = common::read_all(&output_path, ReaderConfig::default());
    assert_eq!(labels, data.samples);
    for (s, row) in rows.iter().enumerate() {
        for (l, call) in row.iter().enumerate() {
            assert_eq!(*call, data.call(s, l), "sample {s} locus {l}");
        }
    }
}

#[test]
fn convert_rejects_unknown_orientations() {
    let dir = common::test_dir("cli-orientation");
    let input = dir.join("ldat.gpk");
    write_dataset(&input, 2);

    let output = run_genopack(&[
        "convert",
        input.to_str().unwrap(),
        dir.join("out.gpk").to_str().unwrap(),
        "--orientation",
        "tdat",
    ]);
    assert!(!output.status.success());
    assert!(!dir.join("out.gpk").exists());
}

#[test]
fn stats_writes_one_line_per_locus() {
    let dir = common::test_dir("cli-stats");
    let input = dir.join("ldat.gpk");
    let output_dir = dir.join("output");
    write_dataset(&input, 8);

    let output = run_genopack(&[
        "stats",
        input.to_str().unwrap(),
        "-o",
        output_dir.to_str().unwrap(),
    ]);
    assert_success(&output);

    let mut reader = csv::Reader::from_path(output_dir.join("locus_stats.csv")).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(
        headers.iter().collect::<Vec<_>>(),
        [
            "locus",
            "chromosome",
            "location",
            "strand",
            "n_alleles",
            "n_samples",
            "missing_rate",
            "minor_allele",
            "maf"
        ]
    );
    let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 6);
    assert_eq!(&records[0][0], "rs1");
    assert_eq!(&records[0][1], "1");
    assert_eq!(&records[0][2], "1000");
    assert_eq!(&records[0][3], "+");
    assert_eq!(&records[0][4], "2");
    assert_eq!(&records[0][5], "8");
    // only biallelic loci get a minor allele
    assert!(!records[0][7].is_empty());
    assert!(records[1][7].is_empty());
    assert!(records[1][8].is_empty());

    let rate: f64 = records[0][6].parse().unwrap();
    assert!((0.0..=1.0).contains(&rate));
}

#[test]
fn missing_input_is_an_error() {
    let dir = common::test_dir("cli-missing");
    let output = run_genopack(&["info", dir.join("absent.gpk").to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("could not read"), "stderr: {stderr}");
    assert!(fs::read_dir(&dir).unwrap().next().is_none());
}
