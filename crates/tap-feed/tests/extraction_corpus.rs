//! Golden regression corpus for the extraction heuristics: real-shaped feed
//! entries asserted field by field against a checked-in snapshot.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tap_feed::{decode_feed, CategoryRules, ExtractionError, Extractor};

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct GoldenExtraction {
    external_id: String,
    agency: Option<String>,
    title: String,
    category: String,
    estimated_value: Option<f64>,
    closing_date: Option<NaiveDate>,
    location: Option<String>,
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn sample_dir() -> PathBuf {
    workspace_root().join("fixtures").join("gebiz").join("sample")
}

fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 10).expect("reference date")
}

#[test]
fn extraction_corpus_matches_the_golden_snapshot() {
    let raw = std::fs::read(sample_dir().join("feed.json")).expect("read feed fixture");
    let items = decode_feed(&raw).expect("decode feed fixture");
    let extractor = Extractor::new("gebiz", CategoryRules::builtin());

    let mut actual = Vec::new();
    let mut errors = Vec::new();
    for item in &items {
        match extractor.extract(item, reference_date()) {
            Ok(draft) => actual.push(GoldenExtraction {
                external_id: draft.external_id,
                agency: draft.agency,
                title: draft.title,
                category: draft.category,
                estimated_value: draft.estimated_value,
                closing_date: draft.closing_date,
                location: draft.location,
            }),
            Err(err) => errors.push(err),
        }
    }

    let expected_text =
        std::fs::read_to_string(sample_dir().join("expected.json")).expect("read golden snapshot");
    let expected: Vec<GoldenExtraction> =
        serde_json::from_str(&expected_text).expect("parse golden snapshot");

    assert_eq!(actual, expected);
    assert_eq!(errors, vec![ExtractionError::MissingExternalId]);
}

#[test]
fn identical_raw_text_yields_identical_drafts() {
    let raw = std::fs::read(sample_dir().join("feed.json")).expect("read feed fixture");
    let items = decode_feed(&raw).expect("decode feed fixture");
    let extractor = Extractor::new("gebiz", CategoryRules::builtin());

    for item in &items {
        assert_eq!(
            extractor.extract(item, reference_date()).ok(),
            extractor.extract(item, reference_date()).ok()
        );
    }
}
