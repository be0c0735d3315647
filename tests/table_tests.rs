use std::sync::Arc;

use chrono::Utc;
use rosterharvest::{
    Dataset, DatasetKind, MemoryStore, PortalConfig, SnapshotStore,
    table::field,
    view::{DerivedColumn, Filter, apply_derived, load_view, strip_derived},
};
use spectral::prelude::*;

fn dataset(headers: &[&str], rows: &[&[&str]]) -> Dataset {
    Dataset::from_rows(
        headers.iter().map(|h| (*h).to_string()).collect(),
        rows.iter()
            .map(|row| row.iter().map(|cell| (*cell).to_string()).collect())
            .collect(),
    )
}

fn column(dataset: &Dataset, name: &str) -> Vec<String> {
    dataset
        .records
        .iter()
        .map(|record| field(record, name).to_string())
        .collect()
}

#[test]
fn blob_round_trips_delimiters_quotes_and_newlines() {
    let original = dataset(
        &["ID Oferta", "Nome Disciplina", "Horário"],
        &[
            &["1", "Cálculo, Turma \"A\"", "Segunda 19:10-20:25\nQuarta 19:10-20:25"],
            &["2", "", "  espaços  "],
        ],
    );

    let blob = original.to_blob().expect("Expected serialization.");
    let parsed = Dataset::from_blob(&blob).expect("Expected parse.");

    assert_that(&blob.starts_with('\u{feff}')).is_true();
    assert_that(&parsed).is_equal_to(original);
}

#[test]
fn blob_quotes_only_when_needed() {
    let original = dataset(&["a", "b"], &[&["plain", "with,comma"]]);

    let csv = original.to_csv().expect("Expected serialization.");

    assert_that(&csv.as_str()).is_equal_to("a,b\r\nplain,\"with,comma\"\r\n");
}

#[test]
fn blob_without_bom_and_with_ragged_rows_is_read() {
    let parsed = Dataset::from_blob("a,b,c\n1,2\n3,4,5,6\n").expect("Expected parse.");

    assert_that(&parsed.headers).has_length(3);
    assert_that(&column(&parsed, "c")).is_equal_to(vec![String::new(), "5".to_string()]);
}

#[test]
fn empty_blob_is_an_empty_dataset() {
    let parsed = Dataset::from_blob("\u{feff}").expect("Expected parse.");

    assert_that(&parsed).is_equal_to(Dataset::default());
    assert_that(&Dataset::default().to_blob().expect("Expected serialization."))
        .is_equal_to("\u{feff}".to_string());
}

#[test]
fn push_projects_records_onto_headers() {
    let mut target = Dataset::new(vec!["a".to_string(), "b".to_string()]);
    let record: rosterharvest::Record = [("a", "1"), ("z", "ignored")]
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();

    target.push(&record);

    assert_that(&target.rows()).is_equal_to(vec![vec!["1".to_string(), String::new()]]);
}

#[test]
fn occupancy_is_a_rounded_percentage() {
    let derived = vec![DerivedColumn::Occupancy {
        column: "Ocupação".to_string(),
        enrolled: "Matriculados".to_string(),
        capacity: "Vagas".to_string(),
    }];
    let mut data = dataset(
        &["Vagas", "Matriculados"],
        &[&["40", "35"], &["3", "2"], &["0", "5"], &["", "5"], &["x", "1"]],
    );

    apply_derived(&mut data, &derived);

    assert_that(&column(&data, "Ocupação")).is_equal_to(vec![
        "88%".to_string(),
        "67%".to_string(),
        String::new(),
        String::new(),
        String::new(),
    ]);
}

#[test]
fn status_and_period_columns_are_derived() {
    let derived = vec![
        DerivedColumn::Status {
            column: "Status".to_string(),
            source: "Situação".to_string(),
            active: vec!["MATRICULADO".to_string()],
        },
        DerivedColumn::Period {
            column: "Período".to_string(),
            year: "Ano".to_string(),
            term: "Semestre".to_string(),
        },
    ];
    let mut data = dataset(
        &["Situação", "Ano", "Semestre"],
        &[&["matriculado", "2025", "2"], &["TRANCADO", "2025", ""], &["", "", ""]],
    );

    apply_derived(&mut data, &derived);

    assert_that(&column(&data, "Status")).is_equal_to(vec![
        "Ativo".to_string(),
        "Inativo".to_string(),
        String::new(),
    ]);
    assert_that(&column(&data, "Período")).is_equal_to(vec![
        "2025/2".to_string(),
        String::new(),
        String::new(),
    ]);

    strip_derived(&mut data, &derived);
    assert_that(&data.headers).has_length(3);
    assert_that(&data.records.iter().any(|r| r.contains_key("Status"))).is_false();
}

#[test]
fn filter_parses_column_and_value() {
    let filter: Filter = "Curso = ads".parse().expect("Expected a filter.");

    assert_that(&filter.column.as_str()).is_equal_to("Curso");
    assert_that(&filter.value.as_str()).is_equal_to("ads");
    assert_that(&"no separator".parse::<Filter>()).is_err();
}

#[test]
fn view_adds_derived_columns_filters_and_sorts() {
    let config = PortalConfig::load(None).expect("Expected embedded config.");
    let snapshots = SnapshotStore::new(Arc::new(MemoryStore::new()));
    let stored = dataset(
        &["ID Oferta", "Nome Disciplina", "Vagas", "Matriculados", "Ano", "Semestre"],
        &[
            &["3", "Física", "10", "5", "2025", "2"],
            &["1", "Cálculo II", "40", "40", "2025", "2"],
            &["2", "cálculo I", "20", "5", "2025", "1"],
        ],
    );
    snapshots
        .write(
            DatasetKind::Offerings,
            &stored.to_blob().expect("Expected serialization."),
            Utc::now(),
        )
        .expect("Expected write.");

    let view = load_view(
        &snapshots,
        DatasetKind::Offerings,
        &config.plan(DatasetKind::Offerings).derived,
        &["Nome Disciplina=cálculo".parse().expect("Expected a filter.")],
        Some("Nome Disciplina"),
    )
    .expect("Expected a view.");

    assert_that(&column(&view, "ID Oferta")).is_equal_to(vec!["2".to_string(), "1".to_string()]);
    assert_that(&column(&view, "Ocupação")).is_equal_to(vec!["25%".to_string(), "100%".to_string()]);
    assert_that(&column(&view, "Período")).is_equal_to(vec!["2025/1".to_string(), "2025/2".to_string()]);
}

#[test]
fn view_of_empty_slot_is_empty() {
    let config = PortalConfig::load(None).expect("Expected embedded config.");
    let snapshots = SnapshotStore::new(Arc::new(MemoryStore::new()));

    let view = load_view(
        &snapshots,
        DatasetKind::Students,
        &config.plan(DatasetKind::Students).derived,
        &[],
        None,
    )
    .expect("Expected a view.");

    assert_that(&view.is_empty()).is_true();
}
