//! End-to-end enrichment scenarios against a scripted registry
//!
//! Each test wires the real pipeline to `ScriptedGateway` and checks the
//! observable outcome: flattened records, follow-up lists, gateway traffic
//! and the progress stream.

use requisition_enricher::artifacts::{self, TaskArtifacts};
use requisition_enricher::cache::LookupCache;
use requisition_enricher::config::AppConfig;
use requisition_enricher::gateway::Operation;
use requisition_enricher::model::{PaymentSource, Person, Row, SourceTest};
use requisition_enricher::pipeline::EnrichmentPipeline;
use requisition_enricher::progress::{TaskProgress, PROGRESS_COMPLETE, PROGRESS_FAILED};
use requisition_enricher::report::workbook::{SourceWorkbook, REPORT_SHEET};
use requisition_enricher::report::{
    COMMENT_DUPLICATE_PATIENTS, COMMENT_LOOKUP_ERROR, COMMENT_NO_RESULTS,
    COMMENT_PATIENT_NOT_FOUND,
};
use requisition_enricher::testing::mocks::{RecordingProgress, ScriptedGateway};
use rust_xlsxwriter::Workbook;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const VISIT_DATE: &str = "15.03.2025";
const GLUCOSE_CODE: &str = "A09.05.023";
const GLUCOSE_ID: &str = "900";

struct Harness {
    gateway: Arc<ScriptedGateway>,
    sink: Arc<RecordingProgress>,
    pipeline: EnrichmentPipeline,
    results: TempDir,
}

impl Harness {
    fn new() -> Self {
        let results = TempDir::new().unwrap();
        let config = AppConfig::from_toml_str(&format!(
            r#"
[server]
results_dir = "{}"

[gateway]
base_url = "http://localhost:9000"
api_key_env = "REGISTRY_API_KEY"

[workbook]
start_row = 1
min_col = 2
max_col = 9
"#,
            results.path().display()
        ))
        .unwrap();

        let gateway = Arc::new(ScriptedGateway::new());
        let sink = Arc::new(RecordingProgress::new());
        let cache = Arc::new(LookupCache::with_capacity(64));
        let pipeline = EnrichmentPipeline::new(gateway.clone(), cache, sink.clone(), &config);

        Self {
            gateway,
            sink,
            pipeline,
            results,
        }
    }

    async fn artifacts(&self, task_id: &str) -> TaskArtifacts {
        TaskArtifacts::create(self.results.path(), task_id)
            .await
            .unwrap()
    }

    fn progress(&self, task_id: &str) -> TaskProgress {
        TaskProgress::new(task_id, self.sink.clone())
    }
}

fn row(position: usize, inz: &str, last_name: &str) -> Row {
    Row {
        position,
        visit_date: VISIT_DATE.to_string(),
        requisition_number: inz.to_string(),
        person: Person {
            last_name: last_name.to_string(),
            first_name: "Anna".to_string(),
            middle_name: "Petrovna".to_string(),
            birth_day: "05.06.1970".to_string(),
        },
        test_src: SourceTest {
            code: GLUCOSE_CODE.to_string(),
            name: "Glucose".to_string(),
            quantity: 1,
            price: 350.5,
        },
    }
}

fn single_match(person_id: &str) -> Value {
    json!({"totalCount": 1, "data": [{"Person_id": person_id}]})
}

fn glucose_catalog() -> Value {
    json!([
        {
            "UslugaComplex_Code": "A09.05.023.1",
            "UslugaComplex_id": "901",
            "UslugaComplex_Name": "Glucose load test"
        },
        {
            "UslugaComplex_Code": GLUCOSE_CODE,
            "UslugaComplex_id": GLUCOSE_ID,
            "UslugaComplex_Name": "Glucose"
        },
    ])
}

fn lab_history(event_id: &str) -> Value {
    json!({"data": [
        {
            "Evn_id": "E-OTHER",
            "UslugaComplex_AttributeList": "consult",
            "UslugaComplex_id": GLUCOSE_ID,
            "sort": "2025-03-15 08:00:00",
        },
        {
            "Evn_id": event_id,
            "UslugaComplex_AttributeList": "lab,paid",
            "UslugaComplex_id": GLUCOSE_ID,
            "UslugaComplex_Name": "Glucose",
            "EvnUslugaPar_setDate": VISIT_DATE,
            "sort": "2025-03-15 09:30:00",
        },
    ]})
}

fn report_with_pay_type(pay_type_id: &str) -> Value {
    json!({"map": {"EvnUslugaPar": {"item": [{"data": {
        "PayType_id": pay_type_id,
        "MedStaffFact_id": "33",
        "EvnDirection_id": "44",
    }}]}}})
}

fn visit_event(set_date: &str, child: &str) -> Value {
    json!({
        "EvnType": "vizit",
        "objectSetDate": set_date,
        "objectDisDate": set_date,
        "EvnClass_Name": "Outpatient visit",
        "children": [{"Evn_id": child, "MedStaffFact_id": 77}],
    })
}

/// Known patient with a glucose test in the catalog and a lab event in history
fn script_known_patient(gateway: &ScriptedGateway) {
    gateway.respond(Operation::PersonSearch, single_match("501"));
    gateway.respond(Operation::ServiceCatalog, glucose_catalog());
    gateway.respond(Operation::TestHistory, lab_history("E-100"));
}

#[tokio::test]
async fn test_duplicate_patients_are_excluded_but_reported() {
    let harness = Harness::new();
    harness.gateway.respond(
        Operation::PersonSearch,
        json!({"totalCount": 3, "data": [
            {"Person_id": "1"}, {"Person_id": "2"}, {"Person_id": "3"}
        ]}),
    );

    let outcome = harness
        .pipeline
        .enrich(
            &harness.progress("dup"),
            &harness.artifacts("dup").await,
            vec![row(0, "INZ-1", "Sidorova")],
        )
        .await
        .unwrap();

    assert!(outcome.enriched.is_empty());
    assert_eq!(outcome.duplicates.len(), 1);
    assert_eq!(outcome.duplicates[0].full_name, "Sidorova Anna Petrovna");
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].comment, COMMENT_DUPLICATE_PATIENTS);
    assert_eq!(outcome.records[0].pay_type, "");

    assert_eq!(harness.gateway.calls(Operation::ServiceCatalog), 0);
    assert_eq!(harness.gateway.calls(Operation::TestHistory), 0);
    assert_eq!(harness.gateway.calls(Operation::TestReport), 0);
    assert_eq!(harness.gateway.calls(Operation::MedicalHistory), 0);
}

#[tokio::test]
async fn test_pay_type_resolved_from_test_report() {
    let harness = Harness::new();
    script_known_patient(&harness.gateway);
    harness
        .gateway
        .respond(Operation::TestReport, report_with_pay_type("2"));

    let outcome = harness
        .pipeline
        .enrich(
            &harness.progress("primary"),
            &harness.artifacts("primary").await,
            vec![row(0, "INZ-1", "Sidorova")],
        )
        .await
        .unwrap();

    let record = &outcome.records[0];
    assert_eq!(record.pay_type, "Budget");
    assert_eq!(record.comment, "");

    let enriched = &outcome.enriched[0];
    assert_eq!(enriched.person_id, "501");
    assert_eq!(enriched.tests_history.len(), 1);
    let report = enriched.test_report.as_ref().unwrap();
    assert_eq!(report.source, PaymentSource::TestReport);
    assert_eq!(report.staff_id.as_deref(), Some("33"));
    assert_eq!(report.direction_id.as_deref(), Some("44"));

    assert_eq!(
        harness.gateway.requests(Operation::TestReport)[0]["Evn_id"],
        "E-100"
    );
    assert_eq!(harness.gateway.calls(Operation::MedicalHistory), 0);
}

#[tokio::test]
async fn test_pay_type_resolved_from_medical_history_fallback() {
    let harness = Harness::new();
    script_known_patient(&harness.gateway);
    harness.gateway.respond(Operation::TestReport, json!({}));
    harness.gateway.respond(
        Operation::MedicalHistory,
        json!({"data": [
            {
                "EvnType": "direction",
                "objectSetDate": "14.03.2025",
                "children": [{"Evn_id": "D-1"}]
            },
            visit_event("10.03.2025", "V-1"),
            visit_event("12.03.2025", "V-2"),
        ]}),
    );
    harness
        .gateway
        .respond(Operation::EventPayType, json!([{"PayType_id": 1}]));

    let outcome = harness
        .pipeline
        .enrich(
            &harness.progress("fallback"),
            &harness.artifacts("fallback").await,
            vec![row(0, "INZ-1", "Sidorova")],
        )
        .await
        .unwrap();

    let enriched = &outcome.enriched[0];
    assert_eq!(enriched.medical_history.len(), 2);
    let report = enriched.test_report.as_ref().unwrap();
    assert_eq!(report.source, PaymentSource::MedicalHistory);
    assert_eq!(report.pay_type_label, "OMS");
    assert_eq!(report.staff_id.as_deref(), Some("77"));

    assert_eq!(outcome.records[0].pay_type, "OMS");
    assert_eq!(outcome.records[0].comment, "");
    assert_eq!(
        harness.gateway.requests(Operation::EventPayType)[0]["EvnVizitPL_id"],
        "V-1"
    );
}

#[tokio::test]
async fn test_fallback_window_excludes_event_fourteen_days_before_visit() {
    let harness = Harness::new();
    script_known_patient(&harness.gateway);
    harness.gateway.respond(Operation::TestReport, json!({}));
    harness.gateway.respond(
        Operation::MedicalHistory,
        json!({"data": [visit_event("01.03.2025", "V-OLD"), visit_event("16.03.2025", "V-LATER")]}),
    );
    harness
        .gateway
        .respond(Operation::EventPayType, json!([{"PayType_id": 1}]));

    let outcome = harness
        .pipeline
        .enrich(
            &harness.progress("window"),
            &harness.artifacts("window").await,
            vec![row(0, "INZ-1", "Sidorova")],
        )
        .await
        .unwrap();

    assert!(outcome.enriched[0].medical_history.is_empty());
    assert!(outcome.enriched[0].test_report.is_none());
    assert_eq!(outcome.records[0].comment, COMMENT_NO_RESULTS);
    assert_eq!(harness.gateway.calls(Operation::EventPayType), 0);
}

#[tokio::test]
async fn test_primary_result_is_never_overwritten() {
    let harness = Harness::new();
    script_known_patient(&harness.gateway);
    harness
        .gateway
        .respond(Operation::TestReport, report_with_pay_type("3"));
    harness
        .gateway
        .respond(Operation::MedicalHistory, json!({"data": [visit_event("14.03.2025", "V-1")]}));
    harness
        .gateway
        .respond(Operation::EventPayType, json!([{"PayType_id": 1}]));

    let outcome = harness
        .pipeline
        .enrich(
            &harness.progress("keep"),
            &harness.artifacts("keep").await,
            vec![row(0, "INZ-1", "Sidorova")],
        )
        .await
        .unwrap();

    assert_eq!(outcome.records[0].pay_type, "Paid");
    assert_eq!(harness.gateway.calls(Operation::MedicalHistory), 0);
    assert_eq!(harness.gateway.calls(Operation::EventPayType), 0);
}

#[tokio::test]
async fn test_mixed_batch_keeps_sheet_order_and_comments() {
    let harness = Harness::new();
    let gateway = &harness.gateway;
    gateway.respond(Operation::PersonSearch, single_match("501"));
    gateway.respond_matching(
        Operation::PersonSearch,
        "PersonSurName_SurName",
        json!("Nobody"),
        json!({"totalCount": 0, "data": []}),
    );
    gateway.respond_matching(
        Operation::PersonSearch,
        "PersonSurName_SurName",
        json!("Garbled"),
        json!({"unexpected": true}),
    );
    gateway.respond(Operation::ServiceCatalog, json!([]));

    let rows = vec![
        row(0, "INZ-1", "Sidorova"),
        row(1, "INZ-2", "Nobody"),
        row(2, "INZ-3", "Garbled"),
    ];
    let outcome = harness
        .pipeline
        .enrich(
            &harness.progress("mixed"),
            &harness.artifacts("mixed").await,
            rows,
        )
        .await
        .unwrap();

    let comments: Vec<&str> = outcome.records.iter().map(|r| r.comment.as_str()).collect();
    assert_eq!(
        comments,
        vec![
            "service with code 'A09.05.023' not found in registry",
            COMMENT_PATIENT_NOT_FOUND,
            COMMENT_LOOKUP_ERROR,
        ]
    );
    assert_eq!(outcome.not_found.len(), 1);
    assert!(outcome.duplicates.is_empty());
    assert_eq!(outcome.excluded.len(), 2);
    // the service lookup happens only for the valid row
    assert_eq!(gateway.calls(Operation::ServiceCatalog), 1);
    // without a registry test there is no report to consult
    assert_eq!(gateway.calls(Operation::TestReport), 0);
}

#[tokio::test]
async fn test_skippable_failures_degrade_rows_only() {
    let harness = Harness::new();
    script_known_patient(&harness.gateway);
    harness.gateway.reject(Operation::TestReport, 404);
    harness.gateway.reject(Operation::MedicalHistory, 403);

    let outcome = harness
        .pipeline
        .enrich(
            &harness.progress("degraded"),
            &harness.artifacts("degraded").await,
            vec![row(0, "INZ-1", "Sidorova"), row(1, "INZ-2", "Sidorova")],
        )
        .await
        .unwrap();

    assert_eq!(outcome.records.len(), 2);
    assert!(outcome
        .records
        .iter()
        .all(|r| r.comment == COMMENT_NO_RESULTS));
    // rejected lookups are memoized like any other outcome
    assert_eq!(harness.gateway.calls(Operation::TestReport), 1);
    assert_eq!(harness.gateway.calls(Operation::MedicalHistory), 1);
}

#[tokio::test]
async fn test_lookups_are_shared_across_rows_and_tasks() {
    let harness = Harness::new();
    script_known_patient(&harness.gateway);
    harness
        .gateway
        .respond(Operation::TestReport, report_with_pay_type("2"));

    for task_id in ["first", "second"] {
        harness
            .pipeline
            .enrich(
                &harness.progress(task_id),
                &harness.artifacts(task_id).await,
                vec![row(0, "INZ-1", "Sidorova"), row(1, "INZ-2", "Sidorova")],
            )
            .await
            .unwrap();
    }

    assert_eq!(harness.gateway.calls(Operation::PersonSearch), 1);
    assert_eq!(harness.gateway.calls(Operation::ServiceCatalog), 1);
    assert_eq!(harness.gateway.calls(Operation::TestHistory), 1);
    assert_eq!(harness.gateway.calls(Operation::TestReport), 1);
}

#[tokio::test]
async fn test_stage_artifacts_are_written() {
    let harness = Harness::new();
    script_known_patient(&harness.gateway);
    harness
        .gateway
        .respond(Operation::TestReport, report_with_pay_type("2"));

    let task_artifacts = harness.artifacts("snapshots").await;
    harness
        .pipeline
        .enrich(
            &harness.progress("snapshots"),
            &task_artifacts,
            vec![row(0, "INZ-1", "Sidorova")],
        )
        .await
        .unwrap();

    for name in [
        artifacts::IDENTIFIED_ROWS,
        artifacts::VALID_ROWS,
        artifacts::NOT_FOUND,
        artifacts::DUPLICATES,
        artifacts::CATALOGED_ROWS,
        artifacts::HISTORIED_ROWS,
        artifacts::NARROWED_ROWS,
        artifacts::PRICED_ROWS,
        artifacts::ENRICHED_ROWS,
        artifacts::REPORT_RECORDS,
    ] {
        assert!(task_artifacts.dir().join(name).exists(), "missing {name}");
    }

    let saved =
        std::fs::read_to_string(task_artifacts.dir().join(artifacts::REPORT_RECORDS)).unwrap();
    let records: Value = serde_json::from_str(&saved).unwrap();
    assert_eq!(records[0]["pay_type"], "Budget");
}

fn write_requisitions(path: &Path) {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("March").unwrap();

    sheet.write_string(0, 1, VISIT_DATE).unwrap();
    sheet.write_string(1, 1, "050670").unwrap();
    sheet.write_string(1, 2, "birthdate").unwrap();
    sheet.write_string(2, 1, "INZ-1").unwrap();
    sheet.write_string(2, 2, "SIDOROVA ANNA PETROVNA").unwrap();
    sheet.write_string(2, 3, GLUCOSE_CODE).unwrap();
    sheet.write_string(2, 4, "Glucose").unwrap();
    sheet.write_number(2, 5, 1).unwrap();
    sheet.write_string(2, 6, "350,50").unwrap();

    workbook.save(path).unwrap();
}

#[tokio::test]
async fn test_run_writes_report_and_completes() {
    let harness = Harness::new();
    script_known_patient(&harness.gateway);
    harness
        .gateway
        .respond(Operation::TestReport, report_with_pay_type("2"));

    let input_dir = TempDir::new().unwrap();
    let input = input_dir.path().join("march.xlsx");
    write_requisitions(&input);

    let report_path = harness
        .pipeline
        .run(
            "task-ok",
            &input,
            Some("/api/processing/download/task-ok".to_string()),
        )
        .await
        .expect("task should succeed");

    assert!(report_path.exists());
    assert!(harness
        .results
        .path()
        .join("task-ok")
        .join(artifacts::RAW_ROWS)
        .exists());

    let search = &harness.gateway.requests(Operation::PersonSearch)[0];
    assert_eq!(search["PersonSurName_SurName"], "Sidorova");
    assert_eq!(search["PersonBirthDay_BirthDay"], "05.06.1970");

    let output = SourceWorkbook::open(&report_path).unwrap();
    let names: Vec<&str> = output.sheets.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["March", REPORT_SHEET]);
    let report = &output.sheets[1];
    assert_eq!(report.get(1, 1).map(ToString::to_string).as_deref(), Some("INZ-1"));
    assert_eq!(report.get(1, 8).map(ToString::to_string).as_deref(), Some("Budget"));

    let events = harness.sink.events_for("task-ok");
    let percents: Vec<i32> = events.iter().map(|e| e.progress).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents.first(), Some(&2));
    assert!(percents.contains(&60));

    let last = events.last().unwrap();
    assert_eq!(last.progress, PROGRESS_COMPLETE);
    assert_eq!(
        last.download_url.as_deref(),
        Some("/api/processing/download/task-ok")
    );
}

#[tokio::test]
async fn test_fatal_gateway_failure_aborts_task() {
    let harness = Harness::new();
    script_known_patient(&harness.gateway);
    harness.gateway.fail(Operation::TestHistory, 502);

    let input_dir = TempDir::new().unwrap();
    let input = input_dir.path().join("march.xlsx");
    write_requisitions(&input);

    let result = harness.pipeline.run("task-fatal", &input, None).await;
    assert!(result.is_none());

    let events = harness.sink.events_for("task-fatal");
    let last = events.last().unwrap();
    assert_eq!(last.progress, PROGRESS_FAILED);
    assert!(last.message.starts_with("Critical error:"));
    assert!(last.message.contains("502"));
    assert!(last.download_url.is_none());

    // nothing after the history stage ran
    assert_eq!(harness.gateway.calls(Operation::TestReport), 0);
    assert!(!harness
        .results
        .path()
        .join("task-fatal")
        .join(artifacts::REPORT_FILE)
        .exists());
}

#[tokio::test]
async fn test_unreadable_input_fails_task() {
    let harness = Harness::new();
    let input_dir = TempDir::new().unwrap();
    let input = input_dir.path().join("broken.xlsx");
    std::fs::write(&input, b"not a zip archive").unwrap();

    assert!(harness.pipeline.run("task-broken", &input, None).await.is_none());

    let last = harness.sink.last_event("task-broken").unwrap();
    assert_eq!(last.progress, PROGRESS_FAILED);
    assert_eq!(harness.gateway.total_calls(), 0);
}
