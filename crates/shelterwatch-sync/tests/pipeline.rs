use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use shelterwatch_adapters::{AdapterError, AdapterRegistry, SourceAdapter};
use shelterwatch_core::{AnimalType, ItemDraft, RawCapture, RunStatus, SourceHealth};
use shelterwatch_storage::{ApplyOptions, HistoryStore, StoreReconciler, YamlHistoryStore};
use shelterwatch_sync::{Pipeline, PipelineConfig, RunMode, SourceConfig, SourceRegistry};
use tempfile::{tempdir, TempDir};

const SOURCE: &str = "chiba/chiba-city-cats";

/// Reads `<tr><td>id</td><td>name</td></tr>` rows.
struct RowAdapter;

impl SourceAdapter for RowAdapter {
    fn source_id(&self) -> &str {
        SOURCE
    }

    fn extractor_version(&self) -> &str {
        "rows-v1"
    }

    fn extract(&self, capture: &RawCapture) -> Result<Vec<ItemDraft>, AdapterError> {
        if capture.body.contains("<!-- broken -->") {
            return Err(AdapterError::Message("layout changed".into()));
        }
        Ok(capture
            .body
            .split("<tr><td>")
            .skip(1)
            .filter_map(|row| {
                let mut cells = row.split("</td><td>");
                let id = cells.next()?;
                let name = cells.next()?.split("</td>").next()?;
                Some(ItemDraft {
                    external_id: Some(id.to_string()),
                    name: Some(name.to_string()),
                    animal_type: Some(AnimalType::Cat),
                    ..Default::default()
                })
            })
            .collect())
    }
}

fn listing(rows: &[(&str, &str)]) -> String {
    let mut html = String::from("<html><body><h1>保護猫一覧</h1><table>");
    html.push_str("<tr><th>ID</th><th>名前</th></tr>");
    for (id, name) in rows {
        html.push_str(&format!("<tr><td>{id}</td><td>{name}</td></tr>"));
    }
    html.push_str("</table></body></html>");
    html
}

fn capture(body: impl Into<String>, day: u32) -> RawCapture {
    RawCapture::new(
        SOURCE,
        "https://www.city.chiba.jp/animal/cats.html",
        body,
        Utc.with_ymd_and_hms(2026, 3, day, 6, 0, 0).single().unwrap(),
    )
}

fn registry() -> SourceRegistry {
    SourceRegistry {
        sources: vec![SourceConfig {
            source_id: SOURCE.into(),
            display_name: "千葉市動物保護指導センター（猫）".into(),
            base_url: "https://www.city.chiba.jp/animal/cats.html".into(),
            municipality_id: Some("12100".into()),
            enabled: true,
            expected_selectors: vec!["table tr".into()],
            heading_keywords: vec!["猫".into()],
        }],
    }
}

async fn pipeline(root: &Path) -> Pipeline {
    let root_str = root.display().to_string();
    let config =
        PipelineConfig::from_lookup(|key| (key == "SHELTERWATCH_ROOT").then(|| root_str.clone()));
    let history: Arc<dyn HistoryStore> =
        Arc::new(YamlHistoryStore::new(config.history_file.clone()));
    let store = StoreReconciler::connect("sqlite::memory:").await.unwrap();

    let mut adapters = AdapterRegistry::new();
    adapters.register(RowAdapter);

    Pipeline::new(config, registry(), history, store)
        .unwrap()
        .with_adapters(adapters)
}

async fn setup() -> (TempDir, Pipeline) {
    let dir = tempdir().unwrap();
    let pipeline = pipeline(dir.path()).await;
    (dir, pipeline)
}

#[tokio::test]
async fn full_run_captures_extracts_and_loads() {
    let (_dir, pipeline) = setup().await;
    let rows = [("c-1", "Tama"), ("c-2", "Mike"), ("c-3", "Kuro"), ("c-4", "Shiro")];

    let report = pipeline
        .run_source_with_capture(capture(listing(&rows), 1), RunMode::Full, ApplyOptions::default())
        .await
        .unwrap();

    let entry = report.entry.unwrap();
    assert_eq!(entry.status, RunStatus::Success);
    assert_eq!(entry.stage_counts.capture_count, 4);
    assert_eq!(entry.stage_counts.extract_count, 4);
    assert_eq!(entry.stage_counts.load_count, 4);

    let capture = report.stages.capture.unwrap();
    assert_eq!(capture.expected_count, 4);
    assert!(capture.detection.is_none());
    assert!(capture.archived_path.exists());
    assert!(report.stages.item_set_path.unwrap().exists());
    assert_eq!(report.stages.reconcile.unwrap().inserted, 4);

    let items = pipeline.store().available_items(Some(SOURCE)).await.unwrap();
    assert_eq!(items.len(), 4);

    let history = pipeline.history().load(SOURCE).await.unwrap().unwrap();
    assert!(history.verified);
    assert_eq!(history.total_runs, 1);
}

#[tokio::test]
async fn later_listing_soft_deletes_missing_items_and_flags_the_drop() {
    let (_dir, pipeline) = setup().await;
    let options = ApplyOptions::default();
    pipeline
        .run_source_with_capture(
            capture(listing(&[("c-1", "Tama"), ("c-2", "Mike"), ("c-3", "Kuro")]), 1),
            RunMode::Full,
            options,
        )
        .await
        .unwrap();

    // The page lists three rows but one of them carries no cells the adapter understands.
    let body = listing(&[("c-1", "Tama"), ("c-3", "Kuro")]).replace(
        "</table>",
        "<tr><th colspan=\"2\">お問い合わせ</th></tr></table>",
    );
    let report = pipeline
        .run_source_with_capture(capture(body, 2), RunMode::Full, options)
        .await
        .unwrap();

    let entry = report.entry.unwrap();
    assert_eq!(entry.status, RunStatus::Mismatch);
    assert_eq!(entry.warning.as_deref(), Some("Capture→Extract dropped by 1 (3→2)"));
    assert_eq!(report.stages.reconcile.unwrap().removed, 1);

    let names = pipeline
        .store()
        .available_items(Some(SOURCE))
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.fields.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Tama", "Kuro"]);
}

#[tokio::test]
async fn script_shell_is_archived_with_a_render_warning() {
    let (dir, pipeline) = setup().await;
    let shell = concat!(
        r#"<html><head><script src="/static/js/main.4f2a.js"></script></head>"#,
        r#"<body><div id="root"></div></body></html>"#,
    );

    let report = pipeline
        .run_source_with_capture(capture(shell, 1), RunMode::Full, ApplyOptions::default())
        .await
        .unwrap();

    let detection = report.stages.capture.unwrap().detection.unwrap();
    assert!(detection.requires_dynamic_rendering);
    assert!(detection.signals.empty_root);
    assert_eq!(report.entry.unwrap().status, RunStatus::Empty);

    let source_dir = dir.path().join("data/html").join(SOURCE);
    assert!(source_dir.join("latest_empty.html").exists());
    assert!(source_dir.join("static_EMPTY_WARNING.html").exists());
    assert!(source_dir.join("detection_result.json").exists());
}

#[tokio::test]
async fn extraction_failure_is_recorded_and_propagated() {
    let (_dir, pipeline) = setup().await;
    let body = listing(&[("c-1", "Tama")]) + "<!-- broken -->";

    let err = pipeline
        .run_source_with_capture(capture(body, 1), RunMode::Full, ApplyOptions::default())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("layout changed"));

    let history = pipeline.history().load(SOURCE).await.unwrap().unwrap();
    let latest = history.latest_run().unwrap();
    assert_eq!(latest.status, RunStatus::Error);
    assert_eq!(latest.stage_counts.capture_count, 1);
    assert_eq!(history.error_count, 1);
    assert_eq!(history.health(), SourceHealth::Failing);
}

#[tokio::test]
async fn capture_then_separate_load_carries_counts_forward() {
    let (_dir, pipeline) = setup().await;
    let rows = [("c-1", "Tama"), ("c-2", "Mike")];

    let captured = pipeline
        .run_source_with_capture(
            capture(listing(&rows), 1),
            RunMode::CaptureOnly,
            ApplyOptions::default(),
        )
        .await
        .unwrap();
    assert!(captured.stages.reconcile.is_none());
    assert_eq!(captured.entry.unwrap().stage_counts.load_count, 0);

    let loaded = pipeline
        .run_source(SOURCE, RunMode::LoadOnly, ApplyOptions::default())
        .await
        .unwrap();
    let entry = loaded.entry.unwrap();
    assert_eq!(entry.status, RunStatus::Success);
    assert_eq!(entry.stage_counts.capture_count, 2);
    assert_eq!(entry.stage_counts.extract_count, 2);
    assert_eq!(entry.stage_counts.load_count, 2);

    let summary = pipeline.summary().await.unwrap();
    assert_eq!(summary.healthy.len(), 1);
    assert_eq!(summary.healthy[0].load_count, Some(2));
}

#[tokio::test]
async fn load_without_item_sets_leaves_the_store_alone() {
    let (_dir, pipeline) = setup().await;

    let report = pipeline
        .run_source(SOURCE, RunMode::LoadOnly, ApplyOptions::default())
        .await
        .unwrap();
    assert!(report.stages.reconcile.is_none());
    assert_eq!(report.entry.unwrap().status, RunStatus::Empty);

    assert!(pipeline
        .run_source("nowhere/unknown", RunMode::LoadOnly, ApplyOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn repeated_ids_in_a_listing_show_up_as_a_load_drop() {
    let (_dir, pipeline) = setup().await;
    let rows = [("c-1", "Tama"), ("c-1", "Tama"), ("c-2", "Mike")];

    let report = pipeline
        .run_source_with_capture(capture(listing(&rows), 1), RunMode::Full, ApplyOptions::default())
        .await
        .unwrap();

    let entry = report.entry.unwrap();
    assert_eq!(entry.status, RunStatus::Mismatch);
    assert_eq!(entry.stage_counts.extract_count, 3);
    assert_eq!(entry.stage_counts.load_count, 2);
    assert_eq!(entry.warning.as_deref(), Some("Extract→Load dropped by 1 (3→2)"));
    assert_eq!(report.stages.reconcile.unwrap().duplicates, 1);
}

#[tokio::test]
async fn operator_label_survives_runs_and_shows_in_the_summary() {
    let (_dir, pipeline) = setup().await;
    YamlHistoryStore::new(pipeline.config().history_file.clone())
        .set_display_name(SOURCE, Some("Chiba cats".into()))
        .await
        .unwrap();

    pipeline
        .run_source_with_capture(
            capture(listing(&[("c-1", "Tama")]), 1),
            RunMode::Full,
            ApplyOptions::default(),
        )
        .await
        .unwrap();

    let history = pipeline.history().load(SOURCE).await.unwrap().unwrap();
    assert_eq!(history.display_name.as_deref(), Some("Chiba cats"));
    assert_eq!(history.total_runs, 1);

    let summary = pipeline.summary().await.unwrap();
    assert_eq!(summary.healthy[0].display_name.as_deref(), Some("Chiba cats"));
    assert!(summary
        .render_markdown()
        .contains("`chiba/chiba-city-cats` (Chiba cats)"));
}
