//! Parquet export of the live store with a sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use onemap_core::{EntityRecord, ImportBatch};
use onemap_snapshot::{ADDRESS, AGENT, LATITUDE, LONGITUDE, POLE_NUMBER};
use onemap_storage::{sha256_hex, EntityStore, ImportLedger};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;
use tracing::info;

const EXPORT_PAGE: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub exported_at: DateTime<Utc>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub rows: u64,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `entities.parquet`, `status_history.parquet` and `import_batches.parquet`
/// plus `manifest.json` into `out_dir`. Returns the manifest path.
pub async fn export_parquet(entities: &EntityStore, ledger: &ImportLedger, out_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let mut all = Vec::new();
    let mut scan = entities.scan(EXPORT_PAGE);
    while let Some(page) = scan.next_page().await.context("scanning entities")? {
        all.extend(page);
    }
    let batches = ledger.all().await.context("listing import batches")?;

    let entities_path = out_dir.join("entities.parquet");
    let history_path = out_dir.join("status_history.parquet");
    let batches_path = out_dir.join("import_batches.parquet");

    let history_rows = write_status_history_parquet(&history_path, &all)?;
    write_entities_parquet(&entities_path, &all)?;
    write_batches_parquet(&batches_path, &batches)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        exported_at: Utc::now(),
        files: vec![
            manifest_entry("entities", out_dir, &entities_path, all.len() as u64)?,
            manifest_entry("status_history", out_dir, &history_path, history_rows)?,
            manifest_entry("import_batches", out_dir, &batches_path, batches.len() as u64)?,
        ],
    };

    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(
        entities = all.len(),
        history_rows,
        batches = batches.len(),
        manifest = %manifest_path.display(),
        "parquet export written"
    );
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn attr<'a>(entity: &'a EntityRecord, field: &str) -> Option<&'a str> {
    entity.attributes.get(field).map(String::as_str)
}

fn write_entities_parquet(path: &Path, entities: &[EntityRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_id", DataType::Utf8, false),
        ArrowField::new("current_status", DataType::Utf8, true),
        ArrowField::new("address", DataType::Utf8, true),
        ArrowField::new("pole_number", DataType::Utf8, true),
        ArrowField::new("agent", DataType::Utf8, true),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("history_len", DataType::UInt32, false),
        ArrowField::new("last_snapshot_date", DataType::Utf8, true),
        ArrowField::new("last_import_batch_id", DataType::Utf8, true),
        ArrowField::new("attributes_json", DataType::Utf8, false),
    ]));

    let coordinate = |e: &EntityRecord, field: &str| attr(e, field).and_then(|v| v.trim().parse::<f64>().ok());
    let attributes_json = entities
        .iter()
        .map(|e| serde_json::to_string(&e.attributes))
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("serializing entity attributes")?;

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                entities.iter().map(|e| Some(e.entity_id.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                entities.iter().map(|e| e.current_status.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(entities.iter().map(|e| attr(e, ADDRESS)).collect::<Vec<_>>())),
            Arc::new(StringArray::from(entities.iter().map(|e| attr(e, POLE_NUMBER)).collect::<Vec<_>>())),
            Arc::new(StringArray::from(entities.iter().map(|e| attr(e, AGENT)).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(
                entities.iter().map(|e| coordinate(e, LATITUDE)).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                entities.iter().map(|e| coordinate(e, LONGITUDE)).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                entities
                    .iter()
                    .map(|e| e.status_history.len() as u32)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                entities
                    .iter()
                    .map(|e| e.last_snapshot_date.map(|d| d.to_string()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                entities.iter().map(|e| e.last_import_batch_id.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                attributes_json.iter().map(|j| Some(j.as_str())).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building entities record batch")?;
    write_parquet(path, batch)
}

fn write_status_history_parquet(path: &Path, entities: &[EntityRecord]) -> Result<u64> {
    let rows = entities
        .iter()
        .flat_map(|e| {
            e.status_history
                .iter()
                .enumerate()
                .map(move |(seq, entry)| (e.entity_id.as_str(), seq as u32, entry))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_id", DataType::Utf8, false),
        ArrowField::new("seq", DataType::UInt32, false),
        ArrowField::new("snapshot_date", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("agent", DataType::Utf8, true),
        ArrowField::new("source_file", DataType::Utf8, false),
        ArrowField::new("import_batch_id", DataType::Utf8, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(rows.iter().map(|(id, _, _)| Some(*id)).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(rows.iter().map(|(_, seq, _)| *seq).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|(_, _, e)| Some(e.snapshot_date.to_string()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, _, e)| Some(e.status.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, _, e)| e.agent.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, _, e)| Some(e.source_file.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|(_, _, e)| Some(e.import_batch_id.as_str()))
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building status_history record batch")?;
    write_parquet(path, batch)?;
    Ok(rows.len() as u64)
}

fn write_batches_parquet(path: &Path, batches: &[ImportBatch]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("batch_id", DataType::Utf8, false),
        ArrowField::new("file_name", DataType::Utf8, false),
        ArrowField::new("snapshot_date", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("total_records", DataType::UInt64, false),
        ArrowField::new("new_entities", DataType::UInt64, false),
        ArrowField::new("status_change_count", DataType::UInt64, false),
        ArrowField::new("skipped_records", DataType::UInt64, false),
        ArrowField::new("invalid_records", DataType::UInt64, false),
        ArrowField::new("failed_records", DataType::UInt64, false),
        ArrowField::new("validation_rate", DataType::Float64, false),
        ArrowField::new("degraded", DataType::Boolean, false),
        ArrowField::new("forced", DataType::Boolean, false),
    ]));
    let counts = |f: fn(&ImportBatch) -> u64| UInt64Array::from(batches.iter().map(f).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                batches.iter().map(|b| Some(b.batch_id.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                batches.iter().map(|b| Some(b.file_name.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                batches
                    .iter()
                    .map(|b| Some(b.snapshot_date.to_string()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                batches.iter().map(|b| Some(b.status.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(counts(|b| b.total_records)),
            Arc::new(counts(|b| b.new_entities)),
            Arc::new(counts(|b| b.status_change_count)),
            Arc::new(counts(|b| b.skipped_records)),
            Arc::new(counts(|b| b.invalid_records)),
            Arc::new(counts(|b| b.failed_records)),
            Arc::new(Float64Array::from(
                batches.iter().map(|b| b.validation_rate).collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(batches.iter().map(|b| b.degraded).collect::<Vec<_>>())),
            Arc::new(BooleanArray::from(batches.iter().map(|b| b.forced).collect::<Vec<_>>())),
        ],
    )
    .context("building import_batches record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: u64) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(out_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}
