use anyhow::{Context, Result};
use std::path::Path;

use crate::address::{NaturalKeyKind, address_source, extract_address};
use crate::columns::{ColumnMap, field, header_index};
use crate::common::is_blank;
use crate::model::{Entity, field_opt};
use crate::rules::{apply_file_rules, rules_for_file};
use crate::states::StateDictionary;
use crate::store::{EntityStore, MergePolicy, persisted_address_keys};

/// CMS source datasets with classification rule sets, processed in order.
pub const CMS_SOURCE_FILES: [&str; 7] = [
    "dialysis_facility_dataset.csv",
    "home_health_agency_dataset.csv",
    "hospice_dataset.csv",
    "hospital_general_information_dataset.csv",
    "inpatient_rehabilitation_facility_dataset.csv",
    "long_term_care_hospital_dataset.csv",
    "nursing_home_dataset.csv",
];

const CMS_LINE1_COLUMN: &str = "Address Line 1";
const CMS_LINE2_COLUMN: &str = "Address Line 2";
const CCN_COLUMNS: [&str; 2] = ["Facility ID", "CMS Certification Number (CCN)"];
const NAME_COLUMNS: [&str; 2] = ["Facility Name", "Provider Name"];

pub fn cms_column_map() -> ColumnMap {
    ColumnMap::new(vec![
        ("Address", vec![CMS_LINE1_COLUMN, "Provider Address"]),
        ("City", vec!["City/Town"]),
        ("State", vec![]),
        ("ZipCode", vec!["ZIP Code"]),
    ])
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub file_name: String,
    pub rows_read: usize,
    pub rows_kept: usize,
    pub entities_emitted: usize,
    pub addresses_extracted: usize,
    pub addresses_skipped_existing: usize,
    pub default_classified: usize,
    pub skipped: Option<String>,
}

fn skipped(file_name: &str, reason: impl Into<String>) -> ImportSummary {
    ImportSummary {
        file_name: file_name.to_string(),
        skipped: Some(reason.into()),
        ..ImportSummary::default()
    }
}

/// Import one CMS source file: resolve columns, drop rows with blank address
/// components, extract addresses, classify rows, merge entities last-write-wins.
pub fn import_cms_file(
    path: &Path,
    store: &mut dyn EntityStore,
    states: &mut StateDictionary,
    dedup_addresses: bool,
) -> Result<ImportSummary> {
    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or_default()
        .to_string();

    let Some(rules) = rules_for_file(&file_name) else {
        println!("No rules found for file: {file_name}");
        return Ok(skipped(&file_name, "no rule set"));
    };

    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed opening {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed reading headers from {}", path.display()))?
        .clone();

    let column_map = cms_column_map();
    let Some(resolved) = column_map.resolve_required(&headers) else {
        let partial = column_map.resolve(&headers);
        println!(
            "Required columns (or alternatives) not found in {file_name}: {}. Skipping file.",
            column_map.missing(&partial).join(", ")
        );
        return Ok(skipped(&file_name, "required columns unresolved"));
    };
    let source = address_source(&resolved, &headers, CMS_LINE1_COLUMN, CMS_LINE2_COLUMN)
        .context("Resolved columns missing from address source")?;

    let key_idx = CCN_COLUMNS
        .iter()
        .find_map(|name| header_index(&headers, name));
    let name_idx = NAME_COLUMNS
        .iter()
        .find_map(|name| header_index(&headers, name));

    let mut rows_read = 0usize;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.with_context(|| format!("Failed reading record in {}", path.display()))?;
        rows_read += 1;
        let complete = [
            source.address_idx,
            source.city_idx,
            source.state_idx,
            source.zip_idx,
        ]
        .iter()
        .all(|&idx| !is_blank(field(&record, idx)));
        if complete {
            rows.push(record);
        }
    }

    let mut seen_address_keys = if dedup_addresses {
        Some(persisted_address_keys(store)?)
    } else {
        None
    };
    let mut addresses = Vec::new();
    let mut addresses_skipped_existing = 0usize;
    for record in &rows {
        let natural_key = key_idx.map(|idx| field(record, idx));
        let Some(address) = extract_address(
            record,
            &source,
            natural_key,
            NaturalKeyKind::Ccn,
            states,
        ) else {
            continue;
        };
        if let Some(seen) = seen_address_keys.as_mut() {
            let key = (
                address.natural_key().unwrap_or_default().to_string(),
                address.address_hash,
            );
            if !seen.insert(key) {
                addresses_skipped_existing += 1;
                continue;
            }
        }
        addresses.push(address);
    }
    store.append_addresses(&addresses)?;

    let outcome = apply_file_rules(&rules, &headers, &rows, key_idx);
    for column in &outcome.skipped_columns {
        println!("Column '{column}' not found in {file_name}. Skipping subrule.");
    }

    let mut entities = Vec::with_capacity(outcome.entities.len());
    for classified in &outcome.entities {
        let record = &rows[classified.row_index];
        let name = name_idx.map(|idx| field(record, idx)).unwrap_or_default();
        let mut entity = Entity::new(classified.entity_id, name);
        entity.ccn = key_idx.and_then(|idx| field_opt(field(record, idx)));
        entity.entity_type = classified.entity_type.clone();
        entity.subtype = classified.subtype.clone();
        entity.nucc_code = classified.nucc_code.clone();
        entities.push(entity);
    }
    store.merge_entities(&entities, MergePolicy::LastWriteWins)?;

    Ok(ImportSummary {
        file_name,
        rows_read,
        rows_kept: rows.len(),
        entities_emitted: entities.len(),
        addresses_extracted: addresses.len(),
        addresses_skipped_existing,
        default_classified: outcome.default_classified,
        skipped: None,
    })
}

/// Run the import over every known CMS source present in the datasets dir.
/// Per-file failures are reported and do not stop the run.
pub fn import_cms_sources(
    datasets_dir: &Path,
    store: &mut dyn EntityStore,
    states: &mut StateDictionary,
    dedup_addresses: bool,
) -> Result<Vec<ImportSummary>> {
    let mut summaries = Vec::new();
    for file_name in CMS_SOURCE_FILES {
        let path = datasets_dir.join(file_name);
        if !path.exists() {
            println!("Source file {} not found. Skipping.", path.display());
            summaries.push(skipped(file_name, "file not found"));
            continue;
        }
        match import_cms_file(&path, store, states, dedup_addresses) {
            Ok(summary) => {
                if summary.skipped.is_none() {
                    let mut notes = String::new();
                    if summary.default_classified > 0 {
                        notes.push_str(&format!(
                            " ({} default-classified)",
                            summary.default_classified
                        ));
                    }
                    if summary.addresses_skipped_existing > 0 {
                        notes.push_str(&format!(
                            " ({} addresses already persisted)",
                            summary.addresses_skipped_existing
                        ));
                    }
                    println!(
                        "{}: kept {}/{} rows, {} entities, {} addresses{}",
                        summary.file_name,
                        summary.rows_kept,
                        summary.rows_read,
                        summary.entities_emitted,
                        summary.addresses_extracted,
                        notes
                    );
                }
                summaries.push(summary);
            }
            Err(err) => {
                println!("Error processing {}: {err}", path.display());
                summaries.push(skipped(file_name, "error"));
            }
        }
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_dataset(file_name: &str, contents: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "facility_registry_facilities_test_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join(file_name);
        fs::write(&path, contents).expect("write dataset");
        path
    }

    #[test]
    fn imports_flat_source_end_to_end() {
        let path = temp_dataset(
            "dialysis_facility_dataset.csv",
            "CMS Certification Number (CCN),Facility Name,Address Line 1,Address Line 2,City/Town,State,ZIP Code\n\
             012345,Dialysis A,123 Main St,Suite 4,Springfield,IL,627041234\n\
             678901,Dialysis B,456 Oak St,,Metropolis,NY,10001\n\
             999999,No City,789 Pine St,,,CA,90210\n",
        );
        let mut store = SqliteStore::open_in_memory().expect("store");
        let mut states = StateDictionary::default();

        let summary =
            import_cms_file(&path, &mut store, &mut states, false).expect("import succeeds");
        assert!(summary.skipped.is_none());
        assert_eq!(summary.rows_read, 3);
        assert_eq!(summary.rows_kept, 2);
        assert_eq!(summary.entities_emitted, 2);
        assert_eq!(summary.addresses_extracted, 2);

        let entities = store.load_entities().expect("entities");
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_id, 12_345);
        assert_eq!(entities[0].name, "Dialysis A");
        assert_eq!(entities[0].ccn.as_deref(), Some("012345"));
        assert_eq!(entities[0].entity_type.as_deref(), Some("Clinic"));

        let addresses = store.load_addresses().expect("addresses");
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].address, "123 Main St Suite 4");
        assert_eq!(addresses[0].zip_code, "62704");
        assert_eq!(addresses[0].ccn.as_deref(), Some("012345"));
        assert_eq!(states.len(), 2);

        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn reimport_is_idempotent_for_entities() {
        let path = temp_dataset(
            "long_term_care_hospital_dataset.csv",
            "CMS Certification Number (CCN),Facility Name,Address,City/Town,State,ZIP Code\n\
             332006,LTCH A,1 Care Way,Albany,NY,12208\n",
        );
        let mut store = SqliteStore::open_in_memory().expect("store");
        let mut states = StateDictionary::default();

        import_cms_file(&path, &mut store, &mut states, false).expect("first import");
        import_cms_file(&path, &mut store, &mut states, true).expect("second import");

        let entities = store.load_entities().expect("entities");
        assert_eq!(entities.len(), 1);
        // Address dedup was requested on the second run, so the address is
        // not appended twice.
        let addresses = store.load_addresses().expect("addresses");
        assert_eq!(addresses.len(), 1);

        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn file_without_rules_is_skipped() {
        let path = temp_dataset(
            "mystery_dataset.csv",
            "CMS Certification Number (CCN),Address,City/Town,State,ZIP Code\n1,2,3,4,5\n",
        );
        let mut store = SqliteStore::open_in_memory().expect("store");
        let mut states = StateDictionary::default();

        let summary = import_cms_file(&path, &mut store, &mut states, false).expect("skip");
        assert_eq!(summary.skipped.as_deref(), Some("no rule set"));
        assert!(store.load_entities().expect("entities").is_empty());

        fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn file_missing_required_columns_is_skipped() {
        let path = temp_dataset(
            "hospice_dataset.csv",
            "CMS Certification Number (CCN),Facility Name,Address\n1,Hospice A,1 Main St\n",
        );
        let mut store = SqliteStore::open_in_memory().expect("store");
        let mut states = StateDictionary::default();

        let summary = import_cms_file(&path, &mut store, &mut states, false).expect("skip");
        assert_eq!(
            summary.skipped.as_deref(),
            Some("required columns unresolved")
        );

        fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
