use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::address::{AddressSource, NaturalKeyKind, address_source, extract_address};
use crate::columns::{ColumnMap, field, header_index};
use crate::common::is_blank;
use crate::constants::{DEFAULT_PROVIDER_TYPE, HOSPICE_TAXONOMY_CODE, TAXONOMY_FIELD_KEYWORD};
use crate::keys::derive_key;
use crate::model::{AddressRecord, Entity, field_opt};
use crate::states::StateDictionary;
use crate::store::{EntityStore, MergePolicy, persisted_address_keys, write_entities_csv};

const NPPES_LINE1_COLUMN: &str = "Provider First Line Business Practice Location Address";
const NPPES_LINE2_COLUMN: &str = "Provider Second Line Business Practice Location Address";

/// Organization name fields tried in order for both name matching and new
/// entity naming.
const NAME_COLUMNS: [&str; 3] = [
    "Provider Organization Name (Legal Business Name)",
    "Parent Organization LBN",
    "Provider Other Organization Name",
];

pub fn nppes_column_map() -> ColumnMap {
    ColumnMap::new(vec![
        ("Address", vec![NPPES_LINE1_COLUMN]),
        ("City", vec!["Provider Business Practice Location Address City Name"]),
        ("State", vec!["Provider Business Practice Location Address State Name"]),
        ("ZipCode", vec!["Provider Business Practice Location Address Postal Code"]),
    ])
}

/// External reference table mapping taxonomy codes to type/subtype pairs.
#[derive(Debug, Default)]
pub struct TaxonomyLookup {
    map: HashMap<String, (Option<String>, Option<String>)>,
}

impl TaxonomyLookup {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed opening taxonomy lookup {}", path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("Failed reading headers from {}", path.display()))?
            .clone();

        let column_map = ColumnMap::new(vec![
            ("code", vec!["Code"]),
            ("type", vec!["Type", "Grouping"]),
            ("subtype", vec!["Subtype", "Classification"]),
        ]);
        let Some(resolved) = column_map.resolve_required(&headers) else {
            let partial = column_map.resolve(&headers);
            println!(
                "Taxonomy lookup {} is missing columns: {}. Reconciled providers will use the default classification.",
                path.display(),
                column_map.missing(&partial).join(", ")
            );
            return Ok(Self::empty());
        };
        let code_idx = resolved.index_of("code").unwrap_or_default();
        let type_idx = resolved.index_of("type").unwrap_or_default();
        let subtype_idx = resolved.index_of("subtype").unwrap_or_default();

        let mut map = HashMap::new();
        for record in reader.records() {
            let record =
                record.with_context(|| format!("Failed reading record in {}", path.display()))?;
            let code = field(&record, code_idx);
            if is_blank(code) {
                continue;
            }
            map.insert(
                code.to_string(),
                (
                    field_opt(field(&record, type_idx)),
                    field_opt(field(&record, subtype_idx)),
                ),
            );
        }
        Ok(Self { map })
    }

    /// Type/subtype for a code, falling back to the generic clinical-location
    /// type with no subtype when the code is unknown.
    pub fn classify(&self, code: &str) -> (String, Option<String>) {
        match self.map.get(code) {
            Some((entity_type, subtype)) => (
                entity_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PROVIDER_TYPE.to_string()),
                subtype.clone(),
            ),
            None => (DEFAULT_PROVIDER_TYPE.to_string(), None),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub updated: Vec<Entity>,
    pub new_entities: Vec<Entity>,
    pub new_addresses: Vec<AddressRecord>,
    pub rows_processed: usize,
    pub rows_without_taxonomy: usize,
}

/// Columns carrying taxonomy codes, identified by header substring.
pub fn taxonomy_field_indices(headers: &csv::StringRecord) -> Vec<usize> {
    let keyword = TAXONOMY_FIELD_KEYWORD.to_ascii_lowercase();
    headers
        .iter()
        .enumerate()
        .filter(|(_, header)| header.to_ascii_lowercase().contains(&keyword))
        .map(|(index, _)| index)
        .collect()
}

fn names_match(provider_name: &str, entity_name: &str) -> bool {
    provider_name
        .trim()
        .eq_ignore_ascii_case(entity_name.trim())
}

/// Reconcile provider registry rows against already-imported entities.
///
/// Per row: repeated taxonomy values are nulled after their first occurrence;
/// each surviving code either backfills the npi of a name-matched hospice
/// entity or materializes a new entity. One address is extracted per row,
/// attached only when the row produced at least one new entity.
pub fn reconcile_rows(
    headers: &csv::StringRecord,
    rows: &[csv::StringRecord],
    existing: &[Entity],
    taxonomy: &TaxonomyLookup,
    states: &mut StateDictionary,
) -> ReconcileOutcome {
    let taxonomy_idxs = taxonomy_field_indices(headers);
    let name_idxs: Vec<usize> = NAME_COLUMNS
        .iter()
        .filter_map(|name| header_index(headers, name))
        .collect();
    let npi_idx = header_index(headers, "NPI");
    let source: Option<AddressSource> = nppes_column_map()
        .resolve_required(headers)
        .and_then(|resolved| {
            address_source(&resolved, headers, NPPES_LINE1_COLUMN, NPPES_LINE2_COLUMN)
        });

    let mut by_code: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, entity) in existing.iter().enumerate() {
        if let Some(code) = entity.nucc_code.as_deref() {
            by_code.entry(code).or_default().push(index);
        }
    }

    let mut outcome = ReconcileOutcome::default();
    for record in rows {
        outcome.rows_processed += 1;
        let npi = npi_idx.map(|idx| field(record, idx)).unwrap_or_default();

        let mut seen_codes: HashSet<&str> = HashSet::new();
        let mut row_codes = Vec::new();
        for &idx in &taxonomy_idxs {
            let code = field(record, idx);
            if is_blank(code) {
                continue;
            }
            // A code repeated across fields of one row counts once.
            if seen_codes.insert(code) {
                row_codes.push(code);
            }
        }
        if row_codes.is_empty() {
            outcome.rows_without_taxonomy += 1;
            continue;
        }

        let mut row_materialized_new = false;
        for code in row_codes {
            let matched_update = code == HOSPICE_TAXONOMY_CODE
                && by_code.get(code).is_some_and(|matches| {
                    matches.iter().any(|&entity_idx| {
                        let entity = &existing[entity_idx];
                        let hit = name_idxs.iter().any(|&name_idx| {
                            let provider_name = field(record, name_idx);
                            !is_blank(provider_name) && names_match(provider_name, &entity.name)
                        });
                        if hit {
                            let mut updated = entity.clone();
                            updated.npi = field_opt(npi);
                            outcome.updated.push(updated);
                        }
                        hit
                    })
                });
            if matched_update {
                continue;
            }

            let name = name_idxs
                .iter()
                .map(|&idx| field(record, idx))
                .find(|value| !is_blank(value))
                .unwrap_or_default();
            let (entity_type, subtype) = taxonomy.classify(code);
            let mut entity = Entity::new(derive_key(npi, None), name);
            entity.npi = field_opt(npi);
            entity.nucc_code = Some(code.to_string());
            entity.entity_type = Some(entity_type);
            entity.subtype = subtype;
            outcome.new_entities.push(entity);
            row_materialized_new = true;
        }

        if row_materialized_new {
            if let Some(source) = &source {
                if let Some(address) =
                    extract_address(record, source, Some(npi), NaturalKeyKind::Npi, states)
                {
                    outcome.new_addresses.push(address);
                }
            }
        }
    }

    outcome
}

/// Full reconciliation stage: read the filtered NPPES CSV, reconcile against
/// the persisted entities, merge back (updates last-write-wins, new records
/// first-write-wins), append addresses, and write the run artifacts.
pub fn run_nppes_reconciliation(
    nppes_csv: &Path,
    taxonomy: &TaxonomyLookup,
    store: &mut dyn EntityStore,
    states: &mut StateDictionary,
    dedup_addresses: bool,
    output_dir: &Path,
) -> Result<ReconcileOutcome> {
    let mut reader = csv::Reader::from_path(nppes_csv)
        .with_context(|| format!("Failed opening NPPES CSV {}", nppes_csv.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed reading headers from {}", nppes_csv.display()))?
        .clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(
            record.with_context(|| format!("Failed reading record in {}", nppes_csv.display()))?,
        );
    }

    let existing = store.load_entities()?;
    let mut outcome = reconcile_rows(&headers, &rows, &existing, taxonomy, states);

    store.merge_entities(&outcome.updated, MergePolicy::LastWriteWins)?;
    store.merge_entities(&outcome.new_entities, MergePolicy::FirstWriteWins)?;

    if dedup_addresses {
        let mut seen = persisted_address_keys(store)?;
        outcome.new_addresses.retain(|address| {
            let key = (
                address.natural_key().unwrap_or_default().to_string(),
                address.address_hash,
            );
            seen.insert(key)
        });
    }
    store.append_addresses(&outcome.new_addresses)?;

    write_entities_csv(&output_dir.join("updated_cms_data.csv"), &outcome.updated)?;
    write_entities_csv(&output_dir.join("new_entities.csv"), &outcome.new_entities)?;

    Ok(outcome)
}
