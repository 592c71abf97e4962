use anyhow::{Context, Result};
use csv::Writer;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::common::{commit_tmp_file, ensure_parent_dir, tmp_path_for};
use crate::model::{flag_str, opt_field};
use crate::store::EntityStore;

#[derive(Debug, Clone, Copy)]
pub struct AuditSummary {
    pub duplicate_fingerprints: usize,
    pub entities_flagged: usize,
}

/// Post-load pass over the merged store: every address fingerprint shared by
/// more than one address row clears `entity_unique_to_address` on all
/// entities whose natural key (ccn or npi) owns one of those addresses. The
/// audit CSV lists every entity left with the flag cleared.
pub fn audit_duplicate_addresses(
    store: &mut dyn EntityStore,
    audit_csv: &Path,
) -> Result<AuditSummary> {
    let addresses = store.load_addresses()?;

    let mut fingerprint_counts: HashMap<u64, usize> = HashMap::new();
    for address in &addresses {
        *fingerprint_counts.entry(address.address_hash).or_insert(0) += 1;
    }
    let duplicate_fingerprints: HashSet<u64> = fingerprint_counts
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(hash, _)| *hash)
        .collect();

    let mut shared_ccns: HashSet<&str> = HashSet::new();
    let mut shared_npis: HashSet<&str> = HashSet::new();
    for address in &addresses {
        if !duplicate_fingerprints.contains(&address.address_hash) {
            continue;
        }
        if let Some(ccn) = address.ccn.as_deref() {
            shared_ccns.insert(ccn);
        }
        if let Some(npi) = address.npi.as_deref() {
            shared_npis.insert(npi);
        }
    }

    let mut entities = store.load_entities()?;
    let mut entities_flagged = 0usize;
    for entity in &mut entities {
        let shares_address = entity
            .ccn
            .as_deref()
            .is_some_and(|ccn| shared_ccns.contains(ccn))
            || entity
                .npi
                .as_deref()
                .is_some_and(|npi| shared_npis.contains(npi));
        if shares_address {
            entity.entity_unique_to_address = false;
            entities_flagged += 1;
        }
    }
    store.replace_entities(&entities)?;

    ensure_parent_dir(audit_csv)?;
    let tmp_path = tmp_path_for(audit_csv);
    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating audit CSV {}", tmp_path.display()))?;
    writer
        .write_record(["ccn", "npi", "entity_unique_to_address"])
        .context("Failed writing audit header")?;
    for entity in entities.iter().filter(|e| !e.entity_unique_to_address) {
        writer
            .write_record([
                opt_field(&entity.ccn),
                opt_field(&entity.npi),
                flag_str(entity.entity_unique_to_address),
            ])
            .with_context(|| format!("Failed writing audit row for {}", entity.entity_id))?;
    }
    writer.flush().context("Failed flushing audit writer")?;
    commit_tmp_file(&tmp_path, audit_csv)?;

    Ok(AuditSummary {
        duplicate_fingerprints: duplicate_fingerprints.len(),
        entities_flagged,
    })
}
