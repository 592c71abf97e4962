use crate::columns::{ResolvedColumns, field, header_index};
use crate::common::is_blank;
use crate::keys::{derive_address_id, address_fingerprint, zip5_truncate};
use crate::model::AddressRecord;
use crate::states::StateDictionary;

/// Which natural-key column owns the extracted addresses for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaturalKeyKind {
    Ccn,
    Npi,
}

/// Resolved column positions for address extraction from one source file.
#[derive(Debug, Clone)]
pub struct AddressSource {
    pub address_idx: usize,
    pub address_column: String,
    pub line1_column: &'static str,
    pub line2_idx: Option<usize>,
    pub city_idx: usize,
    pub state_idx: usize,
    pub zip_idx: usize,
}

/// Build an `AddressSource` from resolved canonical columns. Returns `None`
/// when any of Address/City/State/ZipCode is unresolved; the caller skips
/// the file with a diagnostic.
pub fn address_source(
    resolved: &ResolvedColumns,
    headers: &csv::StringRecord,
    line1_column: &'static str,
    line2_column: &'static str,
) -> Option<AddressSource> {
    Some(AddressSource {
        address_idx: resolved.index_of("Address")?,
        address_column: resolved.column_name("Address")?.to_string(),
        line1_column,
        line2_idx: header_index(headers, line2_column),
        city_idx: resolved.index_of("City")?,
        state_idx: resolved.index_of("State")?,
        zip_idx: resolved.index_of("ZipCode")?,
    })
}

/// Line 1 + line 2 joined with a single space, trimmed of stray separator
/// characters. An empty line 2 yields line 1 exactly.
pub fn join_address_lines(line1: &str, line2: &str) -> String {
    let line1 = line1.trim();
    let line2 = line2.trim();
    if line2.is_empty() {
        line1.to_string()
    } else {
        format!("{line1} {line2}")
            .trim_matches([',', ' '])
            .to_string()
    }
}

/// Normalize one source row into an `AddressRecord`, assigning the state id
/// through the run dictionary. Returns `None` when any address component is
/// blank. Line concatenation only applies when the resolved address column
/// is the source's line-1 variant.
pub fn extract_address(
    record: &csv::StringRecord,
    source: &AddressSource,
    natural_key: Option<&str>,
    key_kind: NaturalKeyKind,
    states: &mut StateDictionary,
) -> Option<AddressRecord> {
    let raw_address = field(record, source.address_idx);
    let city = field(record, source.city_idx);
    let state = field(record, source.state_idx);
    let zip = field(record, source.zip_idx);
    if is_blank(raw_address) || is_blank(city) || is_blank(state) || is_blank(zip) {
        return None;
    }

    let address = if source.address_column == source.line1_column {
        let line2 = source
            .line2_idx
            .map(|idx| field(record, idx))
            .unwrap_or("");
        join_address_lines(raw_address, line2)
    } else {
        raw_address.to_string()
    };

    let key = natural_key.unwrap_or("").trim();
    let address_id = derive_address_id(key, &address, city, state, zip);
    let address_hash = address_fingerprint(&address, city, state, zip);
    let state_id = states.get_or_create(state);

    let (ccn, npi) = match key_kind {
        NaturalKeyKind::Ccn => (non_empty(key), None),
        NaturalKeyKind::Npi => (None, non_empty(key)),
    };

    Some(AddressRecord {
        address_id,
        npi,
        ccn,
        address,
        city: city.to_string(),
        state_id,
        zip_code: zip5_truncate(zip),
        cms_addr_id: None,
        address_hash,
        primary_practice_address: false,
    })
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::ColumnMap;

    fn cms_column_map() -> ColumnMap {
        ColumnMap::new(vec![
            ("Address", vec!["Address Line 1", "Provider Address"]),
            ("City", vec!["City/Town"]),
            ("State", vec![]),
            ("ZipCode", vec!["ZIP Code"]),
        ])
    }

    fn line1_source(headers: &csv::StringRecord) -> AddressSource {
        let resolved = cms_column_map()
            .resolve_required(headers)
            .expect("columns resolve");
        address_source(&resolved, headers, "Address Line 1", "Address Line 2")
            .expect("address source")
    }

    #[test]
    fn concatenates_line_two_with_space() {
        assert_eq!(
            join_address_lines("123 Main St", "Apt 101"),
            "123 Main St Apt 101"
        );
        assert_eq!(join_address_lines("123 Main St,", "Apt 101"), "123 Main St, Apt 101");
    }

    #[test]
    fn empty_line_two_keeps_line_one_exactly() {
        assert_eq!(join_address_lines("123 Main St", ""), "123 Main St");
        assert_eq!(join_address_lines("123 Main St", "   "), "123 Main St");
    }

    #[test]
    fn extracts_with_line_concatenation() {
        let headers = csv::StringRecord::from(vec![
            "Address Line 1",
            "Address Line 2",
            "City/Town",
            "State",
            "ZIP Code",
        ]);
        let source = line1_source(&headers);
        let record =
            csv::StringRecord::from(vec!["123 Main St", "Apt 101", "Springfield", "IL", "627041234"]);
        let mut states = StateDictionary::default();

        let address = extract_address(
            &record,
            &source,
            Some("123456"),
            NaturalKeyKind::Ccn,
            &mut states,
        )
        .expect("address extracted");

        assert_eq!(address.address, "123 Main St Apt 101");
        assert_eq!(address.zip_code, "62704");
        assert_eq!(address.ccn.as_deref(), Some("123456"));
        assert_eq!(address.npi, None);
        assert_eq!(address.state_id, 1);
        assert!(!address.primary_practice_address);
        assert!(address.cms_addr_id.is_none());
    }

    #[test]
    fn plain_address_column_skips_concatenation() {
        let headers = csv::StringRecord::from(vec![
            "Provider Address",
            "Address Line 2",
            "City/Town",
            "State",
            "ZIP Code",
        ]);
        let resolved = cms_column_map()
            .resolve_required(&headers)
            .expect("columns resolve");
        let source = address_source(&resolved, &headers, "Address Line 1", "Address Line 2")
            .expect("address source");
        let record =
            csv::StringRecord::from(vec!["456 Oak St", "IGNORED", "Metropolis", "NY", "10001"]);
        let mut states = StateDictionary::default();

        let address = extract_address(
            &record,
            &source,
            Some("1234567890"),
            NaturalKeyKind::Npi,
            &mut states,
        )
        .expect("address extracted");

        assert_eq!(address.address, "456 Oak St");
        assert_eq!(address.npi.as_deref(), Some("1234567890"));
        assert_eq!(address.ccn, None);
    }

    #[test]
    fn blank_component_skips_row() {
        let headers = csv::StringRecord::from(vec![
            "Address Line 1",
            "Address Line 2",
            "City/Town",
            "State",
            "ZIP Code",
        ]);
        let source = line1_source(&headers);
        let record = csv::StringRecord::from(vec!["123 Main St", "", "Springfield", "", "62704"]);
        let mut states = StateDictionary::default();

        assert!(
            extract_address(
                &record,
                &source,
                Some("123456"),
                NaturalKeyKind::Ccn,
                &mut states
            )
            .is_none()
        );
        assert!(states.is_empty());
    }

    #[test]
    fn same_address_same_id_across_extractions() {
        let headers = csv::StringRecord::from(vec![
            "Address Line 1",
            "Address Line 2",
            "City/Town",
            "State",
            "ZIP Code",
        ]);
        let source = line1_source(&headers);
        let record =
            csv::StringRecord::from(vec!["123 Main St", "", "Springfield", "IL", "62704"]);
        let mut states = StateDictionary::default();

        let first = extract_address(
            &record,
            &source,
            Some("123456"),
            NaturalKeyKind::Ccn,
            &mut states,
        )
        .expect("first");
        let second = extract_address(
            &record,
            &source,
            Some("123456"),
            NaturalKeyKind::Ccn,
            &mut states,
        )
        .expect("second");

        assert_eq!(first.address_id, second.address_id);
        assert_eq!(first.address_hash, second.address_hash);
    }
}
