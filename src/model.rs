/// Employer grouping carried on every entity; `none` for all current sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmployerGroupType {
    None,
    Single,
    Multi,
}

impl EmployerGroupType {
    pub fn as_str(self) -> &'static str {
        match self {
            EmployerGroupType::None => "none",
            EmployerGroupType::Single => "single",
            EmployerGroupType::Multi => "multi",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "single" => EmployerGroupType::Single,
            "multi" => EmployerGroupType::Multi,
            _ => EmployerGroupType::None,
        }
    }
}

/// Normalized facility/provider record in the canonical schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub entity_id: u64,
    pub name: String,
    pub ccn: Option<String>,
    pub npi: Option<String>,
    pub entity_type: Option<String>,
    pub subtype: Option<String>,
    pub nucc_code: Option<String>,
    pub unique_facility_at_location: bool,
    pub employer_group_type: EmployerGroupType,
    pub entity_unique_to_address: bool,
    pub multi_speciality_facility: bool,
    pub multi_speciality_employer: bool,
    pub employer_num: Option<String>,
}

impl Entity {
    /// New entity with the documented per-column defaults.
    pub fn new(entity_id: u64, name: impl Into<String>) -> Self {
        Self {
            entity_id,
            name: name.into(),
            ccn: None,
            npi: None,
            entity_type: None,
            subtype: None,
            nucc_code: None,
            unique_facility_at_location: false,
            employer_group_type: EmployerGroupType::None,
            entity_unique_to_address: true,
            multi_speciality_facility: false,
            multi_speciality_employer: false,
            employer_num: None,
        }
    }
}

pub const ENTITY_COLUMNS: [&str; 13] = [
    "entity_id",
    "name",
    "ccn",
    "npi",
    "entity_type",
    "subtype",
    "nucc_code",
    "unique_facility_at_location",
    "employer_group_type",
    "entity_unique_to_address",
    "multi_speciality_facility",
    "multi_speciality_employer",
    "employer_num",
];

/// Normalized location row. Append-only; never mutated after extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressRecord {
    pub address_id: u64,
    pub npi: Option<String>,
    pub ccn: Option<String>,
    pub address: String,
    pub city: String,
    pub state_id: u32,
    pub zip_code: String,
    pub cms_addr_id: Option<String>,
    pub address_hash: u64,
    pub primary_practice_address: bool,
}

impl AddressRecord {
    /// The source-supplied identifier this address belongs to.
    pub fn natural_key(&self) -> Option<&str> {
        self.ccn.as_deref().or(self.npi.as_deref())
    }
}

pub const ADDRESS_COLUMNS: [&str; 10] = [
    "address_id",
    "npi",
    "ccn",
    "address",
    "city",
    "state_id",
    "zip_code",
    "cms_addr_id",
    "address_hash",
    "primary_practice_address",
];

#[derive(Debug, Clone, PartialEq)]
pub struct StateRow {
    pub state_id: u32,
    pub state_code: String,
    pub state_name: Option<String>,
}

pub const STATE_COLUMNS: [&str; 3] = ["state_id", "state_code", "state_name"];

/// Flags serialize as 0/1 in both stores; reads also accept true/false.
pub fn flag_str(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "True" | "TRUE")
}

pub fn opt_field(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

pub fn field_opt(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_defaults() {
        let entity = Entity::new(42, "Entity A");
        assert!(entity.entity_unique_to_address);
        assert!(!entity.unique_facility_at_location);
        assert!(!entity.multi_speciality_facility);
        assert_eq!(entity.employer_group_type, EmployerGroupType::None);
        assert!(entity.ccn.is_none());
        assert!(entity.npi.is_none());
    }

    #[test]
    fn flag_round_trip() {
        assert_eq!(flag_str(true), "1");
        assert_eq!(flag_str(false), "0");
        assert!(parse_flag("1"));
        assert!(parse_flag("true"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn employer_group_type_round_trip() {
        for value in [
            EmployerGroupType::None,
            EmployerGroupType::Single,
            EmployerGroupType::Multi,
        ] {
            assert_eq!(EmployerGroupType::parse(value.as_str()), value);
        }
        assert_eq!(EmployerGroupType::parse("garbage"), EmployerGroupType::None);
    }

    #[test]
    fn address_natural_key_prefers_ccn() {
        let mut record = AddressRecord {
            address_id: 1,
            npi: Some("1234567890".to_string()),
            ccn: Some("123456".to_string()),
            address: "123 Main St".to_string(),
            city: "Springfield".to_string(),
            state_id: 1,
            zip_code: "62704".to_string(),
            cms_addr_id: None,
            address_hash: 7,
            primary_practice_address: false,
        };
        assert_eq!(record.natural_key(), Some("123456"));
        record.ccn = None;
        assert_eq!(record.natural_key(), Some("1234567890"));
    }
}
