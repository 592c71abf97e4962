use crate::columns::{field, header_index};
use crate::keys::{derive_key, is_all_digits};

/// A (type, subtype, taxonomy code) triple assigned by a rule. All-`None`
/// is a valid outcome: the field-match default case emits rows with empty
/// classification rather than dropping them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub entity_type: Option<&'static str>,
    pub subtype: Option<&'static str>,
    pub nucc_code: Option<&'static str>,
}

impl Classification {
    pub const fn new(
        entity_type: &'static str,
        subtype: &'static str,
        nucc_code: &'static str,
    ) -> Self {
        Self {
            entity_type: Some(entity_type),
            subtype: Some(subtype),
            nucc_code: Some(nucc_code),
        }
    }

    pub const fn empty() -> Self {
        Self {
            entity_type: None,
            subtype: None,
            nucc_code: None,
        }
    }
}

/// One case of a field-match switch. A case carrying several outcomes clones
/// each matching row once per outcome. `catch_all` marks the default case
/// applied to rows no other case matched.
#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub value: &'static str,
    pub outcomes: Vec<Classification>,
    pub catch_all: bool,
}

impl SwitchCase {
    fn matching(value: &'static str, outcome: Classification) -> Self {
        Self {
            value,
            outcomes: vec![outcome],
            catch_all: false,
        }
    }

    fn fanning(value: &'static str, outcomes: Vec<Classification>) -> Self {
        Self {
            value,
            outcomes,
            catch_all: false,
        }
    }

    fn default_case() -> Self {
        Self {
            value: "Default",
            outcomes: vec![Classification::empty()],
            catch_all: true,
        }
    }
}

/// Subrule policies. Rules are data: adding a source means adding a table
/// entry, not touching the evaluator.
#[derive(Debug, Clone)]
pub enum SubrulePolicy {
    /// Partition rows by whether `column` is purely numeric; each partition
    /// gets its own triple and (1-based) key discriminator.
    ConditionalBinary {
        column: &'static str,
        when_numeric: Classification,
        otherwise: Classification,
    },
    /// One entity per (row, flag column equal to "Yes") pair, discriminated
    /// by the 1-based flag index.
    FanOutByFlag {
        flags: Vec<(&'static str, Classification)>,
    },
    /// Match `column` against each case value; list cases clone rows with
    /// compound discriminator `case_index * 10 + outcome_index`.
    FieldMatchSwitch {
        column: &'static str,
        cases: Vec<SwitchCase>,
    },
}

/// Classification rule set for one known source file: an optional flat base
/// triple applied to every row, plus an optional subrule policy. A file may
/// carry both (home-health does).
#[derive(Debug, Clone)]
pub struct SourceRules {
    pub file_name: &'static str,
    pub base: Option<Classification>,
    pub subrules: Option<SubrulePolicy>,
}

/// Rule table for the known CMS source datasets.
pub fn cms_source_rules() -> Vec<SourceRules> {
    vec![
        SourceRules {
            file_name: "dialysis_facility_dataset.csv",
            base: Some(Classification::new("Clinic", "Dialysis Clinic", "261QE0700X")),
            subrules: None,
        },
        SourceRules {
            file_name: "nursing_home_dataset.csv",
            base: Some(Classification::new(
                "Nursing & Assisted Living",
                "Skilled Nursing Facility",
                "314000000X",
            )),
            subrules: None,
        },
        SourceRules {
            file_name: "hospice_dataset.csv",
            base: Some(Classification::new(
                "Agency",
                "Community Based Hospice Care Agency",
                "251G00000X",
            )),
            subrules: None,
        },
        SourceRules {
            file_name: "inpatient_rehabilitation_facility_dataset.csv",
            base: None,
            subrules: Some(SubrulePolicy::ConditionalBinary {
                column: "CMS Certification Number (CCN)",
                when_numeric: Classification::new(
                    "Hospital",
                    "Rehabilitation Hospital",
                    "283X00000X",
                ),
                otherwise: Classification::new(
                    "Hospital Unit",
                    "Rehabilitation Hospital Unit",
                    "273Y00000X",
                ),
            }),
        },
        SourceRules {
            file_name: "long_term_care_hospital_dataset.csv",
            base: Some(Classification::new(
                "Hospital",
                "Long Term Care Hospital",
                "282E00000X",
            )),
            subrules: None,
        },
        SourceRules {
            file_name: "home_health_agency_dataset.csv",
            base: Some(Classification::new(
                "Agency",
                "Home Health Agency (All)",
                "251E00000X",
            )),
            subrules: Some(SubrulePolicy::FanOutByFlag {
                flags: vec![
                    (
                        "Offers Nursing Care Services",
                        Classification::new(
                            "Agency",
                            "Home Health Agency (Nursing Care Services)",
                            "N/A",
                        ),
                    ),
                    (
                        "Offers Physical Therapy Services",
                        Classification::new(
                            "Agency",
                            "Home Health Agency (Physical Therapy)",
                            "N/A",
                        ),
                    ),
                    (
                        "Offers Occupational Therapy Services",
                        Classification::new(
                            "Agency",
                            "Home Health Agency (Occupational Therapy)",
                            "N/A",
                        ),
                    ),
                    (
                        "Offers Speech Pathology Services",
                        Classification::new(
                            "Agency",
                            "Home Health Agency (Speech Pathology)",
                            "N/A",
                        ),
                    ),
                    (
                        "Offers Medical Social Services",
                        Classification::new(
                            "Agency",
                            "Home Health Agency (Medical Social Services)",
                            "N/A",
                        ),
                    ),
                    (
                        "Offers Home Health Aide Services",
                        Classification::new(
                            "Agency",
                            "Home Health Agency (Home Health Aide Services)",
                            "N/A",
                        ),
                    ),
                ],
            }),
        },
        SourceRules {
            file_name: "hospital_general_information_dataset.csv",
            base: None,
            subrules: Some(SubrulePolicy::FieldMatchSwitch {
                column: "Hospital Type",
                cases: vec![
                    SwitchCase::matching(
                        "Acute Care - Veterans Administration",
                        Classification::new("Hospital", "Veterans Affairs (VA) Hospital", "N/A"),
                    ),
                    SwitchCase::matching(
                        "Acute Care Hospitals",
                        Classification::new("Hospital", "General Acute Care Hospital", "282N00000X"),
                    ),
                    SwitchCase::matching(
                        "Childrens",
                        Classification::new("Hospital", "Children's Hospital", "282NC2000X"),
                    ),
                    SwitchCase::matching(
                        "Critical Access Hospitals",
                        Classification::new("Hospital", "Critical Access Hospital", "282NC0060X"),
                    ),
                    SwitchCase::fanning(
                        "Acute Care - Department of Defense",
                        vec![
                            Classification::new("Hospital", "Military Hospital", "286500000X"),
                            Classification::new(
                                "Hospital",
                                "Military General acute care hospital",
                                "2865M2000X",
                            ),
                        ],
                    ),
                    SwitchCase::matching(
                        "Psychiatric",
                        Classification::new("Hospital", "Psychiatric Hospital", "283Q00000X"),
                    ),
                    SwitchCase::default_case(),
                ],
            }),
        },
    ]
}

pub fn rules_for_file(file_name: &str) -> Option<SourceRules> {
    cms_source_rules()
        .into_iter()
        .find(|rules| rules.file_name == file_name)
}

/// One classified entity produced from a source row. `row_index` points back
/// into the evaluated row slice; a fanned-out row appears once per emission.
#[derive(Debug, Clone)]
pub struct ClassifiedEntity {
    pub row_index: usize,
    pub entity_id: u64,
    pub entity_type: Option<String>,
    pub subtype: Option<String>,
    pub nucc_code: Option<String>,
}

#[derive(Debug, Default)]
pub struct FileOutcome {
    pub entities: Vec<ClassifiedEntity>,
    /// Rows that fell through to the switch default case and were emitted
    /// with empty classification.
    pub default_classified: usize,
    /// Declared flag/switch columns absent from the file.
    pub skipped_columns: Vec<String>,
}

fn emit(
    out: &mut FileOutcome,
    row_index: usize,
    base_key: &str,
    discriminator: Option<u32>,
    classification: Classification,
) {
    out.entities.push(ClassifiedEntity {
        row_index,
        entity_id: derive_key(base_key, discriminator),
        entity_type: classification.entity_type.map(str::to_string),
        subtype: classification.subtype.map(str::to_string),
        nucc_code: classification.nucc_code.map(str::to_string),
    });
}

/// Evaluate one file's rule set over its rows. `key_idx` is the resolved
/// natural-key column; rows read an empty key when it is absent.
pub fn apply_file_rules(
    rules: &SourceRules,
    headers: &csv::StringRecord,
    rows: &[csv::StringRecord],
    key_idx: Option<usize>,
) -> FileOutcome {
    let mut out = FileOutcome::default();
    let base_key = |record: &csv::StringRecord| -> String {
        key_idx
            .map(|idx| field(record, idx).to_string())
            .unwrap_or_default()
    };

    if let Some(classification) = rules.base {
        for (row_index, record) in rows.iter().enumerate() {
            emit(&mut out, row_index, &base_key(record), None, classification);
        }
    }

    match &rules.subrules {
        None => {}
        Some(SubrulePolicy::ConditionalBinary {
            column,
            when_numeric,
            otherwise,
        }) => {
            let Some(column_idx) = header_index(headers, column) else {
                out.skipped_columns.push((*column).to_string());
                return out;
            };
            for (row_index, record) in rows.iter().enumerate() {
                let numeric = is_all_digits(field(record, column_idx));
                let (discriminator, classification) = if numeric {
                    (1, *when_numeric)
                } else {
                    (2, *otherwise)
                };
                emit(
                    &mut out,
                    row_index,
                    &base_key(record),
                    Some(discriminator),
                    classification,
                );
            }
        }
        Some(SubrulePolicy::FanOutByFlag { flags }) => {
            for (flag_pos, (column, classification)) in flags.iter().enumerate() {
                let discriminator = flag_pos as u32 + 1;
                let Some(column_idx) = header_index(headers, column) else {
                    out.skipped_columns.push((*column).to_string());
                    continue;
                };
                for (row_index, record) in rows.iter().enumerate() {
                    if field(record, column_idx) == "Yes" {
                        emit(
                            &mut out,
                            row_index,
                            &base_key(record),
                            Some(discriminator),
                            *classification,
                        );
                    }
                }
            }
        }
        Some(SubrulePolicy::FieldMatchSwitch { column, cases }) => {
            let Some(column_idx) = header_index(headers, column) else {
                out.skipped_columns.push((*column).to_string());
                return out;
            };
            let mut matched = vec![false; rows.len()];
            for (case_pos, case) in cases.iter().enumerate() {
                if case.catch_all {
                    continue;
                }
                let case_index = case_pos as u32 + 1;
                for (row_index, record) in rows.iter().enumerate() {
                    if field(record, column_idx) != case.value {
                        continue;
                    }
                    matched[row_index] = true;
                    emit_case_outcomes(&mut out, row_index, &base_key(record), case_index, case);
                }
            }
            if let Some((case_pos, case)) = cases
                .iter()
                .enumerate()
                .find(|(_, case)| case.catch_all)
            {
                let case_index = case_pos as u32 + 1;
                for (row_index, record) in rows.iter().enumerate() {
                    if matched[row_index] {
                        continue;
                    }
                    out.default_classified += 1;
                    emit_case_outcomes(&mut out, row_index, &base_key(record), case_index, case);
                }
            }
        }
    }

    out
}

fn emit_case_outcomes(
    out: &mut FileOutcome,
    row_index: usize,
    base_key: &str,
    case_index: u32,
    case: &SwitchCase,
) {
    if case.outcomes.len() == 1 {
        emit(out, row_index, base_key, Some(case_index), case.outcomes[0]);
    } else {
        for (outcome_pos, outcome) in case.outcomes.iter().enumerate() {
            let discriminator = case_index * 10 + outcome_pos as u32 + 1;
            emit(out, row_index, base_key, Some(discriminator), *outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(columns: &[&str]) -> csv::StringRecord {
        csv::StringRecord::from(columns.to_vec())
    }

    fn ids(outcome: &FileOutcome) -> Vec<u64> {
        outcome.entities.iter().map(|e| e.entity_id).collect()
    }

    fn assert_pairwise_distinct(ids: &[u64]) {
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b, "entity ids must be pairwise distinct: {ids:?}");
            }
        }
    }

    #[test]
    fn flat_rules_classify_every_row() {
        let rules = rules_for_file("dialysis_facility_dataset.csv").expect("rules");
        let headers = headers(&["CMS Certification Number (CCN)", "Facility Name"]);
        let rows = vec![
            csv::StringRecord::from(vec!["012345", "Dialysis A"]),
            csv::StringRecord::from(vec!["678901", "Dialysis B"]),
        ];

        let outcome = apply_file_rules(&rules, &headers, &rows, Some(0));
        assert_eq!(outcome.entities.len(), 2);
        assert_eq!(outcome.entities[0].entity_id, 12_345);
        assert_eq!(outcome.entities[0].entity_type.as_deref(), Some("Clinic"));
        assert_eq!(
            outcome.entities[0].subtype.as_deref(),
            Some("Dialysis Clinic")
        );
        assert_eq!(
            outcome.entities[0].nucc_code.as_deref(),
            Some("261QE0700X")
        );
    }

    #[test]
    fn conditional_binary_partitions_by_numeric_key() {
        let rules = rules_for_file("inpatient_rehabilitation_facility_dataset.csv").expect("rules");
        let headers = headers(&["CMS Certification Number (CCN)", "Facility Name"]);
        let rows = vec![
            csv::StringRecord::from(vec!["123456", "Rehab Hospital"]),
            csv::StringRecord::from(vec!["12T456", "Rehab Unit"]),
        ];

        let outcome = apply_file_rules(&rules, &headers, &rows, Some(0));
        assert_eq!(outcome.entities.len(), 2);
        assert_eq!(
            outcome.entities[0].subtype.as_deref(),
            Some("Rehabilitation Hospital")
        );
        assert_eq!(
            outcome.entities[1].subtype.as_deref(),
            Some("Rehabilitation Hospital Unit")
        );
        assert_pairwise_distinct(&ids(&outcome));
    }

    #[test]
    fn fan_out_by_flag_emits_one_entity_per_satisfied_flag() {
        let rules = rules_for_file("home_health_agency_dataset.csv").expect("rules");
        let headers = headers(&[
            "CMS Certification Number (CCN)",
            "Offers Nursing Care Services",
            "Offers Physical Therapy Services",
            "Offers Occupational Therapy Services",
            "Offers Speech Pathology Services",
            "Offers Medical Social Services",
            "Offers Home Health Aide Services",
        ]);
        let rows = vec![csv::StringRecord::from(vec![
            "447788", "Yes", "Yes", "No", "Yes", "No", "No",
        ])];

        let outcome = apply_file_rules(&rules, &headers, &rows, Some(0));
        // One from the flat base rule plus one per satisfied flag.
        assert_eq!(outcome.entities.len(), 4);
        let subtypes: Vec<_> = outcome
            .entities
            .iter()
            .filter_map(|e| e.subtype.as_deref())
            .collect();
        assert!(subtypes.contains(&"Home Health Agency (All)"));
        assert!(subtypes.contains(&"Home Health Agency (Nursing Care Services)"));
        assert!(subtypes.contains(&"Home Health Agency (Physical Therapy)"));
        assert!(subtypes.contains(&"Home Health Agency (Speech Pathology)"));
        assert_pairwise_distinct(&ids(&outcome));
    }

    #[test]
    fn fan_out_skips_missing_flag_columns() {
        let rules = rules_for_file("home_health_agency_dataset.csv").expect("rules");
        let headers = headers(&[
            "CMS Certification Number (CCN)",
            "Offers Nursing Care Services",
        ]);
        let rows = vec![csv::StringRecord::from(vec!["447788", "Yes"])];

        let outcome = apply_file_rules(&rules, &headers, &rows, Some(0));
        assert_eq!(outcome.entities.len(), 2);
        assert_eq!(outcome.skipped_columns.len(), 5);
    }

    #[test]
    fn field_match_list_case_clones_rows_with_distinct_ids() {
        let rules = rules_for_file("hospital_general_information_dataset.csv").expect("rules");
        let headers = headers(&["Facility ID", "Hospital Type"]);
        let rows = vec![csv::StringRecord::from(vec![
            "06T014",
            "Acute Care - Department of Defense",
        ])];

        let outcome = apply_file_rules(&rules, &headers, &rows, Some(0));
        assert_eq!(outcome.entities.len(), 2);
        assert_eq!(
            outcome.entities[0].subtype.as_deref(),
            Some("Military Hospital")
        );
        assert_eq!(
            outcome.entities[1].subtype.as_deref(),
            Some("Military General acute care hospital")
        );
        assert_pairwise_distinct(&ids(&outcome));
        assert_eq!(outcome.default_classified, 0);
    }

    #[test]
    fn field_match_default_case_emits_null_classification() {
        let rules = rules_for_file("hospital_general_information_dataset.csv").expect("rules");
        let headers = headers(&["Facility ID", "Hospital Type"]);
        let rows = vec![
            csv::StringRecord::from(vec!["100001", "Acute Care Hospitals"]),
            csv::StringRecord::from(vec!["100002", "Some Unknown Type"]),
        ];

        let outcome = apply_file_rules(&rules, &headers, &rows, Some(0));
        assert_eq!(outcome.entities.len(), 2);
        assert_eq!(outcome.default_classified, 1);

        let fallthrough = outcome
            .entities
            .iter()
            .find(|e| e.row_index == 1)
            .expect("default row emitted");
        assert!(fallthrough.entity_type.is_none());
        assert!(fallthrough.subtype.is_none());
        assert!(fallthrough.nucc_code.is_none());
    }

    #[test]
    fn unknown_file_has_no_rules() {
        assert!(rules_for_file("mystery_dataset.csv").is_none());
    }
}
