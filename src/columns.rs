use std::collections::HashMap;

/// Declarative canonical-name to alternative-column mapping for one source
/// family. Resolution tries the canonical name itself first, then each
/// alternative, against the actual CSV header.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    entries: Vec<(&'static str, Vec<&'static str>)>,
}

impl ColumnMap {
    pub fn new(entries: Vec<(&'static str, Vec<&'static str>)>) -> Self {
        Self { entries }
    }

    pub fn canonical_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(canonical, _)| *canonical)
    }

    /// Resolve every canonical name that has a matching column. Missing
    /// canonical names are simply absent from the result.
    pub fn resolve(&self, headers: &csv::StringRecord) -> ResolvedColumns {
        let mut resolved = HashMap::new();
        for (canonical, alternatives) in &self.entries {
            let candidates = std::iter::once(*canonical).chain(alternatives.iter().copied());
            for candidate in candidates {
                if let Some(index) = header_index(headers, candidate) {
                    resolved.insert(*canonical, (candidate.to_string(), index));
                    break;
                }
            }
        }
        ResolvedColumns { resolved }
    }

    /// Resolve, requiring every canonical name. `None` means the caller
    /// should skip the source with a diagnostic rather than error.
    pub fn resolve_required(&self, headers: &csv::StringRecord) -> Option<ResolvedColumns> {
        let resolved = self.resolve(headers);
        if self
            .canonical_names()
            .all(|canonical| resolved.index_of(canonical).is_some())
        {
            Some(resolved)
        } else {
            None
        }
    }

    pub fn missing(&self, resolved: &ResolvedColumns) -> Vec<&'static str> {
        self.canonical_names()
            .filter(|canonical| resolved.index_of(canonical).is_none())
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedColumns {
    resolved: HashMap<&'static str, (String, usize)>,
}

impl ResolvedColumns {
    pub fn index_of(&self, canonical: &str) -> Option<usize> {
        self.resolved.get(canonical).map(|(_, index)| *index)
    }

    /// The concrete column name the canonical name resolved to.
    pub fn column_name(&self, canonical: &str) -> Option<&str> {
        self.resolved.get(canonical).map(|(name, _)| name.as_str())
    }
}

pub fn header_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|header| header.trim() == name)
}

pub fn field<'r>(record: &'r csv::StringRecord, index: usize) -> &'r str {
    record.get(index).unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cms_map() -> ColumnMap {
        ColumnMap::new(vec![
            ("Address", vec!["Address Line 1", "Provider Address"]),
            ("City", vec!["City/Town"]),
            ("State", vec![]),
            ("ZipCode", vec!["ZIP Code"]),
        ])
    }

    #[test]
    fn resolves_first_present_alternative() {
        let headers = csv::StringRecord::from(vec![
            "Facility ID",
            "Address Line 1",
            "City/Town",
            "State",
            "ZIP Code",
        ]);
        let resolved = cms_map().resolve_required(&headers).expect("all resolved");
        assert_eq!(resolved.column_name("Address"), Some("Address Line 1"));
        assert_eq!(resolved.index_of("Address"), Some(1));
        assert_eq!(resolved.column_name("City"), Some("City/Town"));
        assert_eq!(resolved.index_of("ZipCode"), Some(4));
    }

    #[test]
    fn canonical_name_wins_over_alternatives() {
        let headers =
            csv::StringRecord::from(vec!["Address", "Address Line 1", "City", "State", "ZIP Code"]);
        let resolved = cms_map().resolve_required(&headers).expect("all resolved");
        assert_eq!(resolved.column_name("Address"), Some("Address"));
        assert_eq!(resolved.index_of("Address"), Some(0));
    }

    #[test]
    fn missing_required_column_unresolved() {
        let headers = csv::StringRecord::from(vec!["Address", "City", "State"]);
        let map = cms_map();
        assert!(map.resolve_required(&headers).is_none());
        let partial = map.resolve(&headers);
        assert_eq!(map.missing(&partial), vec!["ZipCode"]);
    }

    #[test]
    fn header_matching_trims_whitespace() {
        let headers = csv::StringRecord::from(vec![" State ", "ZIP Code"]);
        assert_eq!(header_index(&headers, "State"), Some(0));
        assert_eq!(header_index(&headers, "Missing"), None);
    }
}
