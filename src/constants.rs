/// Taxonomy code under which NPPES rows are name-matched against imported
/// CMS hospice entities instead of always materializing new records.
pub const HOSPICE_TAXONOMY_CODE: &str = "251G00000X";

/// Header substring identifying taxonomy-code-bearing NPPES columns.
pub const TAXONOMY_FIELD_KEYWORD: &str = "Taxonomy Code";

/// Classification assigned to reconciled providers whose taxonomy code is
/// missing from the lookup table.
pub const DEFAULT_PROVIDER_TYPE: &str = "Clinical Location";

pub const DEFAULT_GEOCODE_TOKEN_URL: &str = "https://maps-api.apple.com/v1/token";
pub const DEFAULT_GEOCODE_URL: &str = "https://maps-api.apple.com/v1/geocode";
