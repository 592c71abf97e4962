use clap::{Parser, ValueEnum};

use crate::constants::{DEFAULT_GEOCODE_TOKEN_URL, DEFAULT_GEOCODE_URL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Csv,
    Sqlite,
}

#[derive(Debug, Parser)]
#[command(name = "facility_registry")]
#[command(
    about = "Import CMS facility and NPPES provider datasets into a unified entity/address registry"
)]
pub struct Args {
    /// Directory containing the raw CMS source dataset CSVs.
    #[arg(long, default_value = "datasets")]
    pub datasets_dir: std::path::PathBuf,

    /// Output directory for run artifacts (and the CSV store tables).
    /// Defaults to <datasets-dir>/output.
    #[arg(long)]
    pub output_dir: Option<std::path::PathBuf>,

    /// Store backend holding the merged entity/address/state tables.
    #[arg(long, value_enum, default_value_t = StoreBackend::Csv)]
    pub store: StoreBackend,

    /// SQLite database path used with --store sqlite.
    #[arg(long, default_value = "facilities.db")]
    pub db_path: std::path::PathBuf,

    /// Filtered NPPES CSV consumed by the reconciliation stage.
    /// Defaults to <datasets-dir>/filtered/nppes_filtered_data.csv.
    #[arg(long)]
    pub nppes_csv: Option<std::path::PathBuf>,

    /// Taxonomy lookup CSV (code -> type/subtype) used to classify
    /// reconciled providers.
    #[arg(long)]
    pub taxonomy_csv: Option<std::path::PathBuf>,

    /// Audit log CSV for entities whose uniqueness flag was cleared.
    /// Defaults to <output-dir>/updated_entities_log.csv.
    #[arg(long)]
    pub audit_log_csv: Option<std::path::PathBuf>,

    /// Skip appending addresses whose (natural key, fingerprint) pair is
    /// already persisted. Off by default: historical behavior appends one
    /// address row per source row on every run.
    #[arg(long, default_value_t = false)]
    pub dedup_addresses: bool,

    /// Skip the CMS facilities import stage.
    #[arg(long, default_value_t = false)]
    pub skip_facilities: bool,

    /// Skip the NPPES reconciliation stage.
    #[arg(long, default_value_t = false)]
    pub skip_nppes: bool,

    /// Skip the duplicate-address audit pass.
    #[arg(long, default_value_t = false)]
    pub skip_audit: bool,

    /// Geocode the persisted addresses after the import stages.
    #[arg(long, default_value_t = false)]
    pub geocode: bool,

    /// Geocoding results CSV output path.
    /// Defaults to <output-dir>/geocoded_addresses.csv.
    #[arg(long)]
    pub geocoded_csv: Option<std::path::PathBuf>,

    /// Long-lived bearer credential for the geocoding token endpoint.
    /// Falls back to the GEOCODER_BEARER_TOKEN environment variable.
    #[arg(long)]
    pub geocode_bearer_token: Option<String>,

    /// Geocoding token endpoint.
    #[arg(long, default_value = DEFAULT_GEOCODE_TOKEN_URL)]
    pub geocode_token_url: String,

    /// Geocoding endpoint.
    #[arg(long, default_value = DEFAULT_GEOCODE_URL)]
    pub geocode_url: String,

    /// Max concurrent in-flight geocode requests per chunk.
    #[arg(long, default_value_t = 80)]
    pub geocode_concurrency: usize,

    /// Per-request geocode timeout in seconds.
    #[arg(long, default_value_t = 4)]
    pub geocode_timeout_seconds: u64,
}
