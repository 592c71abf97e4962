mod address;
mod args;
mod audit;
mod columns;
mod common;
mod constants;
mod facilities;
mod geocode;
mod keys;
mod model;
mod nppes;
mod rules;
mod states;
mod store;

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Client;
use std::{fs, time::Duration};

use args::{Args, StoreBackend};
use audit::audit_duplicate_addresses;
use facilities::import_cms_sources;
use geocode::{GeocodeConfig, geocode_addresses, geocode_targets, write_geocoded_csv};
use nppes::{TaxonomyLookup, run_nppes_reconciliation};
use states::StateDictionary;
use store::{CsvStore, EntityStore, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| args.datasets_dir.join("output"));
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed creating {}", output_dir.display()))?;
    let nppes_csv = args.nppes_csv.clone().unwrap_or_else(|| {
        args.datasets_dir
            .join("filtered")
            .join("nppes_filtered_data.csv")
    });
    let audit_log_csv = args
        .audit_log_csv
        .clone()
        .unwrap_or_else(|| output_dir.join("updated_entities_log.csv"));
    let geocoded_csv = args
        .geocoded_csv
        .clone()
        .unwrap_or_else(|| output_dir.join("geocoded_addresses.csv"));

    let mut store: Box<dyn EntityStore> = match args.store {
        StoreBackend::Csv => Box::new(CsvStore::open(&output_dir)?),
        StoreBackend::Sqlite => Box::new(SqliteStore::open(&args.db_path)?),
    };
    println!("Using {}", store.label());

    let mut states = StateDictionary::from_rows(store.load_states()?);
    println!("State mapping initialized with {} states.", states.len());

    if args.skip_facilities {
        println!("--skip-facilities set; skipping CMS import stage.");
    } else {
        let summaries = import_cms_sources(
            &args.datasets_dir,
            store.as_mut(),
            &mut states,
            args.dedup_addresses,
        )?;
        let files_imported = summaries.iter().filter(|s| s.skipped.is_none()).count();
        let entities: usize = summaries.iter().map(|s| s.entities_emitted).sum();
        let addresses: usize = summaries.iter().map(|s| s.addresses_extracted).sum();
        let default_classified: usize = summaries.iter().map(|s| s.default_classified).sum();
        println!(
            "CMS import complete: {files_imported} files, {entities} entities, {addresses} addresses."
        );
        if default_classified > 0 {
            println!(
                "Note: {default_classified} rows fell through to a default case and carry no classification."
            );
        }
    }

    if args.skip_nppes {
        println!("--skip-nppes set; skipping NPPES reconciliation stage.");
    } else if !nppes_csv.exists() {
        println!(
            "NPPES file {} not found. Skipping reconciliation.",
            nppes_csv.display()
        );
    } else {
        let taxonomy = match &args.taxonomy_csv {
            Some(path) if path.exists() => {
                let lookup = TaxonomyLookup::load(path)?;
                if lookup.is_empty() {
                    println!(
                        "Taxonomy lookup {} yielded no codes; reconciled providers will use the default classification.",
                        path.display()
                    );
                } else {
                    println!(
                        "Loaded {} taxonomy codes from {}.",
                        lookup.len(),
                        path.display()
                    );
                }
                lookup
            }
            Some(path) => {
                println!(
                    "Taxonomy lookup {} not found. Reconciled providers will use the default classification.",
                    path.display()
                );
                TaxonomyLookup::empty()
            }
            None => {
                println!(
                    "No taxonomy lookup provided; reconciled providers will use the default classification."
                );
                TaxonomyLookup::empty()
            }
        };

        let outcome = run_nppes_reconciliation(
            &nppes_csv,
            &taxonomy,
            store.as_mut(),
            &mut states,
            args.dedup_addresses,
            &output_dir,
        )?;
        println!(
            "NPPES reconciliation: {} rows processed, {} updated CMS records, {} new entities, {} new addresses ({} rows had no taxonomy code).",
            outcome.rows_processed,
            outcome.updated.len(),
            outcome.new_entities.len(),
            outcome.new_addresses.len(),
            outcome.rows_without_taxonomy
        );
    }

    store.replace_states(&states.rows())?;
    println!("Saved {} states.", states.len());

    if args.skip_audit {
        println!("--skip-audit set; skipping duplicate-address audit.");
    } else {
        let summary = audit_duplicate_addresses(store.as_mut(), &audit_log_csv)?;
        println!(
            "Duplicate-address audit: {} shared fingerprints, {} entities flagged. Log: {}",
            summary.duplicate_fingerprints,
            summary.entities_flagged,
            audit_log_csv.display()
        );
    }

    if args.geocode {
        let bearer_token = args
            .geocode_bearer_token
            .clone()
            .or_else(|| std::env::var("GEOCODER_BEARER_TOKEN").ok());
        let Some(bearer_token) = bearer_token else {
            println!(
                "No geocoder credential provided (--geocode-bearer-token or GEOCODER_BEARER_TOKEN). Skipping geocoding."
            );
            return Ok(());
        };

        let addresses = store.load_addresses()?;
        let (targets, skipped) = geocode_targets(&addresses, &states);
        if skipped > 0 {
            println!("Skipped {skipped} addresses with unknown state ids.");
        }
        println!("Geocoding {} addresses...", targets.len());

        let client = Client::builder()
            .user_agent("facility-registry/0.1")
            .build()
            .context("Failed creating HTTP client")?;
        let config = GeocodeConfig {
            token_url: args.geocode_token_url.clone(),
            geocode_url: args.geocode_url.clone(),
            bearer_token,
            max_concurrent: args.geocode_concurrency,
            request_timeout: Duration::from_secs(args.geocode_timeout_seconds),
        };
        let results = geocode_addresses(&client, &config, &targets).await?;
        write_geocoded_csv(&geocoded_csv, &results)?;
        println!("Results saved to {}", geocoded_csv.display());
    }

    Ok(())
}
