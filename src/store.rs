use anyhow::{Context, Result};
use csv::Writer;
use rusqlite::{Connection, params};
use std::{
    collections::{HashMap, HashSet},
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

use crate::columns::header_index;
use crate::common::{commit_tmp_file, ensure_parent_dir, tmp_path_for};
use crate::model::{
    ADDRESS_COLUMNS, AddressRecord, ENTITY_COLUMNS, EmployerGroupType, Entity, STATE_COLUMNS,
    StateRow, field_opt, flag_str, opt_field, parse_flag,
};

/// Conflict policy for merging an entity batch into the persisted table.
/// The reconciler depends on the asymmetry: updated records replace what is
/// stored, new records lose to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    LastWriteWins,
    FirstWriteWins,
}

/// Zero-pad a ZIP to 5 characters at load time. The extractor truncates and
/// never pads; the two behaviors are intentionally different per source.
pub fn pad_zip5(zip: &str) -> String {
    let trimmed = zip.trim();
    if trimmed.len() >= 5 {
        trimmed.to_string()
    } else {
        format!("{trimmed:0>5}")
    }
}

/// Drop duplicate entity ids keeping the last occurrence, preserving the
/// relative order of the survivors.
pub fn dedupe_entities_keep_last(entities: Vec<Entity>) -> Vec<Entity> {
    let mut seen: HashSet<u64> = HashSet::new();
    let mut kept: Vec<Entity> = Vec::with_capacity(entities.len());
    for entity in entities.into_iter().rev() {
        if seen.insert(entity.entity_id) {
            kept.push(entity);
        }
    }
    kept.reverse();
    kept
}

/// Merge a batch into an existing table under the given policy. The existing
/// rows are deduped keep-last first, matching the historical merge order.
pub fn merge_entities_in_memory(
    existing: Vec<Entity>,
    batch: &[Entity],
    policy: MergePolicy,
) -> Vec<Entity> {
    let mut merged = dedupe_entities_keep_last(existing);
    let mut index: HashMap<u64, usize> = merged
        .iter()
        .enumerate()
        .map(|(pos, entity)| (entity.entity_id, pos))
        .collect();

    for entity in batch {
        match index.get(&entity.entity_id) {
            Some(&pos) => {
                if policy == MergePolicy::LastWriteWins {
                    merged[pos] = entity.clone();
                }
            }
            None => {
                index.insert(entity.entity_id, merged.len());
                merged.push(entity.clone());
            }
        }
    }
    merged
}

/// Read/replace/append surface shared by the CSV file-store and the SQLite
/// table-store. The reconciliation core only ever talks to this trait.
pub trait EntityStore {
    fn label(&self) -> String;
    fn load_entities(&mut self) -> Result<Vec<Entity>>;
    fn merge_entities(&mut self, batch: &[Entity], policy: MergePolicy) -> Result<()>;
    fn replace_entities(&mut self, entities: &[Entity]) -> Result<()>;
    fn load_addresses(&mut self) -> Result<Vec<AddressRecord>>;
    fn append_addresses(&mut self, batch: &[AddressRecord]) -> Result<()>;
    fn load_states(&mut self) -> Result<Vec<StateRow>>;
    fn replace_states(&mut self, rows: &[StateRow]) -> Result<()>;
}

/// (natural key, fingerprint) pairs already persisted, for optional
/// ingestion-time address dedup.
pub fn persisted_address_keys(store: &mut dyn EntityStore) -> Result<HashSet<(String, u64)>> {
    let mut keys = HashSet::new();
    for address in store.load_addresses()? {
        if let Some(natural_key) = address.natural_key() {
            keys.insert((natural_key.to_string(), address.address_hash));
        }
    }
    Ok(keys)
}

// ---------------------------------------------------------------------------
// CSV file-store
// ---------------------------------------------------------------------------

pub struct CsvStore {
    dir: PathBuf,
}

impl CsvStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("Failed creating {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn entities_path(&self) -> PathBuf {
        self.dir.join("entities.csv")
    }

    fn addresses_path(&self) -> PathBuf {
        self.dir.join("addresses.csv")
    }

    fn states_path(&self) -> PathBuf {
        self.dir.join("states.csv")
    }

    fn write_entities(&self, entities: &[Entity]) -> Result<()> {
        write_entities_csv(&self.entities_path(), entities)
    }
}

/// Write a full entities table in the canonical column order, replacing the
/// target atomically via a sibling tmp file.
pub fn write_entities_csv(path: &Path, entities: &[Entity]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp_path = tmp_path_for(path);
    let mut writer = Writer::from_path(&tmp_path)
        .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
    writer
        .write_record(ENTITY_COLUMNS)
        .context("Failed writing entities header")?;
    for entity in entities {
        writer
            .write_record(entity_record(entity))
            .with_context(|| format!("Failed writing entity {}", entity.entity_id))?;
    }
    writer.flush().context("Failed flushing entities writer")?;
    commit_tmp_file(&tmp_path, path)
}

fn entity_record(entity: &Entity) -> [String; 13] {
    [
        entity.entity_id.to_string(),
        entity.name.clone(),
        opt_field(&entity.ccn).to_string(),
        opt_field(&entity.npi).to_string(),
        opt_field(&entity.entity_type).to_string(),
        opt_field(&entity.subtype).to_string(),
        opt_field(&entity.nucc_code).to_string(),
        flag_str(entity.unique_facility_at_location).to_string(),
        entity.employer_group_type.as_str().to_string(),
        flag_str(entity.entity_unique_to_address).to_string(),
        flag_str(entity.multi_speciality_facility).to_string(),
        flag_str(entity.multi_speciality_employer).to_string(),
        opt_field(&entity.employer_num).to_string(),
    ]
}

fn address_record_fields(address: &AddressRecord) -> [String; 10] {
    [
        address.address_id.to_string(),
        opt_field(&address.npi).to_string(),
        opt_field(&address.ccn).to_string(),
        address.address.clone(),
        address.city.clone(),
        address.state_id.to_string(),
        address.zip_code.clone(),
        opt_field(&address.cms_addr_id).to_string(),
        address.address_hash.to_string(),
        flag_str(address.primary_practice_address).to_string(),
    ]
}

struct CsvColumnIndex {
    indices: Vec<usize>,
}

impl CsvColumnIndex {
    fn resolve(headers: &csv::StringRecord, columns: &[&str], path: &Path) -> Result<Self> {
        let mut indices = Vec::with_capacity(columns.len());
        for column in columns {
            let index = header_index(headers, column).with_context(|| {
                format!("{} is missing required column '{column}'", path.display())
            })?;
            indices.push(index);
        }
        Ok(Self { indices })
    }

    fn get<'r>(&self, record: &'r csv::StringRecord, column: usize) -> &'r str {
        record.get(self.indices[column]).unwrap_or("").trim()
    }
}

impl EntityStore for CsvStore {
    fn label(&self) -> String {
        format!("csv store {}", self.dir.display())
    }

    fn load_entities(&mut self) -> Result<Vec<Entity>> {
        let path = self.entities_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("Failed opening {}", path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("Failed reading headers from {}", path.display()))?
            .clone();
        let columns = CsvColumnIndex::resolve(&headers, &ENTITY_COLUMNS, &path)?;

        let mut entities = Vec::new();
        for record in reader.records() {
            let record =
                record.with_context(|| format!("Failed reading record in {}", path.display()))?;
            let entity_id: u64 = columns.get(&record, 0).parse().with_context(|| {
                format!("Malformed entity_id in {}", path.display())
            })?;
            entities.push(Entity {
                entity_id,
                name: columns.get(&record, 1).to_string(),
                ccn: field_opt(columns.get(&record, 2)),
                npi: field_opt(columns.get(&record, 3)),
                entity_type: field_opt(columns.get(&record, 4)),
                subtype: field_opt(columns.get(&record, 5)),
                nucc_code: field_opt(columns.get(&record, 6)),
                unique_facility_at_location: parse_flag(columns.get(&record, 7)),
                employer_group_type: EmployerGroupType::parse(columns.get(&record, 8)),
                entity_unique_to_address: parse_flag(columns.get(&record, 9)),
                multi_speciality_facility: parse_flag(columns.get(&record, 10)),
                multi_speciality_employer: parse_flag(columns.get(&record, 11)),
                employer_num: field_opt(columns.get(&record, 12)),
            });
        }
        Ok(entities)
    }

    fn merge_entities(&mut self, batch: &[Entity], policy: MergePolicy) -> Result<()> {
        let existing = self.load_entities()?;
        let merged = merge_entities_in_memory(existing, batch, policy);
        self.write_entities(&merged)
    }

    fn replace_entities(&mut self, entities: &[Entity]) -> Result<()> {
        self.write_entities(entities)
    }

    fn load_addresses(&mut self) -> Result<Vec<AddressRecord>> {
        let path = self.addresses_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("Failed opening {}", path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("Failed reading headers from {}", path.display()))?
            .clone();
        let columns = CsvColumnIndex::resolve(&headers, &ADDRESS_COLUMNS, &path)?;

        let mut addresses = Vec::new();
        for record in reader.records() {
            let record =
                record.with_context(|| format!("Failed reading record in {}", path.display()))?;
            addresses.push(AddressRecord {
                address_id: columns.get(&record, 0).parse().with_context(|| {
                    format!("Malformed address_id in {}", path.display())
                })?,
                npi: field_opt(columns.get(&record, 1)),
                ccn: field_opt(columns.get(&record, 2)),
                address: columns.get(&record, 3).to_string(),
                city: columns.get(&record, 4).to_string(),
                state_id: columns.get(&record, 5).parse().with_context(|| {
                    format!("Malformed state_id in {}", path.display())
                })?,
                zip_code: columns.get(&record, 6).to_string(),
                cms_addr_id: field_opt(columns.get(&record, 7)),
                address_hash: columns.get(&record, 8).parse().with_context(|| {
                    format!("Malformed address_hash in {}", path.display())
                })?,
                primary_practice_address: parse_flag(columns.get(&record, 9)),
            });
        }
        Ok(addresses)
    }

    fn append_addresses(&mut self, batch: &[AddressRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let path = self.addresses_path();
        ensure_parent_dir(&path)?;
        let mut writer = if path.exists() {
            let file = OpenOptions::new()
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed opening {} for append", path.display()))?;
            Writer::from_writer(file)
        } else {
            let mut writer = Writer::from_path(&path)
                .with_context(|| format!("Failed creating {}", path.display()))?;
            writer
                .write_record(ADDRESS_COLUMNS)
                .context("Failed writing addresses header")?;
            writer
        };
        for address in batch {
            writer
                .write_record(address_record_fields(address))
                .with_context(|| format!("Failed writing address {}", address.address_id))?;
        }
        writer.flush().context("Failed flushing addresses writer")
    }

    fn load_states(&mut self) -> Result<Vec<StateRow>> {
        let path = self.states_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("Failed opening {}", path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("Failed reading headers from {}", path.display()))?
            .clone();
        let columns = CsvColumnIndex::resolve(&headers, &STATE_COLUMNS, &path)?;

        let mut rows = Vec::new();
        for record in reader.records() {
            let record =
                record.with_context(|| format!("Failed reading record in {}", path.display()))?;
            rows.push(StateRow {
                state_id: columns.get(&record, 0).parse().with_context(|| {
                    format!("Malformed state_id in {}", path.display())
                })?,
                state_code: columns.get(&record, 1).to_string(),
                state_name: field_opt(columns.get(&record, 2)),
            });
        }
        Ok(rows)
    }

    fn replace_states(&mut self, rows: &[StateRow]) -> Result<()> {
        let path = self.states_path();
        ensure_parent_dir(&path)?;
        let tmp_path = tmp_path_for(&path);
        let mut writer = Writer::from_path(&tmp_path)
            .with_context(|| format!("Failed creating {}", tmp_path.display()))?;
        writer
            .write_record(STATE_COLUMNS)
            .context("Failed writing states header")?;
        for row in rows {
            writer
                .write_record([
                    row.state_id.to_string(),
                    row.state_code.clone(),
                    row.state_name.clone().unwrap_or_default(),
                ])
                .with_context(|| format!("Failed writing state {}", row.state_code))?;
        }
        writer.flush().context("Failed flushing states writer")?;
        commit_tmp_file(&tmp_path, &path)
    }
}

// ---------------------------------------------------------------------------
// SQLite table-store
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Connection,
    label: String,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening store DB {}", path.display()))?;
        Self::init(conn, format!("sqlite store {}", path.display()))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed opening in-memory store DB")?;
        Self::init(conn, "sqlite store (memory)".to_string())
    }

    fn init(conn: Connection, label: String) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS entities (
                entity_id INTEGER PRIMARY KEY,
                name TEXT,
                ccn TEXT,
                npi TEXT,
                entity_type TEXT,
                subtype TEXT,
                nucc_code TEXT,
                unique_facility_at_location INTEGER NOT NULL DEFAULT 0,
                employer_group_type TEXT NOT NULL DEFAULT 'none',
                entity_unique_to_address INTEGER NOT NULL DEFAULT 1,
                multi_speciality_facility INTEGER NOT NULL DEFAULT 0,
                multi_speciality_employer INTEGER NOT NULL DEFAULT 0,
                employer_num TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_entities_nucc_code ON entities(nucc_code);
            CREATE TABLE IF NOT EXISTS addresses (
                address_id INTEGER NOT NULL,
                npi TEXT,
                ccn TEXT,
                address TEXT NOT NULL,
                city TEXT NOT NULL,
                state_id INTEGER NOT NULL,
                zip_code TEXT NOT NULL,
                cms_addr_id TEXT,
                address_hash INTEGER NOT NULL,
                primary_practice_address INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_addresses_hash ON addresses(address_hash);
            CREATE TABLE IF NOT EXISTS states (
                state_id INTEGER PRIMARY KEY,
                state_code TEXT NOT NULL UNIQUE,
                state_name TEXT
            );
            ",
        )
        .context("Failed initializing store schema")?;
        Ok(Self { conn, label })
    }
}

const ENTITY_INSERT_COLUMNS: &str = "
    entity_id, name, ccn, npi, entity_type, subtype, nucc_code,
    unique_facility_at_location, employer_group_type, entity_unique_to_address,
    multi_speciality_facility, multi_speciality_employer, employer_num
";

fn execute_entity(stmt: &mut rusqlite::Statement<'_>, entity: &Entity) -> rusqlite::Result<usize> {
    stmt.execute(params![
        entity.entity_id as i64,
        entity.name,
        entity.ccn,
        entity.npi,
        entity.entity_type,
        entity.subtype,
        entity.nucc_code,
        entity.unique_facility_at_location as i64,
        entity.employer_group_type.as_str(),
        entity.entity_unique_to_address as i64,
        entity.multi_speciality_facility as i64,
        entity.multi_speciality_employer as i64,
        entity.employer_num,
    ])
}

impl EntityStore for SqliteStore {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn load_entities(&mut self) -> Result<Vec<Entity>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ENTITY_INSERT_COLUMNS} FROM entities ORDER BY rowid"
            ))
            .context("Failed preparing entities query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Entity {
                    entity_id: row.get::<_, i64>(0)? as u64,
                    name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    ccn: row.get(2)?,
                    npi: row.get(3)?,
                    entity_type: row.get(4)?,
                    subtype: row.get(5)?,
                    nucc_code: row.get(6)?,
                    unique_facility_at_location: row.get::<_, i64>(7)? != 0,
                    employer_group_type: EmployerGroupType::parse(
                        &row.get::<_, String>(8)?,
                    ),
                    entity_unique_to_address: row.get::<_, i64>(9)? != 0,
                    multi_speciality_facility: row.get::<_, i64>(10)? != 0,
                    multi_speciality_employer: row.get::<_, i64>(11)? != 0,
                    employer_num: row.get(12)?,
                })
            })
            .context("Failed querying entities")?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(row.context("Failed reading entity row")?);
        }
        Ok(entities)
    }

    fn merge_entities(&mut self, batch: &[Entity], policy: MergePolicy) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let sql = match policy {
            MergePolicy::LastWriteWins => format!(
                "
                INSERT INTO entities ({ENTITY_INSERT_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(entity_id) DO UPDATE SET
                    name = excluded.name,
                    ccn = excluded.ccn,
                    npi = excluded.npi,
                    entity_type = excluded.entity_type,
                    subtype = excluded.subtype,
                    nucc_code = excluded.nucc_code,
                    unique_facility_at_location = excluded.unique_facility_at_location,
                    employer_group_type = excluded.employer_group_type,
                    entity_unique_to_address = excluded.entity_unique_to_address,
                    multi_speciality_facility = excluded.multi_speciality_facility,
                    multi_speciality_employer = excluded.multi_speciality_employer,
                    employer_num = excluded.employer_num
                "
            ),
            MergePolicy::FirstWriteWins => format!(
                "
                INSERT OR IGNORE INTO entities ({ENTITY_INSERT_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "
            ),
        };

        let tx = self
            .conn
            .transaction()
            .context("Failed starting entity merge transaction")?;
        {
            let mut stmt = tx.prepare(&sql).context("Failed preparing entity merge")?;
            for entity in batch {
                execute_entity(&mut stmt, entity)
                    .with_context(|| format!("Failed merging entity {}", entity.entity_id))?;
            }
        }
        tx.commit().context("Failed committing entity merge")
    }

    fn replace_entities(&mut self, entities: &[Entity]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("Failed starting entity replace transaction")?;
        tx.execute("DELETE FROM entities", [])
            .context("Failed clearing entities")?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT INTO entities ({ENTITY_INSERT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ))
                .context("Failed preparing entity insert")?;
            for entity in entities {
                execute_entity(&mut stmt, entity)
                    .with_context(|| format!("Failed inserting entity {}", entity.entity_id))?;
            }
        }
        tx.commit().context("Failed committing entity replace")
    }

    fn load_addresses(&mut self) -> Result<Vec<AddressRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT address_id, npi, ccn, address, city, state_id, zip_code,
                       cms_addr_id, address_hash, primary_practice_address
                FROM addresses ORDER BY rowid
                ",
            )
            .context("Failed preparing addresses query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AddressRecord {
                    address_id: row.get::<_, i64>(0)? as u64,
                    npi: row.get(1)?,
                    ccn: row.get(2)?,
                    address: row.get(3)?,
                    city: row.get(4)?,
                    state_id: row.get::<_, i64>(5)? as u32,
                    zip_code: row.get(6)?,
                    cms_addr_id: row.get(7)?,
                    address_hash: row.get::<_, i64>(8)? as u64,
                    primary_practice_address: row.get::<_, i64>(9)? != 0,
                })
            })
            .context("Failed querying addresses")?;

        let mut addresses = Vec::new();
        for row in rows {
            addresses.push(row.context("Failed reading address row")?);
        }
        Ok(addresses)
    }

    fn append_addresses(&mut self, batch: &[AddressRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction()
            .context("Failed starting address append transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    "
                    INSERT INTO addresses (
                        address_id, npi, ccn, address, city, state_id, zip_code,
                        cms_addr_id, address_hash, primary_practice_address
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    ",
                )
                .context("Failed preparing address insert")?;
            for address in batch {
                stmt.execute(params![
                    address.address_id as i64,
                    address.npi,
                    address.ccn,
                    address.address,
                    address.city,
                    address.state_id as i64,
                    pad_zip5(&address.zip_code),
                    address.cms_addr_id,
                    address.address_hash as i64,
                    address.primary_practice_address as i64,
                ])
                .with_context(|| format!("Failed inserting address {}", address.address_id))?;
            }
        }
        tx.commit().context("Failed committing address append")
    }

    fn load_states(&mut self) -> Result<Vec<StateRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT state_id, state_code, state_name FROM states ORDER BY state_id")
            .context("Failed preparing states query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StateRow {
                    state_id: row.get::<_, i64>(0)? as u32,
                    state_code: row.get(1)?,
                    state_name: row.get(2)?,
                })
            })
            .context("Failed querying states")?;

        let mut states = Vec::new();
        for row in rows {
            states.push(row.context("Failed reading state row")?);
        }
        Ok(states)
    }

    fn replace_states(&mut self, rows: &[StateRow]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .context("Failed starting state replace transaction")?;
        tx.execute("DELETE FROM states", [])
            .context("Failed clearing states")?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO states (state_id, state_code, state_name) VALUES (?1, ?2, ?3)",
                )
                .context("Failed preparing state insert")?;
            for row in rows {
                stmt.execute(params![row.state_id as i64, row.state_code, row.state_name])
                    .with_context(|| format!("Failed inserting state {}", row.state_code))?;
            }
        }
        tx.commit().context("Failed committing state replace")
    }
}
