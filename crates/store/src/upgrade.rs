//! Offline schema upgrade.
//!
//! Reads every record of an existing database through the degraded path and writes it into a
//! fresh database under the compiled schema. The destination is built in a temporary file next
//! to the output and renamed into place only once it has been committed, so the output path
//! never holds a partial database.

use std::{
    fs,
    ops::Bound,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use snafu::ResultExt;
use tracing::{info, warn};
use tunerdb_types::config::DatabaseConfig;

use crate::{
    db::Database,
    error::{Error, IoSnafu, Result},
    schema::DatabaseSchema,
    tables::{RESERVED_PREFIX, TableKind, prefix_successor},
    transaction::{Direction, ReadAccess},
};

/// Suffix of the destination while it is being written.
const TMP_SUFFIX: &str = ".upgrade-tmp";

/// What to upgrade and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOptions {
    /// Database to read.
    pub input: PathBuf,
    /// Destination. Defaults to upgrading `input` in place.
    pub output: Option<PathBuf>,
    /// Where to keep a copy of the input before it is replaced.
    pub backup: Option<PathBuf>,
    /// Replace an existing output other than the input.
    pub force_overwrite: bool,
}

impl UpgradeOptions {
    /// Upgrades `input` in place without a backup.
    pub fn in_place(input: impl Into<PathBuf>) -> Self {
        Self { input: input.into(), output: None, backup: None, force_overwrite: false }
    }

    fn output(&self) -> &Path {
        self.output.as_deref().unwrap_or(&self.input)
    }
}

/// Result of a successful upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Records copied per record type name.
    pub copied: Vec<(String, u64)>,
    /// Schema differences found in the input.
    pub differences: Vec<String>,
    /// Backup written, if any.
    pub backup: Option<PathBuf>,
    /// Wall time of the upgrade.
    pub elapsed: Duration,
}

impl UpgradeReport {
    /// Total number of records copied.
    pub fn total(&self) -> u64 {
        self.copied.iter().map(|(_, n)| n).sum()
    }
}

fn io_context(path: &Path) -> IoSnafu<String> {
    IoSnafu { path: path.display().to_string() }
}

fn tmp_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Upgrades a database to the compiled schema.
///
/// # Errors
///
/// Returns [`Error::Upgrade`] if the output exists and may not be overwritten, or any error
/// from reading the input or writing the output. On error the temporary destination is removed
/// and the input is left as it was.
pub fn upgrade_database(
    schema: &DatabaseSchema,
    options: &UpgradeOptions,
    config: &DatabaseConfig,
) -> Result<UpgradeReport> {
    let started = Instant::now();
    let output = options.output();
    let in_place = output == options.input;
    if !in_place && output.exists() && !options.force_overwrite {
        return Err(Error::Upgrade {
            reason: format!("{} exists, refusing to overwrite", output.display()),
        });
    }
    info!(
        db = schema.name(),
        input = %options.input.display(),
        output = %output.display(),
        "Starting upgrade"
    );

    let tmp = tmp_path(output);
    let (copied, differences) = match copy_into(schema, &options.input, &tmp, config) {
        Ok(result) => result,
        Err(e) => {
            remove_tmp(&tmp);
            return Err(e);
        },
    };

    let backup = match &options.backup {
        Some(backup) => match make_backup(&options.input, backup) {
            Ok(()) => Some(backup.clone()),
            Err(e) => {
                remove_tmp(&tmp);
                return Err(e);
            },
        },
        None => None,
    };

    if let Err(e) = fs::rename(&tmp, output).context(io_context(output)) {
        remove_tmp(&tmp);
        return Err(e);
    }

    let report = UpgradeReport { copied, differences, backup, elapsed: started.elapsed() };
    info!(
        db = schema.name(),
        output = %output.display(),
        records = report.total(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Upgrade finished"
    );
    Ok(report)
}

fn copy_into(
    schema: &DatabaseSchema,
    input: &Path,
    tmp: &Path,
    config: &DatabaseConfig,
) -> Result<(Vec<(String, u64)>, Vec<String>)> {
    if tmp.exists() {
        fs::remove_file(tmp).context(io_context(tmp))?;
    }
    let source = Database::open_existing(input, schema, config.clone())?;
    let differences = source.schema_differences().to_vec();
    let dest_config = DatabaseConfig { change_log: false, ..config.clone() };
    let dest = Database::open(tmp, schema.clone(), dest_config)?;

    let read = source.read()?;
    check_known_types(&read, schema)?;
    let write = dest.write()?;
    let mut copied = Vec::new();
    for kind in schema.kinds() {
        let n = kind.copy_records(&read, &write)?;
        copied.push((kind.descriptor().name.clone(), n));
    }
    write.commit()?;
    drop(read);
    dest.close()?;
    source.close()?;
    Ok((copied, differences))
}

/// Fails if the source holds records of a type the compiled schema no longer declares.
fn check_known_types<A: ReadAccess>(read: &A, schema: &DatabaseSchema) -> Result<()> {
    let mut from = prefix_successor(&RESERVED_PREFIX);
    while let Some(start) = from {
        let Some((key, _)) = read.seek_raw(TableKind::Data, Bound::Included(&start), Direction::Forward)?
        else {
            break;
        };
        let Some(prefix) = key.get(..4) else {
            return Err(Error::Corrupted { reason: format!("data key of {} bytes", key.len()) });
        };
        let type_id = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        if schema.descriptor(type_id).is_none() {
            return Err(Error::UnknownRecordType { type_id });
        }
        from = prefix_successor(prefix);
    }
    Ok(())
}

fn make_backup(input: &Path, backup: &Path) -> Result<()> {
    if backup.exists() {
        fs::remove_file(backup).context(io_context(backup))?;
    }
    fs::copy(input, backup).context(io_context(backup))?;
    info!(input = %input.display(), backup = %backup.display(), "Backed up input");
    Ok(())
}

fn remove_tmp(tmp: &Path) {
    if tmp.exists() {
        if let Err(e) = fs::remove_file(tmp) {
            warn!(path = %tmp.display(), error = %e, "Failed to remove temporary upgrade output");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use tunerdb_test_utils::TestDir;

    use super::*;
    use crate::transaction::WriteAccess;

    crate::define_record! {
        struct Tag {
            type_id: 71,
            name: "tag",
            primary_key: [1],
            indexes: [],
            fields: {
                1 => id: u16,
            }
        }
    }

    crate::define_record! {
        struct Legacy {
            type_id: 72,
            name: "legacy",
            primary_key: [1],
            indexes: [],
            fields: {
                1 => id: u16,
            }
        }
    }

    fn schema() -> DatabaseSchema {
        DatabaseSchema::new("tags").with::<Tag>()
    }

    #[test]
    fn test_tmp_path_appends_suffix() {
        assert_eq!(tmp_path(Path::new("/data/chdb.redb")), PathBuf::from("/data/chdb.redb.upgrade-tmp"));
    }

    #[test]
    fn test_refuses_existing_output_without_force() {
        let dir = TestDir::new();
        let input = dir.db_path("in");
        let output = dir.db_path("out");
        Database::open(&input, schema(), DatabaseConfig::default()).unwrap().close().unwrap();
        fs::write(&output, b"keep me").unwrap();
        let options = UpgradeOptions { output: Some(output.clone()), ..UpgradeOptions::in_place(&input) };
        let err = upgrade_database(&schema(), &options, &DatabaseConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Upgrade { .. }));
        assert_eq!(fs::read(&output).unwrap(), b"keep me");
    }

    #[test]
    fn test_missing_input_leaves_no_output() {
        let dir = TestDir::new();
        let options = UpgradeOptions {
            output: Some(dir.join("out.redb")),
            ..UpgradeOptions::in_place(dir.join("missing.redb"))
        };
        assert!(upgrade_database(&schema(), &options, &DatabaseConfig::default()).is_err());
        assert!(dir.file_names().is_empty());
    }

    #[test]
    fn test_refuses_records_of_undeclared_type() {
        let dir = TestDir::new();
        let input = dir.db_path("in");
        let output = dir.db_path("out");
        let db = Database::open(&input, schema().with::<Legacy>(), DatabaseConfig::default()).unwrap();
        let write = db.write().unwrap();
        write.put(&Tag { id: 1 }).unwrap();
        write.put(&Legacy { id: 2 }).unwrap();
        write.commit().unwrap();
        db.close().unwrap();

        let options = UpgradeOptions { output: Some(output.clone()), ..UpgradeOptions::in_place(&input) };
        let err = upgrade_database(&schema(), &options, &DatabaseConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownRecordType { type_id: 72 }));
        assert!(!output.exists());
        assert!(!tmp_path(&output).exists());
    }
}
