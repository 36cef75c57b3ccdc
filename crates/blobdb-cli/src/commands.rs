use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context};
use blobdb_journal::{JournalConfig, Txn};
use blobdb_store::{
    dump, read_persistent_file, BlobStore, BlobStoreConfig, BlobStoreService, StoreResult,
    TarBackup,
};
use blobdb_types::BlobId;
use colored::Colorize;
use serde_json::json;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    let config_path = cli.config;
    let config = |store: &StoreArgs| load_config(config_path.as_deref(), store);
    match cli.command {
        Command::Dump(args) => cmd_dump(args, format),
        Command::Add(args) => cmd_add(config(&args.store)?, args, format),
        Command::Get(args) => cmd_get(config(&args.store)?, args),
        Command::Remove(args) => cmd_remove(config(&args.store)?, args, format),
        Command::Copy(args) => cmd_copy(config(&args.store)?, args, format),
        Command::Digest(args) => cmd_digest(config(&args.store)?, args, format),
        Command::Backup(args) => cmd_backup(config(&args.store)?, args, format),
        Command::Vacuum(args) => cmd_vacuum(config(&args)?, format),
        Command::Recover(args) => cmd_recover(config(&args)?, format),
        Command::Stats(args) => cmd_stats(config(&args)?, format),
    }
}

fn load_config(path: Option<&Path>, store: &StoreArgs) -> anyhow::Result<BlobStoreConfig> {
    let mut config = match path {
        Some(path) => BlobStoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BlobStoreConfig::default(),
    };
    if let Some(dir) = &store.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn start(config: BlobStoreConfig) -> anyhow::Result<BlobStoreService> {
    let journal_config = JournalConfig {
        sync_mode: config.sync_mode,
    };
    let data_dir = config.data_dir.clone();
    BlobStoreService::start(config, journal_config)
        .with_context(|| format!("opening blob store in {}", data_dir.display()))
}

/// Run `op` against a started store and shut it down cleanly afterwards.
fn with_service<T>(
    config: BlobStoreConfig,
    op: impl FnOnce(&BlobStoreService) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let service = start(config)?;
    let result = op(&service);
    service.shutdown()?;
    result
}

/// Run `op` in its own transaction, committing on success and aborting on error.
fn in_transaction<T>(
    service: &BlobStoreService,
    op: impl FnOnce(&BlobStore, &Txn) -> StoreResult<T>,
) -> anyhow::Result<T> {
    let txn = service.begin()?;
    match op(service.store(), &txn) {
        Ok(value) => {
            service.commit(txn)?;
            Ok(value)
        }
        Err(e) => {
            service.abort(txn)?;
            Err(e.into())
        }
    }
}

fn parse_id(config: &BlobStoreConfig, id: &str) -> anyhow::Result<BlobId> {
    BlobId::from_hex_with_len(id, config.digest_type.digest_length_bytes())
        .with_context(|| format!("invalid {} blob id: {id}", config.digest_type))
}

fn print_json(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn cmd_dump(args: DumpArgs, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            dump(args.digest, &args.path, &mut out)?;
            out.flush()?;
        }
        OutputFormat::Json => {
            let contents = read_persistent_file(args.digest, &args.path)?;
            let records: Vec<_> = contents
                .records
                .iter()
                .map(|r| json!({ "blob_id": r.blob_id.to_hex(), "reference_count": r.count }))
                .collect();
            print_json(json!({
                "version": contents.version,
                "digest_type": contents.digest_type,
                "records": records,
            }))?;
        }
    }
    Ok(())
}

fn cmd_add(config: BlobStoreConfig, args: AddArgs, format: OutputFormat) -> anyhow::Result<()> {
    let file = File::open(&args.file).with_context(|| format!("opening {}", args.file.display()))?;
    let (id, size) = with_service(config, |service| {
        in_transaction(service, |store, txn| store.add(txn, BufReader::new(file)))
    })?;
    match format {
        OutputFormat::Text => println!("{} Added {} ({} bytes)", "✓".green().bold(), id.to_hex().yellow(), size),
        OutputFormat::Json => print_json(json!({ "blob_id": id.to_hex(), "size": size }))?,
    }
    Ok(())
}

fn cmd_get(config: BlobStoreConfig, args: GetArgs) -> anyhow::Result<()> {
    let id = parse_id(&config, &args.id)?;
    with_service(config, |service| {
        let Some(mut payload) = in_transaction(service, |store, txn| store.get(txn, &id))? else {
            bail!("blob {id} not found");
        };
        match &args.output {
            Some(path) => {
                let mut out = BufWriter::new(File::create(path)?);
                io::copy(&mut payload, &mut out)?;
                out.flush()?;
            }
            None => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                io::copy(&mut payload, &mut out)?;
                out.flush()?;
            }
        }
        Ok(())
    })
}

fn cmd_remove(config: BlobStoreConfig, args: IdArgs, format: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(&config, &args.id)?;
    let remaining = with_service(config, |service| {
        in_transaction(service, |store, txn| {
            store.remove(txn, &id)?;
            Ok(store.ref_count(&id))
        })
    })?;
    match format {
        OutputFormat::Text => match remaining {
            Some(count) => println!("{} Removed reference to {} ({} left)", "✓".green(), id.to_hex().yellow(), count),
            None => println!("{} {} is no longer referenced", "✓".green(), id.to_hex().yellow()),
        },
        OutputFormat::Json => print_json(json!({ "blob_id": id.to_hex(), "reference_count": remaining.unwrap_or(0) }))?,
    }
    Ok(())
}

fn cmd_copy(config: BlobStoreConfig, args: IdArgs, format: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(&config, &args.id)?;
    let count = with_service(config, |service| {
        in_transaction(service, |store, txn| {
            Ok(store.copy(txn, &id)?.and_then(|id| store.ref_count(&id)))
        })
    })?;
    let Some(count) = count else {
        bail!("blob {id} not found");
    };
    match format {
        OutputFormat::Text => println!("{} Copied {} ({} references)", "✓".green(), id.to_hex().yellow(), count),
        OutputFormat::Json => print_json(json!({ "blob_id": id.to_hex(), "reference_count": count }))?,
    }
    Ok(())
}

fn cmd_digest(config: BlobStoreConfig, args: DigestArgs, format: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(&config, &args.id)?;
    let digest = with_service(config, |service| {
        in_transaction(service, |store, txn| store.get_digest(txn, &id, args.digest_type))
    })?;
    let Some(digest) = digest else {
        bail!("blob {id} not found");
    };
    match format {
        OutputFormat::Text => println!("{}  {}", digest.to_hex(), digest.digest_type().to_string().cyan()),
        OutputFormat::Json => print_json(json!({ "blob_id": id.to_hex(), "digest_type": digest.digest_type(), "digest": digest.to_hex() }))?,
    }
    Ok(())
}

fn cmd_backup(config: BlobStoreConfig, args: BackupArgs, format: OutputFormat) -> anyhow::Result<()> {
    let file = File::create(&args.archive)
        .with_context(|| format!("creating {}", args.archive.display()))?;
    let report = with_service(config, |service| {
        let mut backup = TarBackup::new(BufWriter::new(file));
        let report = service.store().backup_to_archive(&mut backup)?;
        backup.finish()?.flush()?;
        Ok(report)
    })?;
    match format {
        OutputFormat::Text => println!(
            "{} Backed up {} payloads ({} bytes) to {}",
            "✓".green().bold(),
            report.payloads,
            report.bytes,
            args.archive.display().to_string().bold()
        ),
        OutputFormat::Json => print_json(serde_json::to_value(report)?)?,
    }
    Ok(())
}

fn cmd_vacuum(config: BlobStoreConfig, format: OutputFormat) -> anyhow::Result<()> {
    let report = with_service(config, |service| Ok(service.store().vacuum()?))?;
    match format {
        OutputFormat::Text => println!(
            "{} Vacuum: {} payloads and {} orphans removed, {} in use",
            "✓".green(),
            report.payloads_removed,
            report.orphans_removed,
            report.in_use_skipped
        ),
        OutputFormat::Json => print_json(serde_json::to_value(report)?)?,
    }
    Ok(())
}

fn cmd_recover(config: BlobStoreConfig, format: OutputFormat) -> anyhow::Result<()> {
    let report = with_service(config, |service| Ok(service.recovery_report().cloned()))?;
    match (format, report) {
        (OutputFormat::Text, None) => println!("{} Journal empty, nothing to recover.", "✓".green()),
        (OutputFormat::Text, Some(r)) => {
            println!("{} Recovery complete", "✓".green().bold());
            println!("  Records scanned: {}", r.entries_scanned);
            println!("  Redone: {}  Undone: {}  Skipped: {}", r.redone, r.undone, r.skipped);
            println!("  Committed transactions: {}", r.committed);
            println!("  Rolled back: {}", r.rolled_back.len().to_string().yellow());
        }
        (OutputFormat::Json, None) => print_json(json!({ "recovered": false }))?,
        (OutputFormat::Json, Some(r)) => print_json(json!({
            "recovered": true,
            "entries_scanned": r.entries_scanned,
            "redone": r.redone,
            "undone": r.undone,
            "skipped": r.skipped,
            "committed": r.committed,
            "rolled_back": r.rolled_back.iter().map(|t| t.get()).collect::<Vec<_>>(),
        }))?,
    }
    Ok(())
}

fn cmd_stats(config: BlobStoreConfig, format: OutputFormat) -> anyhow::Result<()> {
    let digest_type = config.digest_type;
    let stats = with_service(config, |service| Ok(service.store().stats()))?;
    match format {
        OutputFormat::Text => {
            println!("Digest: {}", digest_type.to_string().cyan());
            println!("Live blobs: {}", stats.live_blobs.to_string().bold());
            println!("References: {}", stats.total_references);
            println!("Tombstones: {}", stats.tombstones);
        }
        OutputFormat::Json => print_json(json!({
            "digest_type": digest_type,
            "live_blobs": stats.live_blobs,
            "total_references": stats.total_references,
            "tombstones": stats.tombstones,
        }))?,
    }
    Ok(())
}
