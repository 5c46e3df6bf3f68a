use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use courier::file::{NioSequentialFileFactory, SequentialFileFactory};
use courier::journal::record::{scan_file, RecordType, ScanEnd};
use courier::journal::{Journal, JournalConfig};
use courier::management::ServerControl;
use courier::{Broker, Configuration};

#[derive(Parser)]
#[command(name = "courier-cli", version, about = "Courier broker tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the records of every journal file in a directory.
    Inspect {
        journal_dir: PathBuf,
        #[arg(long = "extension", default_value = "cjr")]
        extension: String,
        #[arg(long = "records")]
        records: bool,
    },
    /// Start a broker from a configuration file and report what it recovered.
    Recover { config: PathBuf },
    /// Measure journal append throughput.
    Bench {
        #[arg(long = "dir")]
        dir: Option<PathBuf>,
        #[arg(long = "messages", default_value_t = 100_000)]
        messages: u64,
        #[arg(long = "payload-bytes", default_value_t = 256)]
        payload_bytes: usize,
        #[arg(long = "sync-every", default_value_t = 0)]
        sync_every: u64,
        #[arg(long = "keep")]
        keep: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Inspect {
            journal_dir,
            extension,
            records,
        } => cmd_inspect(&journal_dir, &extension, records, &mut out)?,
        Commands::Recover { config } => cmd_recover(&config, &mut out)?,
        Commands::Bench {
            dir,
            messages,
            payload_bytes,
            sync_every,
            keep,
        } => cmd_bench(dir, messages, payload_bytes, sync_every, keep, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn cmd_inspect(dir: &Path, extension: &str, records: bool, out: &mut dyn Write) -> Result<()> {
    let factory = NioSequentialFileFactory::new(dir);
    let names = factory.list_files(extension)?;
    if names.is_empty() {
        writeln!(out, "no .{extension} files under {}", dir.display())?;
        return Ok(());
    }
    for name in names {
        let mut file = factory.create_file(&name);
        file.open()?;
        let scanned = scan_file(file.as_mut()).with_context(|| format!("scanning {name}"))?;
        file.close()?;

        let Some(header) = scanned.header else {
            writeln!(out, "{name}: free (size={})", scanned.size)?;
            continue;
        };
        let mut counts = [0usize; 9];
        for record in &scanned.records {
            counts[record.record_type as usize - RecordType::Add as usize] += 1;
        }
        writeln!(
            out,
            "{name}: file_id={} records={} used={}/{} end={}",
            header.file_id,
            scanned.records.len(),
            scanned.end_offset,
            scanned.size,
            match scanned.end {
                ScanEnd::Clean => "clean",
                ScanEnd::Stale => "stale",
                ScanEnd::Torn => "torn",
            }
        )?;
        writeln!(
            out,
            "  add={} update={} add_tx={} update_tx={} delete_tx={} delete={} prepare={} commit={} rollback={}",
            counts[0], counts[1], counts[2], counts[3], counts[4], counts[5], counts[6], counts[7], counts[8]
        )?;
        if records {
            for record in &scanned.records {
                writeln!(
                    out,
                    "  {:?} id={} tx={} user_type={} len={}",
                    record.record_type,
                    record.id,
                    record.tx_id,
                    record.user_type,
                    record.body.len()
                )?;
            }
        }
    }
    Ok(())
}

fn cmd_recover(config_path: &Path, out: &mut dyn Write) -> Result<()> {
    let config = Configuration::from_json_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if !config.persistence_enabled {
        bail!("persistence is disabled, nothing to recover");
    }
    let broker = Broker::new(config)?;
    broker.start()?;
    let summary = broker.recovery_summary()?;
    writeln!(
        out,
        "queues={} destinations={} messages={} references={} page_transactions={} prepared={}",
        summary.queues,
        summary.destinations,
        summary.messages,
        summary.references,
        summary.page_transactions,
        summary.prepared_transactions
    )?;
    for name in broker.queue_names()? {
        let control = broker.queue_control(&name)?;
        writeln!(
            out,
            "queue {name} address={} durable={} messages={} scheduled={}",
            control.address(),
            control.is_durable(),
            control.message_count()?,
            control.scheduled_count()?
        )?;
    }
    for address in broker.addresses()? {
        if broker.is_paging(&address)? {
            writeln!(out, "address {address} is paging")?;
        }
    }
    for xid in broker.prepared_transactions()? {
        writeln!(out, "in-doubt {xid}")?;
    }
    broker.stop()?;
    Ok(())
}

fn cmd_bench(
    dir: Option<PathBuf>,
    messages: u64,
    payload_bytes: usize,
    sync_every: u64,
    keep: bool,
    out: &mut dyn Write,
) -> Result<()> {
    let (dir, cleanup) = match dir {
        Some(dir) => (dir, false),
        None => (
            std::env::temp_dir().join(format!("courier-bench-{}", std::process::id())),
            true,
        ),
    };
    fs::create_dir_all(&dir)?;
    writeln!(out, "journal_dir={}", dir.display())?;

    let journal = Journal::new(
        JournalConfig::default(),
        Arc::new(NioSequentialFileFactory::new(&dir)),
    )?;
    journal.start()?;
    journal.load()?;

    let payload = vec![0u8; payload_bytes];
    let start = Instant::now();
    for id in 1..=messages {
        let sync = sync_every > 0 && id % sync_every == 0;
        journal.append_add_record(id, 1, &payload, sync)?;
    }
    journal.flush()?;
    report_throughput(out, "append", messages, payload_bytes, start.elapsed())?;
    writeln!(out, "files={}", journal.data_file_count()?)?;
    journal.stop()?;

    if cleanup && !keep {
        fs::remove_dir_all(&dir)?;
        writeln!(out, "cleanup=removed")?;
    } else {
        writeln!(out, "cleanup=kept")?;
    }
    Ok(())
}

fn report_throughput(
    out: &mut dyn Write,
    label: &str,
    messages: u64,
    payload_bytes: usize,
    elapsed: Duration,
) -> Result<()> {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let rate = messages as f64 / secs;
    let mb = (messages as f64 * payload_bytes as f64) / (1024.0 * 1024.0) / secs;
    writeln!(
        out,
        "{label}: messages={messages} elapsed={:.3}s rate={:.0}/s throughput={:.1}MiB/s",
        secs, rate, mb
    )?;
    Ok(())
}
