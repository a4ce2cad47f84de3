use anyhow::Context;
use chrono::offset::TimeZone;
use hprof_analyzer::indexer::IndexerOptions;
use hprof_analyzer::reader::HeapDumpFile;
use hprof_analyzer::snapshot::Snapshot;
use hprof_analyzer::{web, HprofError};
use itertools::Itertools;
use std::path::{Path, PathBuf};
use std::{io, process};

fn dump_arg() -> clap::Arg<'static, 'static> {
    clap::Arg::with_name("dump")
        .required(true)
        .takes_value(true)
        .help("Heap dump file to read")
}

fn index_arg() -> clap::Arg<'static, 'static> {
    clap::Arg::with_name("index")
        .long("index")
        .required(false)
        .takes_value(true)
        .help("Index path; defaults to <dump>.index next to the file")
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let app = clap::App::new("hprof-analyzer")
        .about("Post-mortem JVM heap dump analyzer: retained sizes via dominator tree")
        .arg(
            clap::Arg::with_name("threads")
                .short("t")
                .long("threads")
                .required(false)
                .takes_value(true)
                .help("Worker threads for aggregation passes. Defaults to 4 or the number of cores, whichever is smaller."),
        )
        .arg(
            clap::Arg::with_name("object-header")
                .long("object-header")
                .required(false)
                .takes_value(true)
                .help("Object header bytes charged per instance (default 16)"),
        )
        .subcommand(
            clap::SubCommand::with_name("analyze")
                .about("Build the index if missing, then print the top objects by retained size")
                .arg(dump_arg())
                .arg(index_arg())
                .arg(
                    clap::Arg::with_name("top")
                        .long("top")
                        .takes_value(true)
                        .default_value("20")
                        .help("How many objects to print"),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("stats")
                .about("Print class statistics as CSV, sorted by instance count")
                .arg(dump_arg())
                .arg(index_arg()),
        )
        .subcommand(
            clap::SubCommand::with_name("header")
                .about("Display dump header metadata")
                .arg(dump_arg()),
        )
        .subcommand(
            clap::SubCommand::with_name("record-counts")
                .about("Display the number of each record type in the dump")
                .arg(dump_arg()),
        )
        .subcommand(
            clap::SubCommand::with_name("threads")
                .about("Display threads with stack traces")
                .arg(dump_arg())
                .arg(index_arg()),
        )
        .subcommand(
            clap::SubCommand::with_name("serve")
                .about("Serve the read-only inspection API over HTTP")
                .arg(dump_arg())
                .arg(index_arg())
                .arg(
                    clap::Arg::with_name("listen")
                        .long("listen")
                        .takes_value(true)
                        .default_value("127.0.0.1:8080")
                        .help("Address to bind"),
                ),
        );
    let matches = app.get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("error: {:#}", e);
        process::exit(exit_code(&e));
    }
}

fn exit_code(e: &anyhow::Error) -> i32 {
    if let Some(hprof) = e.downcast_ref::<HprofError>() {
        return hprof.exit_code();
    }
    if e.downcast_ref::<io::Error>().is_some() {
        return 2;
    }
    1
}

fn run(matches: &clap::ArgMatches<'_>) -> Result<(), anyhow::Error> {
    let threads = matches
        .value_of("threads")
        .map(|s| s.parse::<usize>())
        .transpose()
        .context("--threads must be a number")?
        .unwrap_or_else(|| {
            // storage rarely keeps more cores than this busy
            std::cmp::min(num_cpus::get(), 4)
        });
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;

    let mut options = IndexerOptions::default();
    if let Some(header) = matches.value_of("object-header") {
        options.instance_header_size = header
            .parse::<u64>()
            .context("--object-header must be a number of bytes")?;
    }

    let (name, sub) = matches.subcommand();
    let sub = match sub {
        Some(sub) => sub,
        None => {
            eprintln!("missing subcommand; try --help");
            process::exit(1);
        }
    };
    let dump_path = PathBuf::from(sub.value_of("dump").expect("dump is required"));
    let index_path = sub.value_of("index").map(PathBuf::from);

    match name {
        "header" => header(&dump_path),
        "record-counts" => record_counts(&dump_path),
        "analyze" => {
            let top = sub
                .value_of("top")
                .unwrap_or("20")
                .parse::<usize>()
                .context("--top must be a number")?;
            analyze(&dump_path, index_path, options, top)
        }
        "stats" => stats(&dump_path, index_path, options),
        "threads" => threads_listing(&dump_path, index_path, options),
        "serve" => {
            let listen = sub.value_of("listen").unwrap_or("127.0.0.1:8080").to_owned();
            serve(&dump_path, index_path, options, &listen)
        }
        other => {
            eprintln!("unknown subcommand {:?}; try --help", other);
            process::exit(1);
        }
    }
}

fn header(dump_path: &Path) -> Result<(), anyhow::Error> {
    let reader = HeapDumpFile::open(dump_path)?;
    println!("Label: {}", reader.header().label());
    println!("Id size: {:?}", reader.header().id_size());
    let ts = chrono::Utc.timestamp_millis(reader.header().timestamp_millis() as i64);
    println!("Timestamp: {}", ts);
    Ok(())
}

fn record_counts(dump_path: &Path) -> Result<(), anyhow::Error> {
    let reader = HeapDumpFile::open(dump_path)?;
    let mut counts = std::collections::HashMap::new();
    let mut records = reader.records();
    while let Some(record) = records.next() {
        let record = record?;
        *counts.entry(record.tag_name()).or_insert(0_u64) += 1;
    }
    for (tag, count) in counts
        .into_iter()
        .sorted_by_key(|&(tag, count)| (std::cmp::Reverse(count), tag))
    {
        println!("{}: {}", tag, count);
    }
    for (tag, count) in records.unknown_tag_counts() {
        println!("unknown tag {:#04x}: {}", tag, count);
    }
    Ok(())
}

fn analyze(
    dump_path: &Path,
    index_path: Option<PathBuf>,
    options: IndexerOptions,
    top: usize,
) -> Result<(), anyhow::Error> {
    let mut snapshot = Snapshot::open(dump_path, index_path, options)?;
    let ranking = snapshot.retained_ranking(top)?;
    hprof_analyzer::snapshot::log_analysis_summary(&snapshot);
    for ranked in ranking {
        println!("{}\t{}", ranked.class, ranked.retained);
    }
    Ok(())
}

fn stats(
    dump_path: &Path,
    index_path: Option<PathBuf>,
    options: IndexerOptions,
) -> Result<(), anyhow::Error> {
    let snapshot = Snapshot::open(dump_path, index_path, options)?;
    let stats = snapshot.class_statistics()?;

    let mut wtr = csv::Writer::from_writer(io::stdout());
    wtr.write_record(&[
        "Instance count",
        "Total shallow size (bytes)",
        "Class name",
        "Class obj id",
    ])?;
    for s in stats {
        wtr.write_record(&[
            s.count.to_string(),
            s.size.to_string(),
            s.name,
            format!("{}", s.id),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

fn threads_listing(
    dump_path: &Path,
    index_path: Option<PathBuf>,
    options: IndexerOptions,
) -> Result<(), anyhow::Error> {
    let snapshot = Snapshot::open(dump_path, index_path, options)?;
    for thread in snapshot.threads()? {
        println!(
            "Thread {} \"{}\" (group \"{}\", obj {:#X})",
            thread.serial, thread.name, thread.group, thread.obj_id
        );
        for frame in &thread.frames {
            println!(
                "\tat {}#{}{} ({}:{})",
                frame.class, frame.method, frame.signature, frame.source_file, frame.line
            );
        }
        if !thread.locals.is_empty() {
            println!(
                "\tstack locals: {}",
                thread.locals.iter().map(|id| format!("{:#X}", id)).join(", ")
            );
        }
        println!();
    }
    Ok(())
}

fn serve(
    dump_path: &Path,
    index_path: Option<PathBuf>,
    options: IndexerOptions,
    listen: &str,
) -> Result<(), anyhow::Error> {
    let snapshot = Snapshot::open(dump_path, index_path, options)?;
    web::serve(snapshot, listen)?;
    Ok(())
}
