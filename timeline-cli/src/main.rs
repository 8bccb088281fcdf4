mod config;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use clap::{App, Arg};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wows_timeline::analyzer::packet_dump::PacketDumpBuilder;
use wows_timeline::rpc::entitydefs::DirectoryLoader;
use wows_timeline::versions::VersionRegistry;
use wows_timeline::{DecodeSession, ReplayFile, ReplayInfo};

use config::TimelineConfig;

fn main() -> anyhow::Result<()> {
    let matches = App::new("WoWS Timeline")
        .about("Decodes a World of Warships replay into a time-indexed battle timeline")
        .arg(
            Arg::with_name("REPLAY")
                .help("The replay file to process")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("SCRIPTS")
                .help("Directory with one entity definition directory per game version")
                .short("s")
                .long("scripts")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("STRICT")
                .help("Abort on the first packet that fails to decode")
                .long("strict"),
        )
        .arg(
            Arg::with_name("RAW_OUTPUT")
                .help("Write the decrypted packet stream to this file")
                .long("raw-output")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("OUTPUT")
                .help("Write the timeline JSON here instead of stdout")
                .short("o")
                .long("output")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("DUMP_PACKETS")
                .help("Print every decoded packet as a JSON line to stderr")
                .long("dump-packets"),
        )
        .arg(
            Arg::with_name("CONFIG")
                .help("TOML config file")
                .short("c")
                .long("config")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("VERBOSE")
                .help("Raise log verbosity, may be repeated")
                .short("v")
                .multiple(true),
        )
        .get_matches();

    let mut config = match matches.value_of("CONFIG") {
        Some(path) => TimelineConfig::load(Path::new(path))?,
        None => TimelineConfig::default(),
    };
    if let Some(scripts) = matches.value_of("SCRIPTS") {
        config.scripts_dir = Some(PathBuf::from(scripts));
    }
    if matches.is_present("STRICT") {
        config.strict = true;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive(matches.occurrences_of("VERBOSE"))));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let replay_path = matches
        .value_of("REPLAY")
        .ok_or_else(|| anyhow!("No replay given"))?;
    let scripts_dir = config
        .scripts_dir
        .clone()
        .ok_or_else(|| anyhow!("No scripts directory given, use --scripts or the config file"))?;

    let replay = ReplayFile::from_file(Path::new(replay_path))
        .with_context(|| format!("Failed to read replay {}", replay_path))?;
    let version = replay.version()?;
    info!("{} on {} ({})", replay.meta.playerName, replay.meta.mapDisplayName, version);

    if let Some(raw_output) = matches.value_of("RAW_OUTPUT") {
        std::fs::write(raw_output, &replay.packet_data)
            .with_context(|| format!("Failed to write {}", raw_output))?;
    }

    let loader = DirectoryLoader::new(scripts_dir);
    let registry = VersionRegistry::standard();
    let mut session = DecodeSession::new(version, &loader, &registry, config.strict)
        .context("Failed to load entity definitions")?;
    if matches.is_present("DUMP_PACKETS") {
        session.add_analyzer(PacketDumpBuilder::new().build(std::io::stderr()));
    }

    let error = session
        .play(&replay.packet_data)
        .context("Replay could not be decoded")?;
    if let Some(error) = &error {
        warn!("timeline is partial: {}", error);
    }

    let info = ReplayInfo {
        meta: replay.meta,
        extra_data: replay.extra_data,
        timeline: session.finish(),
        error,
    };

    match matches.value_of("OUTPUT") {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
            write_json(BufWriter::new(file), &info, config.pretty)?;
        }
        None => write_json(std::io::stdout().lock(), &info, config.pretty)?,
    }
    Ok(())
}

fn write_json<W: Write>(mut out: W, info: &ReplayInfo, pretty: bool) -> anyhow::Result<()> {
    if pretty {
        serde_json::to_writer_pretty(&mut out, info)?;
    } else {
        serde_json::to_writer(&mut out, info)?;
    }
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
