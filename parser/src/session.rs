//! Public entry point: bytes of a `.wowsreplay` in, [`Timeline`] out.

use std::path::PathBuf;

use derive_builder::Builder;
use serde::Serialize;
use tracing::{Level, debug, info, span, warn};

use crate::analyzer::Analyzer;
use crate::analyzer::battle_controller::{BattleController, Timeline};
use crate::error::ErrorKind;
use crate::packet2::PacketTable;
use crate::player::{ReplayPlayer, error_chain};
use crate::rpc::entitydefs::{DataFileLoader, Definitions};
use crate::types::Version;
use crate::versions::VersionRegistry;
use crate::wowsreplay::{ReplayFile, ReplayMeta, unwrap_container};

#[derive(Debug, Clone, Default, Builder)]
#[builder(default)]
pub struct DecodeOptions {
    /// Stop at the first packet that fails to decode instead of skipping it.
    pub strict: bool,
    /// Where to write the decrypted packet stream.
    #[builder(setter(into, strip_option))]
    pub raw_output: Option<PathBuf>,
}

/// Everything decoded from one replay.
#[derive(Debug, Serialize)]
pub struct ReplayInfo {
    pub meta: ReplayMeta,
    pub extra_data: Vec<serde_json::Value>,
    pub timeline: Timeline,
    /// First recoverable failure. The timeline is partial when set.
    pub error: Option<String>,
}

/// One replay being decoded: its schema, entities and battle controller.
/// Sessions share nothing, so several can run side by side.
pub struct DecodeSession {
    version: Version,
    player: ReplayPlayer<BattleController>,
    strict: bool,
}

impl DecodeSession {
    /// Resolves `version` against `registry` and loads its schema. Fails
    /// before any packet is consumed when the version is unsupported.
    pub fn new<L: DataFileLoader + ?Sized>(
        version: Version,
        loader: &L,
        registry: &VersionRegistry,
        strict: bool,
    ) -> Result<Self, ErrorKind> {
        let support = registry.lookup(&version)?;
        let definitions = Definitions::load(loader, support.key)?;
        let controller = BattleController::new(version, support.roster);
        let player = ReplayPlayer::new(definitions, BattleController::bindings(), controller, strict);

        Ok(DecodeSession {
            version,
            player,
            strict,
        })
    }

    pub fn add_analyzer(&mut self, analyzer: Box<dyn Analyzer>) {
        self.player.add_analyzer(analyzer);
    }

    pub fn player(&self) -> &ReplayPlayer<BattleController> {
        &self.player
    }

    /// Feeds the whole packet stream. A fatal error is returned in strict
    /// mode; otherwise it is kept as the session's error text.
    pub fn play(&mut self, packet_data: &[u8]) -> Result<Option<String>, ErrorKind> {
        let table = PacketTable::for_version(&self.version);
        match self.player.play(packet_data, table) {
            Ok(()) => Ok(self.player.first_error().map(str::to_owned)),
            Err(err) if self.strict => Err(err),
            Err(err) => {
                warn!("decoding stopped early, keeping the partial timeline");
                Ok(Some(error_chain(&err)))
            }
        }
    }

    /// Flushes pending events and builds the timeline.
    pub fn finish(self) -> Timeline {
        let (mut controller, entities) = self.player.into_parts();
        let battle_logic = entities
            .values()
            .filter(|entity| entity.type_name() == "BattleLogic")
            .min_by_key(|entity| entity.id());
        controller.finish(battle_logic)
    }
}

/// Decodes a complete replay file.
pub fn decode_replay<L: DataFileLoader + ?Sized>(
    contents: &[u8],
    loader: &L,
    registry: &VersionRegistry,
    options: &DecodeOptions,
) -> Result<ReplayInfo, ErrorKind> {
    let replay = unwrap_container(contents)?;
    let version = replay.version()?;

    let span = span!(Level::DEBUG, "replay", version = %version);
    let _enter = span.enter();

    if let Some(path) = &options.raw_output {
        std::fs::write(path, &replay.packet_data)?;
        info!("wrote {} packet bytes to {}", replay.packet_data.len(), path.display());
    }

    decode_unwrapped(replay, version, loader, registry, options.strict)
}

fn decode_unwrapped<L: DataFileLoader + ?Sized>(
    replay: ReplayFile,
    version: Version,
    loader: &L,
    registry: &VersionRegistry,
    strict: bool,
) -> Result<ReplayInfo, ErrorKind> {
    let mut session = DecodeSession::new(version, loader, registry, strict)?;
    let error = session.play(&replay.packet_data)?;
    let timeline = session.finish();
    debug!("timeline has {} ticks", timeline.events.len());

    Ok(ReplayInfo {
        meta: replay.meta,
        extra_data: replay.extra_data,
        timeline,
        error,
    })
}
