//! JSON-lines output of committed rounds.
//!
//! [`OutputWriter`] is a [`RoundCallback`]: after every committed round it
//! appends one [`OutputRecord`](commons_types::OutputRecord) per agent to
//! the records sink and, when enabled, the round's ledger entries to a
//! second sink. Records alone are enough to replay every balance.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use commons_core::config::OutputConfig;
use commons_core::history;
use commons_core::round::{Environment, RoundSummary};
use commons_core::runner::RoundCallback;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::EngineError;

/// Round callback writing output records as JSON lines.
pub struct OutputWriter<W: Write + Send> {
    records: W,
    ledger: Option<W>,
    records_written: u64,
    failures: u32,
}

impl OutputWriter<BufWriter<File>> {
    /// Create the output files named by `config`, creating parent
    /// directories as needed. The ledger log, when enabled, sits next to
    /// the records file with a `.ledger.jsonl` suffix.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Output`] if a file cannot be created.
    pub fn create(config: &OutputConfig) -> Result<Self, EngineError> {
        let path = Path::new(&config.path);
        let records = open(path)?;
        let ledger = if config.include_ledger {
            Some(open(&ledger_path(path))?)
        } else {
            None
        };
        Ok(Self::new(records, ledger))
    }
}

impl<W: Write + Send> OutputWriter<W> {
    /// Wrap existing sinks.
    pub const fn new(records: W, ledger: Option<W>) -> Self {
        Self {
            records,
            ledger,
            records_written: 0,
            failures: 0,
        }
    }

    /// Output records written so far.
    pub const fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Flush both sinks and hand them back.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Output`] if any round failed to write or a
    /// final flush fails.
    pub fn finish(mut self) -> Result<(W, Option<W>), EngineError> {
        self.records.flush().map_err(output_error)?;
        if let Some(ledger) = self.ledger.as_mut() {
            ledger.flush().map_err(output_error)?;
        }
        if self.failures > 0 {
            return Err(EngineError::Output {
                message: format!("{} round(s) could not be written", self.failures),
            });
        }
        Ok((self.records, self.ledger))
    }

    fn write_round(&mut self, env: &Environment) -> Result<u64, EngineError> {
        let Some(record) = env.history().last() else {
            return Ok(0);
        };
        let mut written: u64 = 0;
        for output in history::output_records(record) {
            write_line(&mut self.records, &output)?;
            written = written.saturating_add(1);
        }
        if let Some(ledger) = self.ledger.as_mut() {
            // Opening grants are posted in round 0.
            if record.round == 1 {
                for entry in env.ledger().entries_for_round(0) {
                    write_line(ledger, entry)?;
                }
            }
            for entry in env.ledger().entries_for_round(record.round) {
                write_line(ledger, entry)?;
            }
        }
        self.records.flush().map_err(output_error)?;
        Ok(written)
    }
}

impl<W: Write + Send> RoundCallback for OutputWriter<W> {
    fn on_round(&mut self, summary: &RoundSummary, env: &Environment) {
        match self.write_round(env) {
            Ok(written) => {
                self.records_written = self.records_written.saturating_add(written);
                debug!(round = summary.round, records = written, "output records written");
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                error!(round = summary.round, error = %e, "failed to write output records");
            }
        }
    }
}

fn write_line<T: Serialize>(sink: &mut impl Write, value: &T) -> Result<(), EngineError> {
    serde_json::to_writer(&mut *sink, value).map_err(|e| EngineError::Output {
        message: format!("failed to serialize record: {e}"),
    })?;
    sink.write_all(b"\n").map_err(output_error)
}

fn open(path: &Path) -> Result<BufWriter<File>, EngineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::Output {
            message: format!("failed to create {}: {e}", parent.display()),
        })?;
    }
    let file = File::create(path).map_err(|e| EngineError::Output {
        message: format!("failed to create {}: {e}", path.display()),
    })?;
    Ok(BufWriter::new(file))
}

fn ledger_path(path: &Path) -> PathBuf {
    path.with_extension("ledger.jsonl")
}

#[allow(clippy::needless_pass_by_value)]
fn output_error(e: std::io::Error) -> EngineError {
    EngineError::Output {
        message: format!("write failed: {e}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use commons_core::config::SimulationConfig;
    use commons_core::gateway::{DecisionGateway, StubProvider};
    use commons_core::history::replay_balances;
    use commons_core::runner::run_simulation;
    use commons_types::{AgentId, LedgerEntry, OutputRecord, ProviderDecision};

    use super::*;

    fn lines<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Vec<T> {
        std::str::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn writes_replayable_records_and_ledger() {
        let mut cfg = SimulationConfig::default();
        cfg.game.num_agents = 3;
        cfg.game.num_rounds = 2;
        let provider =
            StubProvider::new().with_decision(AgentId(1), ProviderDecision::Contribution(12));
        let gw = DecisionGateway::new(provider, &cfg.gateway);
        let mut env = Environment::new(cfg).unwrap();
        let mut writer = OutputWriter::new(Vec::new(), Some(Vec::new()));

        run_simulation(&mut env, &gw, &mut writer).await.unwrap();
        assert_eq!(writer.records_written(), 6);

        let (records, ledger) = writer.finish().unwrap();
        let records: Vec<OutputRecord> = lines(&records);
        assert_eq!(records.len(), 6);
        assert_eq!(records.first().map(|r| r.round), Some(1));
        assert_eq!(records.last().map(|r| r.agent), Some(AgentId(2)));

        let replayed = replay_balances(1000, &records).unwrap();
        for (agent, balance) in &replayed {
            assert_eq!(env.ledger().balance(*agent).unwrap(), *balance);
        }

        let entries: Vec<LedgerEntry> = lines(&ledger.unwrap());
        assert_eq!(entries.len(), env.ledger().len());
    }

    #[test]
    fn ledger_log_sits_next_to_records() {
        assert_eq!(
            ledger_path(Path::new("out/rounds.jsonl")),
            PathBuf::from("out/rounds.ledger.jsonl")
        );
    }
}
