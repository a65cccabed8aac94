//! Typed entries over the raw write-ahead log, with replay and one-shot
//! repair.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use thiserror::Error;
use tracing::{error, info, warn};

use tenderbft_core_types::{Height, Round};
use tenderbft_wal::{repair, Log, LogError, RepairOutcome};

use crate::msgs::MessageInfo;
use crate::round_state::{RoundStateEvent, Step};
use crate::ticker::TimeoutInfo;

const TAG_MESSAGE: u8 = 0x01;
const TAG_TIMEOUT: u8 = 0x02;
const TAG_END_HEIGHT: u8 = 0x03;
const TAG_ROUND_STATE: u8 = 0x04;

/// A typed record of the consensus write-ahead log.
#[derive(Clone, Debug, PartialEq)]
pub enum WalMessage {
    /// An input message, from a peer or self-generated.
    Msg(MessageInfo),

    /// A delivered timeout.
    Timeout(TimeoutInfo),

    /// Height fully committed and persisted; replay starts after the last
    /// marker.
    EndHeight(Height),

    /// Round state snapshot taken on a step change.
    RoundState(RoundStateEvent),
}

/// Errors of the typed WAL layer.
#[derive(Debug, Error)]
pub enum WalError {
    /// The raw log failed.
    #[error("log: {0}")]
    Log(#[from] LogError),

    /// An entry could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(#[from] io::Error),
}

/// Encode a WAL message: a tag byte followed by the payload.
pub fn encode_message(msg: &WalMessage, mut buf: impl Write) -> io::Result<()> {
    match msg {
        WalMessage::Msg(info) => {
            let bytes = borsh::to_vec(info)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            buf.write_u8(TAG_MESSAGE)?;
            buf.write_u64::<BE>(bytes.len() as u64)?;
            buf.write_all(&bytes)?;
        }

        WalMessage::Timeout(info) => {
            buf.write_u8(TAG_TIMEOUT)?;
            buf.write_u64::<BE>(info.duration.as_nanos().min(u64::MAX as u128) as u64)?;
            buf.write_u64::<BE>(info.height.as_u64())?;
            buf.write_i64::<BE>(info.round.as_i64())?;
            buf.write_u8(encode_step(info.step))?;
        }

        WalMessage::EndHeight(height) => {
            buf.write_u8(TAG_END_HEIGHT)?;
            buf.write_u64::<BE>(height.as_u64())?;
        }

        WalMessage::RoundState(event) => {
            let bytes = borsh::to_vec(event)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            buf.write_u8(TAG_ROUND_STATE)?;
            buf.write_u64::<BE>(bytes.len() as u64)?;
            buf.write_all(&bytes)?;
        }
    }

    Ok(())
}

/// Decode a WAL message.
pub fn decode_message(mut buf: impl Read) -> io::Result<WalMessage> {
    match buf.read_u8()? {
        TAG_MESSAGE => {
            let len = buf.read_u64::<BE>()? as usize;
            let mut bytes = vec![0; len];
            buf.read_exact(&mut bytes)?;

            let info = borsh::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            Ok(WalMessage::Msg(info))
        }

        TAG_TIMEOUT => {
            let duration = Duration::from_nanos(buf.read_u64::<BE>()?);
            let height = Height::new(buf.read_u64::<BE>()?);
            let round = Round::from(buf.read_i64::<BE>()?);
            let step = decode_step(buf.read_u8()?)?;

            Ok(WalMessage::Timeout(TimeoutInfo::new(
                duration, height, round, step,
            )))
        }

        TAG_END_HEIGHT => Ok(WalMessage::EndHeight(Height::new(buf.read_u64::<BE>()?))),

        TAG_ROUND_STATE => {
            let len = buf.read_u64::<BE>()? as usize;
            let mut bytes = vec![0; len];
            buf.read_exact(&mut bytes)?;

            let event = borsh::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            Ok(WalMessage::RoundState(event))
        }

        tag => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid wal entry tag {tag:#x}"),
        )),
    }
}

fn encode_step(step: Step) -> u8 {
    match step {
        Step::NewHeight => 1,
        Step::NewRound => 2,
        Step::Propose => 3,
        Step::Prevote => 4,
        Step::PrevoteWait => 5,
        Step::Precommit => 6,
        Step::PrecommitWait => 7,
        Step::Commit => 8,
    }
}

fn decode_step(byte: u8) -> io::Result<Step> {
    match byte {
        1 => Ok(Step::NewHeight),
        2 => Ok(Step::NewRound),
        3 => Ok(Step::Propose),
        4 => Ok(Step::Prevote),
        5 => Ok(Step::PrevoteWait),
        6 => Ok(Step::Precommit),
        7 => Ok(Step::PrecommitWait),
        8 => Ok(Step::Commit),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid step in timeout entry",
        )),
    }
}

/// The consensus write-ahead log: typed entries over [`Log`].
pub struct ConsensusWal {
    log: Log,
}

impl ConsensusWal {
    /// Open the log at `path`, repairing it at most once if the tail is
    /// corrupt. A second corruption is fatal and propagates.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Option<RepairOutcome>), WalError> {
        let path = path.as_ref();

        match Log::open(path) {
            Ok(log) => Ok((Self { log }, None)),

            Err(err) if err.is_corruption() => {
                warn!(path = %path.display(), %err, "WAL is corrupt, attempting repair");

                let outcome = repair(path)?;
                info!(
                    entries = outcome.entries_recovered,
                    dropped = outcome.bytes_dropped,
                    "WAL repaired"
                );

                let log = Log::open(path)?;
                Ok((Self { log }, Some(outcome)))
            }

            Err(err) => Err(err.into()),
        }
    }

    /// Append an entry without forcing it to disk.
    pub fn append(&mut self, msg: &WalMessage) -> Result<(), WalError> {
        let mut buf = Vec::new();
        encode_message(msg, &mut buf)?;
        self.log.append(&buf)?;
        Ok(())
    }

    /// Append an entry and fsync. Required for self-generated messages
    /// before their signatures are released.
    pub fn append_sync(&mut self, msg: &WalMessage) -> Result<(), WalError> {
        self.append(msg)?;
        self.log.sync()?;
        Ok(())
    }

    /// Write the end-height marker for a fully persisted height, fsynced.
    pub fn write_end_height(&mut self, height: Height) -> Result<(), WalError> {
        self.append_sync(&WalMessage::EndHeight(height))
    }

    /// Fsync outstanding appends.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.log.sync()?;
        Ok(())
    }

    /// The messages to replay when starting `height`: everything after the
    /// last end-height marker below `height`. Entries that fail to decode
    /// are logged and skipped.
    pub fn replay_messages(&self, height: Height) -> Result<Vec<WalMessage>, WalError> {
        let mut messages = Vec::new();

        for entry in self.log.iter()? {
            let bytes = entry?;

            match decode_message(io::Cursor::new(&bytes[..])) {
                Ok(WalMessage::EndHeight(h)) if h < height => messages.clear(),
                Ok(msg) => messages.push(msg),
                Err(err) => error!(%err, "Failed to decode WAL entry, skipping"),
            }
        }

        Ok(messages)
    }

    /// Whether the log handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.log.is_closed()
    }

    /// Fsync and close the log.
    pub fn close(&mut self) -> Result<(), WalError> {
        self.log.close()?;
        Ok(())
    }
}
