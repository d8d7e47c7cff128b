//! Re-applying logged transactions to a tree after a crash.

use crate::tree::{GBPTree, GBPTreeError, HeaderUpdate, Layout};
use crate::wal::channel::ReadableChannel;
use crate::wal::command::{CommandError, TreeCommand};
use crate::wal::entry::LogEntry;
use crate::wal::reader::{LogEntryError, VersionAwareLogEntryReader};

/// What a replay did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Id of the last transaction covered by the last checkpoint entry.
    pub checkpointed_tx_id: Option<u64>,
    pub transactions_replayed: u64,
    pub commands_applied: u64,
    /// Id of the last complete transaction in the log.
    pub last_tx_id: Option<u64>,
    /// Checksum of that transaction's commit entry.
    pub last_checksum: Option<u32>,
    /// Whether the log ended inside a transaction.
    pub incomplete_tail: bool,
    /// Where appending should resume.
    pub end_position: u64,
}

/// Errors during replay.
#[derive(Debug)]
pub enum ReplayError {
    Log(LogEntryError),
    Command { tx_id: u64, source: CommandError },
    Tree(GBPTreeError),
    /// A command or commit entry outside a transaction.
    UnexpectedEntry { position: u64 },
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log(err) => write!(f, "log read failed: {err}"),
            Self::Command { tx_id, source } => {
                write!(f, "bad command in transaction {tx_id}: {source}")
            }
            Self::Tree(err) => write!(f, "applying to tree failed: {err}"),
            Self::UnexpectedEntry { position } => {
                write!(f, "entry outside a transaction at {position}")
            }
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Log(err) => Some(err),
            Self::Command { source, .. } => Some(source),
            Self::Tree(err) => Some(err),
            Self::UnexpectedEntry { .. } => None,
        }
    }
}

impl From<LogEntryError> for ReplayError {
    fn from(err: LogEntryError) -> Self {
        Self::Log(err)
    }
}

impl From<GBPTreeError> for ReplayError {
    fn from(err: GBPTreeError) -> Self {
        Self::Tree(err)
    }
}

struct Committed {
    tx_id: u64,
    commands: Vec<Vec<u8>>,
}

/// Scan the whole log, then apply to `tree` every transaction committed
/// after the last checkpoint entry, in log order, and checkpoint the tree.
///
/// A trailing transaction without a commit entry is dropped, as is a
/// transaction whose commit checksum does not match its bytes; scanning
/// stops at such a transaction.
///
/// # Pre-conditions
///
/// - `tree` is writable and has no crash cleanup pending
pub fn replay<C: ReadableChannel, L: Layout>(
    reader: &mut VersionAwareLogEntryReader<C>,
    tree: &GBPTree<L>,
) -> Result<ReplayReport, ReplayError> {
    let mut report = ReplayReport::default();
    let mut committed: Vec<Committed> = Vec::new();
    // Start position and commands of the transaction being read.
    let mut open: Option<(u64, Vec<Vec<u8>>)> = None;

    loop {
        let position = reader.last_position();
        let Some(entry) = reader.read_log_entry()? else {
            break;
        };
        match entry {
            LogEntry::Start(_) => {
                open = Some((position, Vec::new()));
            }
            LogEntry::Command(command) => match open.as_mut() {
                Some((_, commands)) => commands.push(command.payload),
                None => return Err(ReplayError::UnexpectedEntry { position }),
            },
            LogEntry::Commit(commit) => {
                let Some((tx_start, commands)) = open.take() else {
                    return Err(ReplayError::UnexpectedEntry { position });
                };
                if reader.last_computed_checksum() != Some(commit.checksum) {
                    tracing::warn!(
                        tx_id = commit.tx_id,
                        position,
                        "transaction checksum mismatch; replay stops here"
                    );
                    report.end_position = tx_start;
                    return finish(tree, committed, report);
                }
                report.last_tx_id = Some(commit.tx_id);
                report.last_checksum = Some(commit.checksum);
                committed.push(Committed {
                    tx_id: commit.tx_id,
                    commands,
                });
            }
            LogEntry::CheckPoint(check_point) => {
                report.checkpointed_tx_id = Some(check_point.last_tx_id);
                committed.retain(|tx| tx.tx_id > check_point.last_tx_id);
            }
        }
    }

    report.incomplete_tail = open.is_some();
    report.end_position = open.map_or(reader.last_position(), |(tx_start, _)| tx_start);
    finish(tree, committed, report)
}

fn finish<L: Layout>(
    tree: &GBPTree<L>,
    committed: Vec<Committed>,
    mut report: ReplayReport,
) -> Result<ReplayReport, ReplayError> {
    for tx in committed {
        for payload in &tx.commands {
            let command = TreeCommand::decode(payload).map_err(|source| ReplayError::Command {
                tx_id: tx.tx_id,
                source,
            })?;
            command.apply(tree)?;
            report.commands_applied += 1;
        }
        report.transactions_replayed += 1;
    }
    if report.transactions_replayed > 0 {
        tree.checkpoint(HeaderUpdate::CarryOver)?;
    }
    tracing::info!(
        replayed = report.transactions_replayed,
        commands = report.commands_applied,
        checkpointed_tx = ?report.checkpointed_tx_id,
        incomplete_tail = report.incomplete_tail,
        "log replay finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EphemeralFileSystem, FileSystem};
    use crate::page_cache::PageCache;
    use crate::tree::SimpleLongLayout;
    use crate::wal::channel::InMemoryChannel;
    use crate::wal::entry::LogEntryVersion;
    use crate::wal::writer::{LogEntryWriter, TransactionAppender};
    use std::sync::Arc;

    fn tree() -> GBPTree<SimpleLongLayout> {
        let fs: Arc<dyn FileSystem> = Arc::new(EphemeralFileSystem::new());
        GBPTree::builder(&PageCache::new(fs, 64), "/tree", SimpleLongLayout)
            .page_size(256)
            .build()
            .expect("tree")
    }

    fn insert(key: u64, value: u64) -> Vec<u8> {
        TreeCommand::insert(&SimpleLongLayout, &key, &value).encode()
    }

    fn remove(key: u64) -> Vec<u8> {
        TreeCommand::remove(&SimpleLongLayout, &key).encode()
    }

    fn appender() -> TransactionAppender<InMemoryChannel> {
        TransactionAppender::new(LogEntryWriter::new(InMemoryChannel::new(), LogEntryVersion::V2))
    }

    #[test]
    fn test_replays_only_after_last_checkpoint() {
        let mut log = appender();
        log.append(&[insert(1, 1), insert(2, 2)]).expect("append");
        log.check_point("flush").expect("checkpoint");
        log.append(&[insert(3, 3)]).expect("append");
        log.append(&[remove(3), insert(4, 4)]).expect("append");
        let channel = log.into_writer().into_channel();

        let tree = tree();
        let mut reader = VersionAwareLogEntryReader::new(channel.reader()).verify_checksum_chain(true);
        let report = replay(&mut reader, &tree).expect("replay");

        assert_eq!(report.checkpointed_tx_id, Some(1));
        assert_eq!(report.transactions_replayed, 2);
        assert_eq!(report.commands_applied, 3);
        assert_eq!(report.last_tx_id, Some(3));
        assert!(!report.incomplete_tail);
        assert_eq!(report.end_position, channel.as_bytes().len() as u64);
        assert_eq!(tree.get(&1).expect("get"), None);
        assert_eq!(tree.get(&3).expect("get"), None);
        assert_eq!(tree.get(&4).expect("get"), Some(4));
    }

    #[test]
    fn test_trailing_transaction_without_commit_is_dropped() {
        let mut log = appender();
        log.append(&[insert(1, 10)]).expect("append");
        let writer = log.writer_mut();
        writer
            .write_start(&crate::wal::entry::StartEntry::default())
            .expect("start");
        writer.write_command(&insert(2, 20)).expect("command");
        let channel = log.into_writer().into_channel();

        let tree = tree();
        let mut reader = VersionAwareLogEntryReader::new(channel.reader());
        let report = replay(&mut reader, &tree).expect("replay");
        assert!(report.incomplete_tail);
        assert_eq!(report.transactions_replayed, 1);
        assert_eq!(tree.get(&1).expect("get"), Some(10));
        assert_eq!(tree.get(&2).expect("get"), None);
    }

    #[test]
    fn test_corrupt_transaction_stops_replay() {
        let mut log = appender();
        log.append(&[insert(1, 1)]).expect("append");
        let second = log.writer_mut().channel_mut().as_bytes().len();
        log.append(&[insert(2, 2)]).expect("append");
        log.append(&[insert(3, 3)]).expect("append");
        let mut bytes = log.into_writer().into_channel().into_bytes();
        // Start entry, command header, opcode and key length, then the last
        // key byte of the second transaction.
        bytes[second + 26 + 6 + 1 + 4 + 7] ^= 0x01;

        let tree = tree();
        let mut reader = VersionAwareLogEntryReader::new(InMemoryChannel::from_bytes(bytes));
        let report = replay(&mut reader, &tree).expect("replay");
        assert_eq!(report.transactions_replayed, 1);
        assert_eq!(report.last_tx_id, Some(1));
        assert_eq!(report.end_position, second as u64);
        assert_eq!(tree.get(&1).expect("get"), Some(1));
        assert_eq!(tree.get(&2).expect("get"), None);
    }
}
