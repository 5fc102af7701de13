use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::{Bound, Range};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Deserializer;
use tracing::{debug, info, instrument};

use super::KvsEngine;
use crate::command::{BatchOp, Record};
use crate::error::{KvsError, Result};
use crate::options::RangeOptions;

// the size threshold (in bytes) of stale data that will trigger a log compaction
const COMPACTION_THRESHOLD: u64 = 1024 * 1024;

/// The log-structured [`KvsEngine`].
///
/// Every put and delete is appended, as JSON, to a "command log" kept on the local file system.
/// An in-memory, ordered index maps each live key to the position of its latest command, which
/// is what makes range scans cheap: the index is walked in key order and only the values are read
/// back from the logs.
///
/// Once the size of "stale" data in the logs hits the COMPACTION THRESHOLD, the live commands
/// are copied into a new log and the old log files are deleted.
///
/// Cloning a `KvStore` is cheap; clones share the same logs and index.
#[derive(Debug, Clone)]
pub struct KvStore {
    inner: Arc<Mutex<LogStore>>,
}

impl KvStore {
    /// creates a [`KvStore`] using the given `working_dir` as the directory where store's
    /// data will be kept. If the `working_dir` does not exist it will be created.
    pub fn open(working_dir: impl Into<PathBuf>) -> Result<KvStore> {
        let store = LogStore::open(working_dir.into())?;
        Ok(KvStore {
            inner: Arc::new(Mutex::new(store)),
        })
    }

    /// Clears stale entries in the command logs.
    pub fn compact(&self) -> Result<()> {
        self.lock().compact()
    }

    fn lock(&self) -> MutexGuard<'_, LogStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvsEngine for KvStore {
    fn get(&self, key: String) -> Result<Option<String>> {
        self.lock().get(&key)
    }

    fn put(&self, key: String, value: String) -> Result<()> {
        let mut store = self.lock();
        store.apply(Command::Put { key, value })?;
        store.writer.flush()?;
        store.maybe_compact()
    }

    fn delete(&self, key: String) -> Result<()> {
        let mut store = self.lock();
        if !store.index.contains_key(&key) {
            return Err(KvsError::KeyNotFound);
        }
        store.apply(Command::Del { key })?;
        store.writer.flush()?;
        store.maybe_compact()
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut store = self.lock();
        for op in ops {
            let command = match op {
                BatchOp::Put { key, value } => Command::Put { key, value },
                BatchOp::Del { key } if store.index.contains_key(&key) => Command::Del { key },
                BatchOp::Del { .. } => continue,
            };
            store.apply(command)?;
        }
        store.writer.flush()?;
        store.maybe_compact()
    }

    fn range(&self, opts: &RangeOptions) -> Result<Vec<Record>> {
        self.lock().range(opts)
    }

    fn approximate_size(&self, from: &str, to: &str) -> Result<u64> {
        if from > to {
            return Ok(0);
        }
        let store = self.lock();
        Ok(store
            .index
            .range::<str, _>((Bound::Included(from), Bound::Included(to)))
            .map(|(_, pos)| pos.len)
            .sum())
    }
}

/// The state behind a [`KvStore`].
#[derive(Debug)]
struct LogStore {
    // path to the directory containing the command log files
    working_dir: PathBuf,

    // the current log generation number that is in use
    current_log_gen: u64,

    // maps generation numbers to a file Reader that will read from the log file
    readers: HashMap<u64, BufReaderWithPos<File>>,

    // writer of the current command log.
    writer: BufWriterWithPos<File>,

    // maps keys to their position within a log file, in key order
    index: BTreeMap<String, CommandPos>,

    // number of bytes representing "stale" commands that could be
    // deleted during a compaction.
    uncompacted: u64,
}

impl LogStore {
    #[instrument]
    fn open(working_dir: PathBuf) -> Result<LogStore> {
        info!("opening log-structured store");
        fs::create_dir_all(&working_dir)?;

        // get all log gen numbers in the working dir
        let log_gens = get_log_gens(&working_dir)?;
        debug!(?log_gens);

        let mut readers = HashMap::new();
        let mut index = BTreeMap::new();
        let mut uncompacted = 0_u64;

        // build buffered readers for all log files, replaying their commands into the index
        for &gen in &log_gens {
            let mut reader = BufReaderWithPos::new(File::open(build_log_path(&working_dir, gen))?)?;
            uncompacted += load(gen, &mut reader, &mut index)?;
            readers.insert(gen, reader);
        }
        debug!(uncompacted, keys = index.len());

        let current_log_gen = log_gens.last().unwrap_or(&0) + 1;
        let writer = new_log_file(&working_dir, current_log_gen, &mut readers)?;

        Ok(LogStore {
            working_dir,
            current_log_gen,
            readers,
            writer,
            index,
            uncompacted,
        })
    }

    /// appends `command` to the current log (without flushing) and updates the index
    fn apply(&mut self, command: Command) -> Result<()> {
        let start = self.writer.pos;
        serde_json::to_writer(&mut self.writer, &command)?;
        let span = start..self.writer.pos;

        match command {
            Command::Put { key, .. } => {
                let pos = (self.current_log_gen, span).into();
                if let Some(old) = self.index.insert(key, pos) {
                    self.uncompacted += old.len;
                }
            }
            Command::Del { key } => {
                if let Some(old) = self.index.remove(&key) {
                    self.uncompacted += old.len;
                }
                // the delete command itself is stale as soon as it is written
                self.uncompacted += span.end - span.start;
            }
        }
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<()> {
        if self.uncompacted > COMPACTION_THRESHOLD {
            self.compact()?;
        }
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.index.get(key).copied() {
            Some(pos) => self.read_value(key, pos).map(Some),
            None => Ok(None),
        }
    }

    /// reads back the value of the put command stored at `pos`
    fn read_value(&mut self, key: &str, pos: CommandPos) -> Result<String> {
        let reader = self.readers.get_mut(&pos.gen).ok_or_else(|| {
            KvsError::Command(format!("no reader for log generation {}", pos.gen))
        })?;
        reader.seek(SeekFrom::Start(pos.pos))?;
        let cmd_reader = reader.take(pos.len);
        match serde_json::from_reader(cmd_reader)? {
            Command::Put { value, .. } => Ok(value),
            Command::Del { .. } => Err(KvsError::Command(format!(
                "expected a put for key: {} gen: {} pos: {} len: {}",
                key, pos.gen, pos.pos, pos.len
            ))),
        }
    }

    fn range(&mut self, opts: &RangeOptions) -> Result<Vec<Record>> {
        if opts.is_empty() {
            return Ok(Vec::new());
        }
        let hits = self.index.range::<str, _>((opts.lower(), opts.upper()));
        let positions: Vec<(String, CommandPos)> = if opts.reverse {
            hits.rev()
                .take(opts.take())
                .map(|(k, p)| (k.clone(), *p))
                .collect()
        } else {
            hits.take(opts.take()).map(|(k, p)| (k.clone(), *p)).collect()
        };

        positions
            .into_iter()
            .map(|(key, pos)| {
                let value = self.read_value(&key, pos)?;
                Ok(Record { key, value })
            })
            .collect()
    }

    /// Copies every live command into a new log and deletes the logs that came before it.
    fn compact(&mut self) -> Result<()> {
        // increase current gen by 2. current_gen + 1 is for the compaction file.
        let compaction_gen = self.current_log_gen + 1;
        self.current_log_gen += 2;
        self.writer = new_log_file(&self.working_dir, self.current_log_gen, &mut self.readers)?;

        let mut compaction_writer =
            new_log_file(&self.working_dir, compaction_gen, &mut self.readers)?;

        let mut new_pos = 0; // pos in the new log file.
        for cmd_pos in self.index.values_mut() {
            let reader = self.readers.get_mut(&cmd_pos.gen).ok_or_else(|| {
                KvsError::Command(format!("no reader for log generation {}", cmd_pos.gen))
            })?;
            if reader.pos != cmd_pos.pos {
                reader.seek(SeekFrom::Start(cmd_pos.pos))?;
            }

            let mut entry_reader = reader.take(cmd_pos.len);
            let len = io::copy(&mut entry_reader, &mut compaction_writer)?;
            *cmd_pos = (compaction_gen, new_pos..new_pos + len).into();
            new_pos += len;
        }
        compaction_writer.flush()?;

        let stale_gens: Vec<_> = self
            .readers
            .keys()
            .filter(|&&gen| gen < compaction_gen)
            .cloned()
            .collect();
        for stale_gen in stale_gens {
            self.readers.remove(&stale_gen);
            fs::remove_file(build_log_path(&self.working_dir, stale_gen))?;
        }
        info!(
            compaction_gen,
            reclaimed = self.uncompacted,
            "compacted command logs"
        );
        self.uncompacted = 0;

        Ok(())
    }
}

/// loads the commands from the given reader into the given `index` map
/// returns the amount of bytes that could be compacted.
/// `gen` is the generation number of the file being read by `reader`
fn load(
    gen: u64,
    reader: &mut BufReaderWithPos<File>,
    index: &mut BTreeMap<String, CommandPos>,
) -> Result<u64> {
    let mut pos = reader.seek(SeekFrom::Start(0))?;
    let mut uncompacted = 0_u64;
    let mut stream = Deserializer::from_reader(reader).into_iter::<Command>();

    while let Some(command) = stream.next() {
        let end = stream.byte_offset() as u64;
        match command? {
            Command::Put { key, .. } => {
                if let Some(old) = index.insert(key, CommandPos::new(gen, pos, end - pos)) {
                    uncompacted += old.len;
                }
            }
            Command::Del { key } => {
                if let Some(old) = index.remove(&key) {
                    uncompacted += old.len;
                }
                uncompacted += end - pos;
            }
        }
        pos = end;
    }

    Ok(uncompacted)
}

/// Constructs a log file path using the `gen` number as the file stem and ".log" as the
/// extension, joined to `dir`
fn build_log_path(dir: &Path, gen: u64) -> PathBuf {
    dir.join(format!("{}.log", gen))
}

/// Create a new log file with given generation number and add the reader to the readers map.
///
/// Returns the writer to the log.
fn new_log_file(
    dir: &Path,
    gen: u64,
    readers: &mut HashMap<u64, BufReaderWithPos<File>>,
) -> Result<BufWriterWithPos<File>> {
    let path = build_log_path(dir, gen);
    let writer = BufWriterWithPos::new(
        OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(&path)?,
    )?;

    readers.insert(gen, BufReaderWithPos::new(File::open(&path)?)?);
    Ok(writer)
}

/// returns the log generation numbers located in the given `dir`, sorted in ascending order.
/// Files ending in `.log` whose stem is not an integer are skipped.
fn get_log_gens(dir: &Path) -> Result<Vec<u64>> {
    let mut gens: Vec<u64> = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "log"))
        .filter_map(|path| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
        })
        .collect();
    gens.sort_unstable();
    Ok(gens)
}

/// These are the command types that will be recorded in the command log(s)
#[derive(Serialize, Deserialize, Debug)]
enum Command {
    Put { key: String, value: String },
    Del { key: String },
}

/// Holds position data for commands that have been written into a command log.
#[derive(Debug, Copy, Clone)]
struct CommandPos {
    // the log generation number
    gen: u64,
    // position of the command with the log (byte offset)
    pos: u64,
    // the total length of the command data
    len: u64,
}

impl CommandPos {
    fn new(gen: u64, pos: u64, len: u64) -> Self {
        CommandPos { gen, pos, len }
    }
}

/// enables conversion from a tuple of (generation number, pos_start..pos_end) into
/// a `CommandPos`
impl From<(u64, Range<u64>)> for CommandPos {
    fn from((gen, range): (u64, Range<u64>)) -> Self {
        CommandPos::new(gen, range.start, range.end - range.start)
    }
}

/// A BufReader that remembers its current seek position
#[derive(Debug)]
struct BufReaderWithPos<R: Read + Seek> {
    reader: BufReader<R>,
    pos: u64,
}

impl<R: Read + Seek> BufReaderWithPos<R> {
    fn new(mut inner: R) -> Result<Self> {
        let pos = inner.stream_position()?;
        Ok(BufReaderWithPos {
            reader: BufReader::new(inner),
            pos,
        })
    }
}

impl<R: Read + Seek> Read for BufReaderWithPos<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.reader.read(buf)?;
        self.pos += len as u64;
        Ok(len)
    }
}

impl<R: Read + Seek> Seek for BufReaderWithPos<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = self.reader.seek(pos)?;
        Ok(self.pos)
    }
}

/// A BufWriter that counts the bytes written through it
#[derive(Debug)]
struct BufWriterWithPos<W: Write + Seek> {
    writer: BufWriter<W>,
    pos: u64,
}

impl<W: Write + Seek> BufWriterWithPos<W> {
    fn new(mut inner: W) -> Result<Self> {
        let pos = inner.seek(SeekFrom::End(0))?;
        Ok(BufWriterWithPos {
            writer: BufWriter::new(inner),
            pos,
        })
    }
}

impl<W: Write + Seek> Write for BufWriterWithPos<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.writer.write(buf)?;
        self.pos += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.key.as_str()).collect()
    }

    fn seeded() -> (TempDir, KvStore) {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        for key in ["a", "b", "c", "d", "e"] {
            store.put(key.to_owned(), key.to_uppercase()).unwrap();
        }
        (dir, store)
    }

    #[test]
    fn get_put_delete() {
        let (_dir, store) = seeded();
        assert_eq!(store.get("c".to_owned()).unwrap(), Some("C".to_owned()));
        store.put("c".to_owned(), "changed".to_owned()).unwrap();
        assert_eq!(store.get("c".to_owned()).unwrap(), Some("changed".to_owned()));
        store.delete("c".to_owned()).unwrap();
        assert_eq!(store.get("c".to_owned()).unwrap(), None);
        assert!(matches!(
            store.delete("c".to_owned()),
            Err(KvsError::KeyNotFound)
        ));
    }

    #[test]
    fn range_honors_bounds_order_and_limit() {
        let (_dir, store) = seeded();
        let all = store.range(&RangeOptions::all()).unwrap();
        assert_eq!(keys(&all), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(all[0], Record::new("a", "A"));

        let inner = store.range(&RangeOptions::between("b", "d")).unwrap();
        assert_eq!(keys(&inner), vec!["b", "c", "d"]);

        let opts = RangeOptions {
            gt: Some("a".to_owned()),
            lt: Some("e".to_owned()),
            reverse: true,
            limit: Some(2),
            ..RangeOptions::default()
        };
        assert_eq!(keys(&store.range(&opts).unwrap()), vec!["d", "c"]);

        assert!(store
            .range(&RangeOptions::between("x", "a"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn batch_applies_in_order_and_ignores_missing_deletes() {
        let (_dir, store) = seeded();
        store
            .batch(vec![
                BatchOp::Put {
                    key: "f".to_owned(),
                    value: "F".to_owned(),
                },
                BatchOp::Del {
                    key: "a".to_owned(),
                },
                BatchOp::Del {
                    key: "missing".to_owned(),
                },
                BatchOp::Put {
                    key: "f".to_owned(),
                    value: "F2".to_owned(),
                },
            ])
            .unwrap();
        assert_eq!(store.get("a".to_owned()).unwrap(), None);
        assert_eq!(store.get("f".to_owned()).unwrap(), Some("F2".to_owned()));
    }

    #[test]
    fn data_survives_reopen() {
        let (dir, store) = seeded();
        store.delete("b".to_owned()).unwrap();
        drop(store);

        let store = KvStore::open(dir.path()).unwrap();
        let all = store.range(&RangeOptions::all()).unwrap();
        assert_eq!(keys(&all), vec!["a", "c", "d", "e"]);
    }

    #[test]
    fn compaction_keeps_live_data_and_shrinks_the_logs() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        let value = "x".repeat(1024);
        for round in 0..1200 {
            store
                .put(format!("key{}", round % 10), format!("{}{}", value, round))
                .unwrap();
        }

        let size: u64 = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.metadata().unwrap().len())
            .sum();
        assert!(size < COMPACTION_THRESHOLD, "logs were not compacted: {}", size);

        drop(store);
        let store = KvStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("key9".to_owned()).unwrap(),
            Some(format!("{}{}", value, 1199))
        );
    }

    #[test]
    fn approximate_size_grows_with_data() {
        let (_dir, store) = seeded();
        let small = store.approximate_size("a", "b").unwrap();
        let large = store.approximate_size("a", "e").unwrap();
        assert!(small > 0 && large > small);
        assert_eq!(store.approximate_size("z", "a").unwrap(), 0);
    }

    #[test]
    fn local_iterator_uses_the_stream_bridge() {
        let (_dir, store) = seeded();
        let opts = RangeOptions {
            start: Some("d".to_owned()),
            values: false,
            ..RangeOptions::default()
        };
        let keys: Vec<_> = store
            .iterator(opts)
            .unwrap()
            .entries()
            .map(|e| e.unwrap())
            .map(|e| (e.key, e.value))
            .collect();
        assert_eq!(
            keys,
            vec![(Some("d".to_owned()), None), (Some("e".to_owned()), None)]
        );
    }
}
