//! Append-only log `Store`, adapted from a bitcask-style log engine: writes
//! go to the tail of a single log file, a `keydir` in memory tracks each
//! live key's `(offset, length)`, and deletes append a tombstone record
//! rather than rewriting the file. Rebuilds the keydir by scanning the log
//! on open, since hint files would cost nearly as much space as they save.
//!
//! Entry framing on disk: big-endian `key_len: u32`, big-endian
//! `value_len_or_tombstone: i32` (-1 marks a tombstone), key bytes, value
//! bytes.

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::CResult;
use crate::persist::Store;

type KeyDir = BTreeMap<Vec<u8>, (u64, u32)>;

pub struct LogStore {
    path: PathBuf,
    file: std::fs::File,
    keydir: KeyDir,
}

impl LogStore {
    pub fn open(path: impl AsRef<Path>) -> CResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive()?;

        let mut store = LogStore { path, file, keydir: KeyDir::new() };
        store.keydir = store.rebuild_keydir()?;
        Ok(store)
    }

    fn rebuild_keydir(&mut self) -> CResult<KeyDir> {
        let mut keydir = KeyDir::new();
        let file_len = self.file.metadata()?.len();
        let mut len_buf = [0u8; 4];
        let mut reader = BufReader::new(&self.file);
        let mut pos = reader.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            reader.read_exact(&mut len_buf)?;
            let key_len = u32::from_be_bytes(len_buf);
            reader.read_exact(&mut len_buf)?;
            let value_len_or_tombstone = i32::from_be_bytes(len_buf);

            let value_pos = pos + 4 + 4 + key_len as u64;
            let mut key = vec![0u8; key_len as usize];
            match reader.read_exact(&mut key) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::warn!("truncating incomplete log entry at offset {pos}");
                    self.file.set_len(pos)?;
                    break;
                }
                Err(e) => return Err(e.into()),
            }

            if value_len_or_tombstone < 0 {
                keydir.remove(&key);
                pos = value_pos;
            } else {
                let value_len = value_len_or_tombstone as u32;
                if value_pos + value_len as u64 > file_len {
                    log::warn!("truncating incomplete log entry at offset {pos}");
                    self.file.set_len(pos)?;
                    break;
                }
                reader.seek_relative(value_len as i64)?;
                keydir.insert(key, (value_pos, value_len));
                pos = value_pos + value_len as u64;
            }
        }
        Ok(keydir)
    }

    fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len_or_tombstone = value.map_or(-1, |v| v.len() as i32);
        let total_len = 4 + 4 + key_len + value.map_or(0, |v| v.len() as u32);

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(total_len as usize, &self.file);
        w.write_all(&key_len.to_be_bytes())?;
        w.write_all(&value_len_or_tombstone.to_be_bytes())?;
        w.write_all(key)?;
        if let Some(value) = value {
            w.write_all(value)?;
        }
        w.flush()?;
        Ok((pos, total_len))
    }

    fn read_value(&mut self, value_pos: u64, value_len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0u8; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }
}

impl Store for LogStore {
    fn load(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        match self.keydir.get(key).copied() {
            Some((pos, len)) => Ok(Some(self.read_value(pos, len)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let (pos, total_len) = self.append(key, Some(&value))?;
        let value_len = value.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + total_len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> CResult<()> {
        self.append(key, None)?;
        self.keydir.remove(key);
        Ok(())
    }

    fn load_all(&mut self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries: Vec<_> = self.keydir.iter().map(|(k, (p, l))| (k.clone(), *p, *l)).collect();
        let mut out = Vec::with_capacity(entries.len());
        for (key, pos, len) in entries {
            out.push((key, self.read_value(pos, len)?));
        }
        Ok(out)
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(self.file.sync_all()?)
    }
}
